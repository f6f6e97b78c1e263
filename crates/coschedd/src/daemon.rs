//! Startup, signal wiring and the two subcommands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

use cosched_controller::{Controller, JobOutcome, JsonLinesLog};
use cosched_core::config::RuntimeKind;
use cosched_core::{CoreSet, CoschedConfig, JobSet};
use cosched_executor::{DockerRuntime, ProcessRuntime, Timeouts, WorkloadExecutor};
use cosched_graph::DependencyGraph;
use cosched_telemetry::{SystemSampler, find_pid_by_name, online_cores, query_stats};

const SYS_ROOT: &str = "/sys";

/// A configuration that passed every startup check.
struct Loaded {
    config: CoschedConfig,
    inventory: CoreSet,
    jobs: JobSet,
}

fn load(config_path: &Path, jobs_path: Option<&Path>) -> anyhow::Result<Loaded> {
    let config = CoschedConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let inventory = config.inventory(&online_cores(Path::new(SYS_ROOT)))?;

    // The command line wins over `jobs_file`.
    let jobs_file = jobs_path.or(config.jobs_file.as_deref());
    let extra = match jobs_file {
        Some(path) => JobSet::parse_file(path)
            .with_context(|| format!("loading jobs from {}", path.display()))?,
        None => Vec::new(),
    };

    let jobs = config.validate(&inventory, extra)?;
    Ok(Loaded {
        config,
        inventory,
        jobs,
    })
}

/// `coschedd validate`: load everything, build the graph, print the order.
pub fn validate(config_path: &Path, jobs_path: Option<&Path>) -> anyhow::Result<()> {
    let Loaded {
        config,
        inventory,
        jobs,
    } = load(config_path, jobs_path)?;
    let graph = DependencyGraph::new(&jobs)?;

    println!("inventory: {inventory}");
    println!("service:   {}", config.initial_service_cores(&inventory));
    println!("runtime:   {:?}", config.executor.runtime);
    println!("start order:");
    for (i, name) in graph.topological_order().into_iter().enumerate() {
        let prereqs = graph.prerequisites(name);
        let threads = jobs.get(name).map(|j| j.threads).unwrap_or_default();
        if prereqs.is_empty() {
            println!("  {:>2}. {name} (threads {threads})", i + 1);
        } else {
            println!(
                "  {:>2}. {name} (threads {threads}, after {})",
                i + 1,
                prereqs.join(", ")
            );
        }
    }
    Ok(())
}

/// `coschedd run`.
pub async fn run(
    config_path: &Path,
    jobs_path: Option<&Path>,
    event_log: Option<&Path>,
) -> anyhow::Result<()> {
    let Loaded {
        config,
        inventory,
        jobs,
    } = load(config_path, jobs_path)?;
    info!(
        inventory = %inventory,
        jobs = jobs.len(),
        runtime = ?config.executor.runtime,
        "cosched starting"
    );

    let executor = build_executor(&config);
    let telemetry = SystemSampler::from_config(&config);
    let mut controller = Controller::new(&config, inventory, jobs, executor, Box::new(telemetry))?;
    if let Some(path) = event_log {
        let log = JsonLinesLog::open(path)?;
        info!(path = %path.display(), "event log opened");
        controller = controller.with_event_sink(Box::new(log));
    }

    // ── Service ────────────────────────────────────────────────

    let pid = service_pid(&config)?;
    let addr = &config.service.stats_addr;
    query_stats(addr, config.telemetry.stats_timeout)
        .await
        .with_context(|| format!("service stats endpoint {addr} is not answering"))?;
    controller.attach_service(pid).await?;
    info!(pid, stats = %addr, "service attached");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(shutdown_tx));

    let summary = controller.run(shutdown_rx).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        ticks = summary.ticks,
        makespan_ms = ?summary.makespan_ms,
        completed = summary.count(JobOutcome::Completed),
        failed = summary.count(JobOutcome::Failed),
        blocked = summary.count(JobOutcome::Blocked),
        "cosched stopped"
    );
    if summary.forced_stops > 0 {
        error!(forced = summary.forced_stops, "jobs had to be killed during shutdown");
        bail!(
            "{} job(s) did not exit within the {:?} grace period",
            summary.forced_stops,
            config.executor.stop_grace
        );
    }
    Ok(())
}

fn build_executor(config: &CoschedConfig) -> WorkloadExecutor {
    let timeouts = Timeouts::from(&config.executor);
    let processes = Arc::new(ProcessRuntime::new(&config.telemetry.proc_root));
    match config.executor.runtime {
        RuntimeKind::Process => WorkloadExecutor::new(processes, timeouts),
        RuntimeKind::Docker => {
            let docker = Arc::new(DockerRuntime::new(
                &config.executor.docker_bin,
                &config.executor.container_prefix,
            ));
            WorkloadExecutor::new(docker, timeouts).with_service_runtime(processes)
        }
    }
}

fn service_pid(config: &CoschedConfig) -> anyhow::Result<u32> {
    if let Some(pid) = config.service.pid {
        return Ok(pid);
    }
    let name = config
        .service
        .process_name
        .as_deref()
        .context("[service] needs either process_name or pid")?;
    find_pid_by_name(&config.telemetry.proc_root, name)?
        .with_context(|| format!("no running process named {name:?}"))
}

/// Flip the shutdown channel on the first Ctrl-C or SIGTERM.
async fn forward_shutdown(tx: watch::Sender<bool>) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => info!("interrupt received"),
        _ = terminate => info!("SIGTERM received"),
    }
    let _ = tx.send(true);
}

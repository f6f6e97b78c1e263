//! coschedd — the cosched daemon.
//!
//! Attaches to a running latency-critical service, then runs a set of batch
//! jobs on the cores the service can spare, growing the service's share
//! whenever its latency objective is at risk.
//!
//! # Usage
//!
//! ```text
//! coschedd run --config cosched.toml [--jobs jobs.toml] [--event-log events.jsonl]
//! coschedd validate --config cosched.toml [--jobs jobs.toml]
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,cosched=debug";

#[derive(Parser)]
#[command(name = "coschedd", about = "Latency-aware co-scheduler", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until every job settles or a shutdown signal
    /// arrives.
    Run {
        /// Path to cosched.toml.
        #[arg(long)]
        config: PathBuf,

        /// Extra jobs file; overrides `jobs_file` in the config.
        #[arg(long)]
        jobs: Option<PathBuf>,

        /// Append JSON event records to this file.
        #[arg(long)]
        event_log: Option<PathBuf>,
    },

    /// Check the configuration and job graph and print the start order.
    Validate {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        jobs: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            jobs,
            event_log,
        } => daemon::run(&config, jobs.as_deref(), event_log.as_deref()).await,
        Command::Validate { config, jobs } => daemon::validate(&config, jobs.as_deref()),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => fmt.init(),
        LogFormat::Json => fmt.json().init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_optional_files() {
        let cli = Cli::try_parse_from([
            "coschedd",
            "run",
            "--config",
            "cosched.toml",
            "--event-log",
            "events.jsonl",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Run {
                config,
                jobs,
                event_log,
            } => {
                assert_eq!(config, PathBuf::from("cosched.toml"));
                assert!(jobs.is_none());
                assert_eq!(event_log, Some(PathBuf::from("events.jsonl")));
            }
            Command::Validate { .. } => panic!("parsed as validate"),
        }
    }

    #[test]
    fn config_is_required() {
        assert!(Cli::try_parse_from(["coschedd", "validate"]).is_err());
    }
}

//! Batch job definitions.
//!
//! A job set is loaded once at startup, either inline from the main config
//! (`[[jobs]]`) or from a separate jobs file with the same table layout.
//! Anything malformed is an [`ConfigError::InvalidJobDefinition`]; the
//! dependency graph itself (cycles) is checked by `cosched-graph`.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeKind;
use crate::cpuset::CoreSet;
use crate::error::{ConfigError, ConfigResult};

/// One batch workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique key.
    pub name: String,
    /// Node class the job was planned for; must match the host's if set.
    #[serde(default)]
    pub node_class: Option<String>,
    /// Thread count the job is launched with. Also the most cores it can use.
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Allowed cpuset. The job is never given cores outside it.
    #[serde(default)]
    pub cores: Option<CoreSet>,
    /// Jobs that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Container image (docker runtime).
    #[serde(default)]
    pub image: Option<String>,
    /// Command line. `{threads}` and `{cores}` are substituted at launch.
    #[serde(default)]
    pub command: Vec<String>,
}

fn default_threads() -> u32 {
    1
}

impl JobSpec {
    /// Cores this job may run on, given the host inventory.
    pub fn allowed_cores(&self, inventory: &CoreSet) -> CoreSet {
        match &self.cores {
            Some(allowed) => allowed.intersection(inventory),
            None => inventory.clone(),
        }
    }

    /// Most cores worth giving this job.
    pub fn max_cores(&self) -> usize {
        let by_threads = self.threads as usize;
        match &self.cores {
            Some(allowed) => by_threads.min(allowed.len()),
            None => by_threads,
        }
    }

    /// Command line with placeholders filled in.
    pub fn render_command(&self, cores: &CoreSet) -> Vec<String> {
        let threads = self.threads.to_string();
        let cpuset = cores.to_string();
        self.command
            .iter()
            .map(|arg| arg.replace("{threads}", &threads).replace("{cores}", &cpuset))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// Where and how jobs will run; used to validate a job set.
#[derive(Debug, Clone)]
pub struct HostContext<'a> {
    pub inventory: &'a CoreSet,
    pub node_class: Option<&'a str>,
    pub runtime: RuntimeKind,
}

/// A validated, ordered collection of jobs.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    jobs: Vec<JobSpec>,
    index: HashMap<String, usize>,
}

impl JobSet {
    /// Validate `jobs` against the host and build the set.
    pub fn new(jobs: Vec<JobSpec>, host: &HostContext<'_>) -> ConfigResult<Self> {
        let mut index = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if job.name.trim().is_empty() {
                return Err(ConfigError::job(&job.name, "name must not be empty"));
            }
            if index.insert(job.name.clone(), i).is_some() {
                return Err(ConfigError::job(&job.name, "duplicate job name"));
            }
        }

        for job in &jobs {
            validate_job(job, &index, host)?;
        }

        Ok(Self { jobs, index })
    }

    /// Parse a jobs file (`[[jobs]]` tables) without validating it.
    pub fn parse_file(path: &Path) -> ConfigResult<Vec<JobSpec>> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: JobsFile = toml::from_str(&content)?;
        Ok(file.jobs)
    }

    pub fn get(&self, name: &str) -> Option<&JobSpec> {
        self.index.get(name).map(|&i| &self.jobs[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Jobs in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &JobSpec> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn validate_job(
    job: &JobSpec,
    index: &HashMap<String, usize>,
    host: &HostContext<'_>,
) -> ConfigResult<()> {
    if job.threads == 0 {
        return Err(ConfigError::job(&job.name, "threads must be at least 1"));
    }

    if let (Some(wanted), Some(host_class)) = (job.node_class.as_deref(), host.node_class)
        && wanted != host_class
    {
        return Err(ConfigError::job(
            &job.name,
            format!("targets node class {wanted:?} but this host is {host_class:?}"),
        ));
    }

    if let Some(allowed) = &job.cores {
        if allowed.is_empty() {
            return Err(ConfigError::job(&job.name, "cpuset must not be empty"));
        }
        let outside = allowed.difference(host.inventory);
        if !outside.is_empty() {
            return Err(ConfigError::job(
                &job.name,
                format!("cores {outside} are outside the host inventory"),
            ));
        }
    }

    let mut seen = HashSet::new();
    for dep in &job.depends_on {
        if dep == &job.name {
            return Err(ConfigError::job(&job.name, "job depends on itself"));
        }
        if !index.contains_key(dep) {
            return Err(ConfigError::job(&job.name, format!("unknown prerequisite {dep:?}")));
        }
        if !seen.insert(dep) {
            return Err(ConfigError::job(&job.name, format!("prerequisite {dep:?} listed twice")));
        }
    }

    match host.runtime {
        RuntimeKind::Process if job.command.is_empty() => {
            Err(ConfigError::job(&job.name, "process runtime needs a command"))
        }
        RuntimeKind::Docker if job.image.as_deref().is_none_or(str::is_empty) => {
            Err(ConfigError::job(&job.name, "docker runtime needs an image"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            node_class: None,
            threads: 2,
            cores: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            image: None,
            command: vec!["./run".to_string(), "-n".to_string(), "{threads}".to_string()],
        }
    }

    fn host(inventory: &CoreSet) -> HostContext<'_> {
        HostContext {
            inventory,
            node_class: Some("node-c-4core"),
            runtime: RuntimeKind::Process,
        }
    }

    fn reason(err: ConfigError) -> String {
        match err {
            ConfigError::InvalidJobDefinition { reason, .. } => reason,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn valid_set_preserves_order() {
        let inv = CoreSet::range(0, 3);
        let set = JobSet::new(vec![spec("a", &[]), spec("b", &["a"])], &host(&inv)).unwrap();
        let names: Vec<_> = set.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(set.contains("b"));
        assert_eq!(set.get("b").unwrap().depends_on, vec!["a"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let inv = CoreSet::range(0, 3);
        let err = JobSet::new(vec![spec("a", &[]), spec("a", &[])], &host(&inv)).unwrap_err();
        assert_eq!(reason(err), "duplicate job name");
    }

    #[test]
    fn unknown_prerequisite_is_rejected() {
        let inv = CoreSet::range(0, 3);
        let err = JobSet::new(vec![spec("a", &["ghost"])], &host(&inv)).unwrap_err();
        assert!(reason(err).contains("ghost"));
    }

    #[test]
    fn zero_threads_is_rejected() {
        let inv = CoreSet::range(0, 3);
        let mut job = spec("a", &[]);
        job.threads = 0;
        assert!(JobSet::new(vec![job], &host(&inv)).is_err());
    }

    #[test]
    fn cores_outside_inventory_are_rejected() {
        let inv = CoreSet::range(0, 3);
        let mut job = spec("a", &[]);
        job.cores = Some(CoreSet::from([3, 4]));
        assert!(reason(JobSet::new(vec![job], &host(&inv)).unwrap_err()).contains("outside"));
    }

    #[test]
    fn node_class_mismatch_is_rejected() {
        let inv = CoreSet::range(0, 3);
        let mut job = spec("a", &[]);
        job.node_class = Some("node-a-2core".to_string());
        assert!(JobSet::new(vec![job], &host(&inv)).is_err());

        let mut job = spec("a", &[]);
        job.node_class = Some("node-c-4core".to_string());
        assert!(JobSet::new(vec![job], &host(&inv)).is_ok());
    }

    #[test]
    fn docker_runtime_requires_image() {
        let inv = CoreSet::range(0, 3);
        let ctx = HostContext {
            runtime: RuntimeKind::Docker,
            ..host(&inv)
        };
        assert!(JobSet::new(vec![spec("a", &[])], &ctx).is_err());

        let mut job = spec("a", &[]);
        job.image = Some("anakli/cca:parsec_dedup".to_string());
        assert!(JobSet::new(vec![job], &ctx).is_ok());
    }

    #[test]
    fn render_command_substitutes_placeholders() {
        let mut job = spec("a", &[]);
        job.command.push("--cpus={cores}".to_string());
        let argv = job.render_command(&CoreSet::from([1, 2, 3]));
        assert_eq!(argv, vec!["./run", "-n", "2", "--cpus=1-3"]);
    }

    #[test]
    fn max_cores_is_bounded_by_threads_and_cpuset() {
        let mut job = spec("a", &[]);
        job.threads = 4;
        assert_eq!(job.max_cores(), 4);
        job.cores = Some(CoreSet::from([2, 3]));
        assert_eq!(job.max_cores(), 2);
        assert_eq!(job.allowed_cores(&CoreSet::range(0, 2)), CoreSet::from([2]));
    }

    #[test]
    fn parse_jobs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.toml");
        std::fs::write(
            &path,
            r#"
[[jobs]]
name = "canneal"
threads = 2
cores = "2,3"
command = ["./run", "-p", "canneal"]

[[jobs]]
name = "dedup"
depends_on = ["canneal"]
command = ["./run", "-p", "dedup"]
"#,
        )
        .unwrap();

        let jobs = JobSet::parse_file(&path).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].cores, Some(CoreSet::from([2, 3])));
        assert_eq!(jobs[1].threads, 1);
    }
}

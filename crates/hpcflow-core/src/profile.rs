use crate::FlowError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_WALLTIME: &str = "240:00:00";
const TORQUE_JOB_NAME_LIMIT: usize = 15;
const JOB_NAME_HASH_CHARS: usize = 4;

/// Cores per node of the queues this deployment knows about.
pub const QUEUE_CORES: &[(&str, u32)] = &[("spst-sunzhr", 32), ("spst_pub", 28)];

pub fn cores_for_queue(queue: &str) -> Option<u32> {
    QUEUE_CORES
        .iter()
        .find(|(name, _)| *name == queue)
        .map(|(_, cores)| *cores)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Torque,
    Slurm,
}

impl SchedulerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Torque => "torque",
            Self::Slurm => "slurm",
        }
    }

    pub fn job_name_limit(self) -> Option<usize> {
        match self {
            Self::Torque => Some(TORQUE_JOB_NAME_LIMIT),
            Self::Slurm => None,
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl ConnectionSpec {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            identity_file: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// `user@host`, or the bare host when no user is configured.
    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub nodes: u32,
    pub cores_per_node: u32,
    pub walltime: String,
}

/// Immutable description of a remote batch target.
///
/// Profiles are shared between steps behind an `Arc`. Per-submission changes
/// go through [`ExecutorProfile::with_overrides`], which returns a derived copy.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutorProfile {
    pub connection: ConnectionSpec,
    pub scheduler: SchedulerKind,
    pub queue: String,
    pub resources: ResourceRequest,
    pub bootstrap: Vec<String>,
    pub directives: Vec<String>,
    pub job_name_prefix: Option<String>,
    pub job_name: Option<String>,
    pub remote_root: String,
}

impl ExecutorProfile {
    pub fn builder(queue: impl Into<String>) -> ExecutorProfileBuilder {
        ExecutorProfileBuilder::new(queue)
    }

    pub fn with_overrides(&self, overrides: &ProfileOverrides) -> ExecutorProfile {
        let mut derived = self.clone();
        if let Some(job_name) = overrides.job_name.as_ref() {
            derived.job_name = Some(job_name.clone());
        }
        if let Some(walltime) = overrides.walltime.as_ref() {
            derived.resources.walltime = walltime.clone();
        }
        derived.directives.extend(overrides.directives.iter().cloned());
        derived.bootstrap.extend(overrides.bootstrap.iter().cloned());
        derived
    }

    /// Scheduler-safe job name for a step submitted through this profile.
    pub fn job_name_for(&self, step_name: &str) -> String {
        let base = match (self.job_name.as_deref(), self.job_name_prefix.as_deref()) {
            (Some(explicit), _) if !explicit.trim().is_empty() => explicit.trim().to_string(),
            (_, Some(prefix)) if !prefix.trim().is_empty() => {
                format!("{}-{}", prefix.trim(), step_name)
            }
            _ => step_name.to_string(),
        };
        derive_job_name(&base, self.scheduler)
    }
}

pub fn derive_job_name(raw: &str, scheduler: SchedulerKind) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, 'j');
    }

    let Some(limit) = scheduler.job_name_limit() else {
        return name;
    };
    if name.len() <= limit {
        return name;
    }
    let digest = blake3::hash(raw.as_bytes()).to_hex();
    let keep = limit - JOB_NAME_HASH_CHARS - 1;
    format!(
        "{}-{}",
        &name[..keep],
        &digest.as_str()[..JOB_NAME_HASH_CHARS]
    )
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default)]
    pub directives: Vec<String>,
    #[serde(default)]
    pub bootstrap: Vec<String>,
}

impl ProfileOverrides {
    pub fn is_empty(&self) -> bool {
        self.job_name.is_none()
            && self.walltime.is_none()
            && self.directives.is_empty()
            && self.bootstrap.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorProfileBuilder {
    queue: String,
    connection: Option<ConnectionSpec>,
    scheduler: SchedulerKind,
    nodes: u32,
    cores_per_node: Option<u32>,
    walltime: String,
    bootstrap: Vec<String>,
    directives: Vec<String>,
    job_name_prefix: Option<String>,
    remote_root: Option<String>,
}

impl ExecutorProfileBuilder {
    fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            connection: None,
            scheduler: SchedulerKind::default(),
            nodes: 1,
            cores_per_node: None,
            walltime: DEFAULT_WALLTIME.to_string(),
            bootstrap: Vec::new(),
            directives: Vec::new(),
            job_name_prefix: None,
            remote_root: None,
        }
    }

    pub fn connection(mut self, connection: ConnectionSpec) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn nodes(mut self, nodes: u32) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn cores_per_node(mut self, cores: u32) -> Self {
        self.cores_per_node = Some(cores);
        self
    }

    pub fn walltime(mut self, walltime: impl Into<String>) -> Self {
        self.walltime = walltime.into();
        self
    }

    pub fn bootstrap(mut self, fragment: impl Into<String>) -> Self {
        self.bootstrap.push(fragment.into());
        self
    }

    pub fn directive(mut self, line: impl Into<String>) -> Self {
        self.directives.push(line.into());
        self
    }

    pub fn job_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_name_prefix = Some(prefix.into());
        self
    }

    pub fn remote_root(mut self, root: impl Into<String>) -> Self {
        self.remote_root = Some(root.into());
        self
    }

    pub fn build(self) -> Result<ExecutorProfile, FlowError> {
        let queue = self.queue.trim().to_string();
        if queue.is_empty() {
            return Err(FlowError::InvalidProfile(
                "queue name cannot be empty".to_string(),
            ));
        }

        let connection = self.connection.ok_or_else(|| {
            FlowError::InvalidProfile(format!("profile for queue '{queue}' has no connection"))
        })?;
        if connection.host.trim().is_empty() {
            return Err(FlowError::InvalidProfile(
                "connection host cannot be empty".to_string(),
            ));
        }
        if connection.port == 0 {
            return Err(FlowError::InvalidProfile(
                "connection port cannot be zero".to_string(),
            ));
        }

        let cores_per_node = match self.cores_per_node {
            Some(cores) => cores,
            None => cores_for_queue(&queue).ok_or_else(|| FlowError::UnknownQueue(queue.clone()))?,
        };
        if cores_per_node == 0 {
            return Err(FlowError::InvalidProfile(
                "cores per node must be at least 1".to_string(),
            ));
        }
        if self.nodes == 0 {
            return Err(FlowError::InvalidProfile(
                "node count must be at least 1".to_string(),
            ));
        }
        if !is_valid_walltime(&self.walltime) {
            return Err(FlowError::InvalidProfile(format!(
                "walltime '{}' must look like HH:MM:SS",
                self.walltime
            )));
        }

        let remote_root = self.remote_root.unwrap_or_default();
        let remote_root = remote_root.trim().trim_end_matches('/').to_string();
        if remote_root.is_empty() {
            return Err(FlowError::InvalidProfile(
                "remote root directory cannot be empty".to_string(),
            ));
        }

        Ok(ExecutorProfile {
            connection,
            scheduler: self.scheduler,
            queue,
            resources: ResourceRequest {
                nodes: self.nodes,
                cores_per_node,
                walltime: self.walltime,
            },
            bootstrap: self.bootstrap,
            directives: self.directives,
            job_name_prefix: self.job_name_prefix,
            job_name: None,
            remote_root,
        })
    }
}

fn is_valid_walltime(walltime: &str) -> bool {
    let parts: Vec<&str> = walltime.split(':').collect();
    if parts.len() != 3 {
        return false;
    }
    if parts
        .iter()
        .any(|part| part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }
    parts[1..]
        .iter()
        .all(|part| part.len() == 2 && part.parse::<u32>().is_ok_and(|value| value < 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionSpec {
        ConnectionSpec::new("cluster.example.org", "alice").port(22112)
    }

    #[test]
    fn build_known_queue_without_cores_expected_table_lookup() {
        let profile = ExecutorProfile::builder("spst_pub")
            .connection(connection())
            .remote_root("/scratch/alice/flows/")
            .build()
            .expect("profile should build");

        assert_eq!(profile.resources.cores_per_node, 28);
        assert_eq!(profile.resources.nodes, 1);
        assert_eq!(profile.resources.walltime, DEFAULT_WALLTIME);
        assert_eq!(profile.remote_root, "/scratch/alice/flows");
    }

    #[test]
    fn build_unknown_queue_without_cores_expected_unknown_queue_error() {
        let error = ExecutorProfile::builder("gpu-big")
            .connection(connection())
            .remote_root("/scratch")
            .build()
            .expect_err("unknown queue should fail");

        assert!(matches!(error, FlowError::UnknownQueue(queue) if queue == "gpu-big"));
    }

    #[test]
    fn build_unknown_queue_with_explicit_cores_expected_success() {
        let profile = ExecutorProfile::builder("gpu-big")
            .connection(connection())
            .cores_per_node(8)
            .remote_root("/scratch")
            .build()
            .expect("explicit cores should bypass the queue table");

        assert_eq!(profile.resources.cores_per_node, 8);
    }

    #[test]
    fn build_malformed_walltime_expected_invalid_profile() {
        let error = ExecutorProfile::builder("spst_pub")
            .connection(connection())
            .walltime("10h")
            .remote_root("/scratch")
            .build()
            .expect_err("walltime should be rejected");

        assert!(matches!(error, FlowError::InvalidProfile(message) if message.contains("walltime")));
    }

    #[test]
    fn with_overrides_extends_copy_and_leaves_base_untouched() {
        let base = ExecutorProfile::builder("spst-sunzhr")
            .connection(connection())
            .bootstrap("$HOME/.bashrc")
            .directive("#PBS -m n")
            .remote_root("/scratch")
            .build()
            .expect("profile should build");
        let overrides = ProfileOverrides {
            job_name: Some("Li".to_string()),
            walltime: Some("01:00:00".to_string()),
            directives: vec!["#PBS -V".to_string()],
            bootstrap: vec!["$HOME/vasp.sh".to_string()],
        };

        let derived = base.with_overrides(&overrides);

        assert_eq!(derived.bootstrap, vec!["$HOME/.bashrc", "$HOME/vasp.sh"]);
        assert_eq!(derived.directives, vec!["#PBS -m n", "#PBS -V"]);
        assert_eq!(derived.resources.walltime, "01:00:00");
        assert_eq!(derived.job_name_for("Step-Vasp-Li"), "Li");
        assert_eq!(base.bootstrap, vec!["$HOME/.bashrc"]);
        assert_eq!(base.directives, vec!["#PBS -m n"]);
        assert_eq!(base.job_name, None);
    }

    #[test]
    fn derive_job_name_torque_long_name_expected_truncated_with_hash() {
        let name = derive_job_name("Step-Vasp-Li-Li2CO3", SchedulerKind::Torque);
        assert_eq!(name.len(), 15);
        assert!(name.starts_with("Step-Vasp--"));
        assert_eq!(name, derive_job_name("Step-Vasp-Li-Li2CO3", SchedulerKind::Torque));
        assert_eq!(
            derive_job_name("Step-Vasp-Li", SchedulerKind::Torque),
            "Step-Vasp-Li"
        );
    }

    #[test]
    fn derive_job_name_sanitizes_and_requires_alphabetic_start() {
        assert_eq!(derive_job_name("1st run", SchedulerKind::Slurm), "j1st_run");
    }
}

use hpcflow_adhesion::{AdhesionSystem, DEFAULT_RECORD_FILE, WorkOfAdhesionTask, work_of_adhesion_workflow};
use hpcflow_core::{
    ArtifactKind, ConnectionSpec, Diagnostic, ExecutorProfile, OutputRef, ProfileOverrides,
    SchedulerKind, Step, WorkflowGraph,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SSH_IDENTITY_ENV: &str = "HPCFLOW_SSH_IDENTITY";
pub const SSH_USER_ENV: &str = "HPCFLOW_SSH_USER";

const DEFAULT_PLAN_ID: &str = "hpcflow-plan";
const DEFAULT_SSH_PORT: u16 = 22;

/// JSON description of a workflow: named executor profiles, remote steps,
/// work-of-adhesion aggregations and optionally a complete adhesion study.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileSpec>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub aggregations: Vec<AggregationSpec>,
    #[serde(default)]
    pub adhesion: Option<AdhesionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSpec {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    pub queue: String,
    #[serde(default)]
    pub nodes: Option<u32>,
    #[serde(default)]
    pub cores_per_node: Option<u32>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(default)]
    pub directives: Vec<String>,
    #[serde(default)]
    pub job_name_prefix: Option<String>,
    pub remote_root: String,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: String,
    pub command: String,
    pub profile: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub uploads: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub upload_dirs: BTreeMap<String, PathBuf>,
    /// Slot -> `step.slot` of an upstream output.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
    #[serde(default)]
    pub overrides: ProfileOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub path: String,
    #[serde(default = "default_output_kind")]
    pub kind: ArtifactKind,
}

fn default_output_kind() -> ArtifactKind {
    ArtifactKind::Directory
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationSpec {
    pub name: String,
    pub a: String,
    pub b: String,
    pub a_b: String,
    #[serde(default)]
    pub record_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdhesionSpec {
    pub profile: String,
    #[serde(flatten)]
    pub system: AdhesionSystem,
}

/// Connection fields taken from the environment; they win over the plan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionEnv {
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl ConnectionEnv {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|value| !value.trim().is_empty());
        Self {
            user: non_empty(SSH_USER_ENV),
            identity_file: non_empty(SSH_IDENTITY_ENV).map(PathBuf::from),
        }
    }
}

/// A graph ready to run plus the lint warnings it produced.
#[derive(Debug)]
pub struct BuiltPlan {
    pub graph: WorkflowGraph,
    pub warnings: Vec<Diagnostic>,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed reading plan '{}': {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("invalid plan '{}': {e}", path.display()))
    }

    /// Relative paths resolve against `base_dir`; adhesion INCARs are staged
    /// under `staging_dir`.
    pub fn build(
        &self,
        base_dir: &Path,
        env: &ConnectionEnv,
        staging_dir: &Path,
    ) -> Result<BuiltPlan, String> {
        let profiles = self.build_profiles(base_dir, env)?;
        let profile = |name: &str| {
            profiles
                .get(name)
                .cloned()
                .ok_or_else(|| format!("unknown profile '{name}'"))
        };

        let mut graph = match self.adhesion.as_ref() {
            Some(adhesion) => {
                let mut system = adhesion.system.clone();
                system.poscar_a = resolve(base_dir, &system.poscar_a);
                system.poscar_b = resolve(base_dir, &system.poscar_b);
                system.poscar_a_b = resolve(base_dir, &system.poscar_a_b);
                work_of_adhesion_workflow(&system, profile(&adhesion.profile)?, staging_dir)
                    .map_err(|e| e.to_string())?
            }
            None => WorkflowGraph::new(self.id.as_deref().unwrap_or(DEFAULT_PLAN_ID)),
        };

        for spec in &self.steps {
            let mut step = Step::remote(&spec.name, &spec.command)
                .profile(profile(&spec.profile)?)
                .overrides(spec.overrides.clone());
            if let Some(workdir) = spec.workdir.as_deref() {
                step = step.workdir(workdir);
            }
            for (slot, path) in &spec.uploads {
                step = step.upload_file(slot, resolve(base_dir, path));
            }
            for (slot, path) in &spec.upload_dirs {
                step = step.upload_dir(slot, resolve(base_dir, path));
            }
            for (slot, reference) in &spec.inputs {
                step = step.input_from(slot, parse_output_ref(reference)?);
            }
            for (slot, output) in &spec.outputs {
                step = match output.kind {
                    ArtifactKind::Directory => step.output_dir(slot, &output.path),
                    ArtifactKind::File => step.output_file(slot, &output.path),
                };
            }
            graph.add_step(step).map_err(|e| e.to_string())?;
        }

        for spec in &self.aggregations {
            let task = WorkOfAdhesionTask::new(
                spec.record_file.as_deref().unwrap_or(DEFAULT_RECORD_FILE),
            );
            let step = task.step(
                &spec.name,
                parse_output_ref(&spec.a)?,
                parse_output_ref(&spec.b)?,
                parse_output_ref(&spec.a_b)?,
            );
            graph.add_step(step).map_err(|e| e.to_string())?;
        }

        let warnings = graph.validate().map_err(describe_flow_error)?;
        Ok(BuiltPlan { graph, warnings })
    }

    fn build_profiles(
        &self,
        base_dir: &Path,
        env: &ConnectionEnv,
    ) -> Result<BTreeMap<String, Arc<ExecutorProfile>>, String> {
        let mut profiles = BTreeMap::new();
        for (name, spec) in &self.profiles {
            let user = env.user.clone().unwrap_or_else(|| spec.user.clone());
            let mut connection = ConnectionSpec::new(&spec.host, user).port(spec.port);
            let identity = env
                .identity_file
                .clone()
                .or_else(|| spec.identity_file.as_ref().map(|path| resolve(base_dir, path)));
            if let Some(identity) = identity {
                connection = connection.identity_file(identity);
            }

            let mut builder = ExecutorProfile::builder(&spec.queue)
                .connection(connection)
                .scheduler(spec.scheduler)
                .remote_root(&spec.remote_root);
            if let Some(nodes) = spec.nodes {
                builder = builder.nodes(nodes);
            }
            if let Some(cores) = spec.cores_per_node {
                builder = builder.cores_per_node(cores);
            }
            if let Some(walltime) = spec.walltime.as_deref() {
                builder = builder.walltime(walltime);
            }
            if let Some(prefix) = spec.job_name_prefix.as_deref() {
                builder = builder.job_name_prefix(prefix);
            }
            for fragment in &spec.bootstrap {
                builder = builder.bootstrap(fragment);
            }
            for directive in &spec.directives {
                builder = builder.directive(directive);
            }
            let profile = builder
                .build()
                .map_err(|e| format!("profile '{name}': {e}"))?;
            profiles.insert(name.clone(), Arc::new(profile));
        }
        Ok(profiles)
    }
}

/// `Step-Vasp-Li.out` -> output `out` of step `Step-Vasp-Li`. The slot is
/// everything after the last dot.
pub fn parse_output_ref(reference: &str) -> Result<OutputRef, String> {
    match reference.rsplit_once('.') {
        Some((step, slot)) if !step.is_empty() && !slot.is_empty() => {
            Ok(OutputRef::new(step, slot))
        }
        _ => Err(format!(
            "output reference '{reference}' must look like <step>.<slot>"
        )),
    }
}

pub fn describe_flow_error(error: hpcflow_core::FlowError) -> String {
    match error {
        hpcflow_core::FlowError::Validation(validation) => {
            let mut lines = vec![validation.to_string()];
            lines.extend(
                validation
                    .diagnostics
                    .iter()
                    .map(|diagnostic| format!("  {diagnostic}")),
            );
            lines.join("\n")
        }
        other => other.to_string(),
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

use crate::{VASP_OUTPUT_SLOT, VaspJob, VaspSettings, WorkOfAdhesionTask, vasp_step};
use hpcflow_core::{ExecutorProfile, FlowError, OutputRef, ProfileOverrides, WorkflowGraph};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const AGGREGATION_STEP: &str = "Step-Workofadhesion";
pub const DEFAULT_GAUSSIAN_SIGMA: f64 = 0.05;

/// Two slabs and their interface, e.g. Li, Li2CO3 and Li/Li2CO3.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdhesionSystem {
    pub label_a: String,
    pub label_b: String,
    pub poscar_a: PathBuf,
    pub poscar_b: PathBuf,
    pub poscar_a_b: PathBuf,
    /// Sourced after the profile bootstrap on every VASP job.
    #[serde(default)]
    pub vasp_bootstrap: Vec<String>,
    #[serde(default)]
    pub settings: Option<VaspSettings>,
    #[serde(default = "default_sigma")]
    pub gaussian_sigma: f64,
}

fn default_sigma() -> f64 {
    DEFAULT_GAUSSIAN_SIGMA
}

impl AdhesionSystem {
    pub fn new(
        label_a: impl Into<String>,
        label_b: impl Into<String>,
        poscar_a: impl Into<PathBuf>,
        poscar_b: impl Into<PathBuf>,
        poscar_a_b: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label_a: label_a.into(),
            label_b: label_b.into(),
            poscar_a: poscar_a.into(),
            poscar_b: poscar_b.into(),
            poscar_a_b: poscar_a_b.into(),
            vasp_bootstrap: Vec::new(),
            settings: None,
            gaussian_sigma: DEFAULT_GAUSSIAN_SIGMA,
        }
    }

    pub fn vasp_bootstrap(mut self, fragment: impl Into<String>) -> Self {
        self.vasp_bootstrap.push(fragment.into());
        self
    }

    pub fn step_name_a(&self) -> String {
        format!("Step-Vasp-{}", self.label_a)
    }

    pub fn step_name_b(&self) -> String {
        format!("Step-Vasp-{}", self.label_b)
    }

    pub fn step_name_a_b(&self) -> String {
        format!("Step-Vasp-{}-{}", self.label_a, self.label_b)
    }
}

/// Three independent VASP relaxations on `profile` followed by the local
/// work-of-adhesion aggregation. Slab `a` uses the base settings; slab `b`
/// and the interface add Gaussian smearing. INCARs are staged under
/// `staging_dir`.
pub fn work_of_adhesion_workflow(
    system: &AdhesionSystem,
    profile: Arc<ExecutorProfile>,
    staging_dir: &Path,
) -> Result<WorkflowGraph, FlowError> {
    let base = system.settings.clone().unwrap_or_default();
    let smeared = base.clone().with_gaussian_smearing(system.gaussian_sigma);
    let overrides = |job_name: String| ProfileOverrides {
        job_name: Some(job_name),
        bootstrap: system.vasp_bootstrap.clone(),
        ..ProfileOverrides::default()
    };

    let jobs = [
        VaspJob::new(system.step_name_a(), &system.poscar_a, Arc::clone(&profile))
            .settings(base)
            .overrides(overrides(system.label_a.clone())),
        VaspJob::new(system.step_name_b(), &system.poscar_b, Arc::clone(&profile))
            .settings(smeared.clone())
            .overrides(overrides(system.label_b.clone())),
        VaspJob::new(system.step_name_a_b(), &system.poscar_a_b, profile)
            .settings(smeared)
            .overrides(overrides(format!("{}-{}", system.label_a, system.label_b))),
    ];

    let mut graph = WorkflowGraph::new("wf-workofadhesion");
    for job in &jobs {
        graph.add_step(vasp_step(job, staging_dir)?)?;
    }
    graph.add_step(WorkOfAdhesionTask::default().step(
        AGGREGATION_STEP,
        OutputRef::new(system.step_name_a(), VASP_OUTPUT_SLOT),
        OutputRef::new(system.step_name_b(), VASP_OUTPUT_SLOT),
        OutputRef::new(system.step_name_a_b(), VASP_OUTPUT_SLOT),
    ))?;
    graph.validate()?;
    Ok(graph)
}

use crate::{Artifact, FlowError, JobState, StatusSnapshot, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_REPORT_FILE_NAME: &str = "run-report.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Aggregate status of a run given the status of each step.
    pub fn from_steps(statuses: &StatusSnapshot) -> Self {
        if statuses.values().any(|status| status.is_in_flight()) {
            return Self::Running;
        }
        if statuses
            .values()
            .all(|status| *status == StepStatus::Succeeded)
        {
            return Self::Succeeded;
        }
        if statuses.values().any(|status| *status == StepStatus::Failed) {
            return Self::Failed;
        }
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub status: StepStatus,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub job_state: Option<JobState>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl StepReport {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            job_id: None,
            job_name: None,
            job_state: None,
            reason: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepReport>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub elapsed_ms: u128,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.get(name)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, step)| step.status == StepStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), FlowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                FlowError::Runtime(format!(
                    "failed to create report parent directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            FlowError::Runtime(format!("failed to serialize run report: {error}"))
        })?;

        fs::write(path, bytes).map_err(|error| {
            FlowError::Runtime(format!(
                "failed writing run report '{}': {}",
                path.display(),
                error
            ))
        })
    }

    pub fn load_from_path(path: &Path) -> Result<Self, FlowError> {
        let bytes = fs::read(path).map_err(|error| {
            FlowError::Runtime(format!(
                "failed reading run report '{}': {}",
                path.display(),
                error
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            FlowError::Runtime(format!(
                "failed deserializing run report '{}': {}",
                path.display(),
                error
            ))
        })
    }
}

pub fn run_report_path(artifact_root: &Path) -> PathBuf {
    artifact_root.join(RUN_REPORT_FILE_NAME)
}

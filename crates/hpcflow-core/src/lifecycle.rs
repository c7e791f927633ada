use crate::{ArtifactKind, ConnectionSpec, FlowError, SchedulerKind, Step};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Scheduler-side state of one submitted job.
///
/// `Submitted -> Queued -> Running -> {Succeeded, Failed}`. `Unknown` marks a
/// round where the status query itself failed; it is never terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Queued,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub step: String,
    pub job_name: String,
    pub remote_dir: String,
    pub scheduler: SchedulerKind,
    pub connection: ConnectionSpec,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub detail: Option<String>,
}

impl JobStatus {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// An input already present on local disk, ready to be shipped with a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedInput {
    pub slot: String,
    pub local_path: PathBuf,
    pub kind: ArtifactKind,
}

pub type FetchedOutputs = BTreeMap<String, PathBuf>;

/// Submits remote steps and follows them to a terminal state.
#[async_trait]
pub trait JobDriver: Send + Sync {
    /// Uploads `inputs`, renders the submission script and returns the
    /// scheduler-assigned handle. Called at most once per step per run.
    async fn submit(
        &self,
        run_id: &str,
        step: &Step,
        inputs: &[StagedInput],
    ) -> Result<JobHandle, FlowError>;

    /// Side-effect free status query.
    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, FlowError>;

    /// Downloads every declared output of `step` into `local_dir`, keyed by
    /// output slot. Only valid after the job reported `Succeeded`.
    async fn fetch_result(
        &self,
        job: &JobHandle,
        step: &Step,
        local_dir: &Path,
    ) -> Result<FetchedOutputs, FlowError>;

    async fn cancel(&self, job: &JobHandle) -> Result<(), FlowError>;
}

/// Driver used when a run has no remote backend configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnconfiguredJobDriver;

#[async_trait]
impl JobDriver for UnconfiguredJobDriver {
    async fn submit(
        &self,
        _run_id: &str,
        step: &Step,
        _inputs: &[StagedInput],
    ) -> Result<JobHandle, FlowError> {
        Err(FlowError::Dispatch(format!(
            "no job driver configured for remote step '{}'",
            step.name
        )))
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, FlowError> {
        Err(FlowError::StatusQuery(format!(
            "no job driver configured for job '{}'",
            job.job_id
        )))
    }

    async fn fetch_result(
        &self,
        job: &JobHandle,
        _step: &Step,
        _local_dir: &Path,
    ) -> Result<FetchedOutputs, FlowError> {
        Err(FlowError::Transfer(format!(
            "no job driver configured for job '{}'",
            job.job_id
        )))
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), FlowError> {
        Err(FlowError::Dispatch(format!(
            "no job driver configured for job '{}'",
            job.job_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminality() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        for state in [
            JobState::Submitted,
            JobState::Queued,
            JobState::Running,
            JobState::Unknown,
        ] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unconfigured_driver_submit_expected_dispatch_error() {
        let step = Step::remote("a", "true");
        let error = UnconfiguredJobDriver
            .submit("run", &step, &[])
            .await
            .expect_err("submit should fail");
        assert!(matches!(error, FlowError::Dispatch(_)));
    }
}

use crate::{ArtifactStore, JobDriver, PollBackoff, RuntimeEventSink, UnconfiguredJobDriver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_STATUS_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_ARTIFACT_ROOT: &str = "hpcflow-artifacts";

/// Everything one run needs. Created per run and handed to the orchestrator.
#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    /// Where fetched outputs land when `artifacts` is not supplied.
    pub artifact_root: PathBuf,
    pub artifacts: Option<ArtifactStore>,
    pub poll: PollBackoff,
    pub timeout: Option<Duration>,
    /// Consecutive failed status queries tolerated before a step fails.
    pub status_retry_budget: u32,
    pub cancel: CancellationToken,
    pub events: RuntimeEventSink,
    pub driver: Arc<dyn JobDriver>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            artifact_root: PathBuf::from(DEFAULT_ARTIFACT_ROOT),
            artifacts: None,
            poll: PollBackoff::default(),
            timeout: None,
            status_retry_budget: DEFAULT_STATUS_RETRY_BUDGET,
            cancel: CancellationToken::new(),
            events: RuntimeEventSink::default(),
            driver: Arc::new(UnconfiguredJobDriver),
        }
    }
}

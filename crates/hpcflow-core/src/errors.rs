use crate::{Diagnostic, RunReport};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("step '{0}' already exists in the graph")]
    DuplicateName(String),
    #[error("step '{step}' input '{slot}' references unknown output '{producer}.{output}'")]
    UnresolvedDependency {
        step: String,
        slot: String,
        producer: String,
        output: String,
    },
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown queue '{0}' and no explicit core count was given")]
    UnknownQueue(String),
    #[error("invalid executor profile: {0}")]
    InvalidProfile(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("status query failed: {0}")]
    StatusQuery(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("step '{step}' is missing expected output '{path}'")]
    IncompleteOutput { step: String, path: String },
    #[error("artifact error: {0}")]
    Artifact(String),
    #[error("local task failed: {0}")]
    LocalTask(String),
    #[error("run '{run_id}' timed out after {elapsed_ms} ms")]
    Timeout {
        run_id: String,
        elapsed_ms: u128,
        report: Box<RunReport>,
    },
    #[error("run '{run_id}' was cancelled")]
    Cancelled {
        run_id: String,
        report: Box<RunReport>,
    },
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl FlowError {
    /// The last known run report carried by timeout and cancellation errors.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Timeout { report, .. } | Self::Cancelled { report, .. } => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}

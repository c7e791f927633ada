use hpcflow_core::FlowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot reach '{host}': {message}")]
    Connection { host: String, message: String },
    #[error("authentication to '{host}' failed: {message}")]
    Authentication { host: String, message: String },
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("`{command}` timed out after {timeout_ms} ms")]
    TimedOut { command: String, timeout_ms: u64 },
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn into_dispatch(self) -> FlowError {
        FlowError::Dispatch(self.to_string())
    }

    pub fn into_status_query(self) -> FlowError {
        FlowError::StatusQuery(self.to_string())
    }

    pub fn into_transfer(self) -> FlowError {
        FlowError::Transfer(self.to_string())
    }
}

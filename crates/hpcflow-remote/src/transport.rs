use crate::RemoteError;
use async_trait::async_trait;
use hpcflow_core::ConnectionSpec;
pub use hpcflow_core::shell_quote;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u128,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Command execution and file movement against one cluster login host.
///
/// Remote paths are plain strings in the remote shell's syntax; local paths
/// are [`Path`]s.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    fn host(&self) -> &str;

    /// Runs `command` through the remote shell. A non-zero exit is reported in
    /// the result, not as an error.
    async fn exec(&self, command: &str) -> Result<ExecResult, RemoteError>;

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError>;

    /// Copies a local file or directory tree to `remote_path`.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError>;

    /// Copies a remote file or directory tree to `local_path`.
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError>;

    async fn exec_checked(&self, command: &str) -> Result<ExecResult, RemoteError> {
        let result = self.exec(command).await?;
        if !result.success() {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }

    async fn exists(&self, remote_path: &str) -> Result<bool, RemoteError> {
        let command = format!("test -e {}", shell_quote(remote_path));
        let result = self.exec(&command).await?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            exit_code => Err(RemoteError::CommandFailed {
                command,
                exit_code,
                stderr: result.stderr.trim().to_string(),
            }),
        }
    }
}

pub type SharedTransport = Arc<dyn RemoteTransport>;

/// Opens transports for the connections named in executor profiles.
pub trait TransportProvider: Send + Sync {
    fn connect(&self, connection: &ConnectionSpec) -> Result<SharedTransport, RemoteError>;
}

/// Joins remote path segments with `/`, collapsing duplicate separators.
pub fn remote_join(base: &str, segment: &str) -> String {
    let base = base.trim_end_matches('/');
    let segment = segment.trim_start_matches("./").trim_start_matches('/');
    if segment.is_empty() || segment == "." {
        return base.to_string();
    }
    format!("{base}/{segment}")
}

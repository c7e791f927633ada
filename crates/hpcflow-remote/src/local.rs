use crate::{ExecResult, RemoteError, RemoteTransport, SharedTransport, TransportProvider};
use async_trait::async_trait;
use hpcflow_core::{ConnectionSpec, copy_tree};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

/// Treats this machine as the cluster login node: commands go through
/// `bash -c` and transfers are plain copies.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    host: String,
    shell: String,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl LocalTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            shell: "bash".to_string(),
        }
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

async fn copy_blocking(from: PathBuf, to: PathBuf) -> Result<(), RemoteError> {
    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
        .await
        .map_err(|error| RemoteError::Transfer(format!("copy task failed: {error}")))?
        .map_err(|error| RemoteError::Transfer(error.to_string()))
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&self, command: &str) -> Result<ExecResult, RemoteError> {
        let started = Instant::now();
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
            duration_ms: started.elapsed().as_millis(),
        })
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError> {
        let path = Path::new(remote_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        copy_blocking(local_path.to_path_buf(), PathBuf::from(remote_path)).await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        copy_blocking(PathBuf::from(remote_path), local_path.to_path_buf()).await
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalTransportProvider;

impl TransportProvider for LocalTransportProvider {
    fn connect(&self, connection: &ConnectionSpec) -> Result<SharedTransport, RemoteError> {
        Ok(Arc::new(LocalTransport::new(connection.host.clone())))
    }
}

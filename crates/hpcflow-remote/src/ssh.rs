use crate::{ExecResult, RemoteError, RemoteTransport, SharedTransport, TransportProvider};
use async_trait::async_trait;
use hpcflow_core::ConnectionSpec;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const SSH_CONNECTION_FAILURE_EXIT: i32 = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshOptions {
    pub ssh_program: String,
    pub scp_program: String,
    pub connect_timeout_secs: u64,
    /// Upper bound for any single ssh/scp invocation.
    pub command_timeout: Option<Duration>,
    /// Extra `-o key=value` options passed to both programs.
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            connect_timeout_secs: 15,
            command_timeout: Some(Duration::from_secs(600)),
            extra_options: Vec::new(),
        }
    }
}

/// Runs commands with the system `ssh` and moves files with `scp`, in batch
/// mode so a missing key fails instead of prompting.
#[derive(Clone, Debug)]
pub struct SshTransport {
    connection: ConnectionSpec,
    options: SshOptions,
}

impl SshTransport {
    pub fn new(connection: ConnectionSpec, options: SshOptions) -> Self {
        Self {
            connection,
            options,
        }
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
        ];
        if let Some(identity) = self.connection.identity_file.as_ref() {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &self.options.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.connection.port.to_string()];
        args.extend(self.common_options());
        args.push(self.connection.destination());
        args.push(command.to_string());
        args
    }

    pub fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            "-P".to_string(),
            self.connection.port.to_string(),
        ];
        args.extend(self.common_options());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    fn remote_spec(&self, remote_path: &str) -> String {
        format!("{}:{}", self.connection.destination(), remote_path)
    }

    async fn run(
        &self,
        program: &str,
        args: Vec<String>,
        stdin: Option<&str>,
    ) -> Result<ExecResult, RemoteError> {
        let started = Instant::now();
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        if let (Some(contents), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(contents.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = match self.options.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(RemoteError::TimedOut {
                        command: format!("{program} {}", args.join(" ")),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        let result = ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
            duration_ms: started.elapsed().as_millis(),
        };
        debug!(
            program,
            host = %self.connection.host,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms as u64,
            "remote command finished"
        );
        classify_failure(&self.connection.host, result)
    }
}

/// ssh and scp exit with 255 when the connection itself failed.
fn classify_failure(host: &str, result: ExecResult) -> Result<ExecResult, RemoteError> {
    if result.exit_code != SSH_CONNECTION_FAILURE_EXIT {
        return Ok(result);
    }
    let message = result.stderr.trim().to_string();
    if message.contains("Permission denied") || message.contains("Host key verification failed")
    {
        return Err(RemoteError::Authentication {
            host: host.to_string(),
            message,
        });
    }
    Err(RemoteError::Connection {
        host: host.to_string(),
        message,
    })
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn host(&self) -> &str {
        &self.connection.host
    }

    async fn exec(&self, command: &str) -> Result<ExecResult, RemoteError> {
        self.run(&self.options.ssh_program, self.ssh_args(command), None)
            .await
    }

    async fn write_file(&self, remote_path: &str, contents: &str) -> Result<(), RemoteError> {
        let command = format!("cat > {}", crate::shell_quote(remote_path));
        let result = self
            .run(
                &self.options.ssh_program,
                self.ssh_args(&command),
                Some(contents),
            )
            .await?;
        if !result.success() {
            return Err(RemoteError::Transfer(format!(
                "writing '{remote_path}' on '{}' failed: {}",
                self.connection.host,
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let args = self.scp_args(&local_path.display().to_string(), &self.remote_spec(remote_path));
        let result = self.run(&self.options.scp_program, args, None).await?;
        if !result.success() {
            return Err(RemoteError::Transfer(format!(
                "upload of '{}' to '{}:{remote_path}' failed: {}",
                local_path.display(),
                self.connection.host,
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        let args = self.scp_args(&self.remote_spec(remote_path), &local_path.display().to_string());
        let result = self.run(&self.options.scp_program, args, None).await?;
        if !result.success() {
            return Err(RemoteError::Transfer(format!(
                "download of '{}:{remote_path}' to '{}' failed: {}",
                self.connection.host,
                local_path.display(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SshTransportProvider {
    options: SshOptions,
}

impl SshTransportProvider {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

impl TransportProvider for SshTransportProvider {
    fn connect(&self, connection: &ConnectionSpec) -> Result<SharedTransport, RemoteError> {
        if connection.host.trim().is_empty() {
            return Err(RemoteError::Connection {
                host: connection.host.clone(),
                message: "empty host".to_string(),
            });
        }
        Ok(Arc::new(SshTransport::new(
            connection.clone(),
            self.options.clone(),
        )))
    }
}

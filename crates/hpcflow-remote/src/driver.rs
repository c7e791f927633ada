use crate::{
    EXIT_MARKER_FILE, LocalTransportProvider, RemoteError, SCRIPT_FILE_NAME, SchedulerPhase,
    ScriptSpec, SharedTransport, SshOptions, SshTransportProvider, TransportProvider,
    parse_exit_marker, remote_join, render_script, scheduler_for, shell_quote,
};
use async_trait::async_trait;
use hpcflow_core::{
    ConnectionSpec, ExecutorProfile, FetchedOutputs, FlowError, JobDriver, JobHandle, JobState,
    JobStatus, StagedInput, Step, StepTemplate,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// [`JobDriver`] that submits steps to a batch scheduler over a
/// [`RemoteTransport`](crate::RemoteTransport).
///
/// Each step runs in `<remote_root>/<run_id>/<workdir>`. Inputs are copied
/// there under their file names, the rendered script is written next to them
/// and handed to the scheduler. Once the scheduler stops listing the job, the
/// exit marker written by the script decides between success and failure.
pub struct RemoteJobDriver {
    provider: Arc<dyn TransportProvider>,
    transports: Mutex<BTreeMap<String, SharedTransport>>,
}

impl RemoteJobDriver {
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        Self {
            provider,
            transports: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn ssh(options: SshOptions) -> Self {
        Self::new(Arc::new(SshTransportProvider::new(options)))
    }

    pub fn local() -> Self {
        Self::new(Arc::new(LocalTransportProvider))
    }

    pub fn remote_dir(profile: &ExecutorProfile, run_id: &str, step: &Step) -> String {
        remote_join(&remote_join(&profile.remote_root, run_id), &step.workdir)
    }

    fn transport(&self, connection: &ConnectionSpec) -> Result<SharedTransport, RemoteError> {
        let key = format!("{}:{}", connection.destination(), connection.port);
        let mut transports = self
            .transports
            .lock()
            .map_err(|_| RemoteError::Scheduler("transport cache lock poisoned".to_string()))?;
        if let Some(transport) = transports.get(&key) {
            return Ok(Arc::clone(transport));
        }
        let transport = self.provider.connect(connection)?;
        transports.insert(key, Arc::clone(&transport));
        Ok(transport)
    }

    async fn upload_inputs(
        &self,
        transport: &SharedTransport,
        remote_dir: &str,
        inputs: &[StagedInput],
    ) -> Result<Vec<(String, String)>, RemoteError> {
        let mut names = BTreeSet::new();
        let mut uploaded = Vec::with_capacity(inputs.len());
        for input in inputs {
            let name = input
                .local_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .ok_or_else(|| {
                    RemoteError::Transfer(format!(
                        "input '{}' path '{}' has no file name",
                        input.slot,
                        input.local_path.display()
                    ))
                })?;
            if !names.insert(name.clone()) {
                return Err(RemoteError::Transfer(format!(
                    "input '{}' would overwrite another input named '{name}'",
                    input.slot
                )));
            }
            let remote_path = remote_join(remote_dir, &name);
            transport.upload(&input.local_path, &remote_path).await?;
            debug!(
                slot = %input.slot,
                local = %input.local_path.display(),
                remote = %remote_path,
                "input uploaded"
            );
            uploaded.push((input.slot.clone(), remote_path));
        }
        Ok(uploaded)
    }

    async fn read_exit_marker(
        &self,
        transport: &SharedTransport,
        job: &JobHandle,
    ) -> Result<JobStatus, RemoteError> {
        let marker = remote_join(&job.remote_dir, EXIT_MARKER_FILE);
        let result = transport
            .exec(&format!("cat {}", shell_quote(&marker)))
            .await?;
        if !result.success() {
            return Ok(JobStatus::new(JobState::Failed).with_detail(format!(
                "job {} left the queue without writing {EXIT_MARKER_FILE}",
                job.job_id
            )));
        }
        let status = match parse_exit_marker(&result.stdout) {
            Some(0) => JobStatus::new(JobState::Succeeded),
            Some(code) => JobStatus::new(JobState::Failed)
                .with_detail(format!("job {} exited with code {code}", job.job_id)),
            None => JobStatus::new(JobState::Failed).with_detail(format!(
                "job {} wrote an unreadable exit marker '{}'",
                job.job_id,
                result.stdout.trim()
            )),
        };
        Ok(status)
    }
}

#[async_trait]
impl JobDriver for RemoteJobDriver {
    async fn submit(
        &self,
        run_id: &str,
        step: &Step,
        inputs: &[StagedInput],
    ) -> Result<JobHandle, FlowError> {
        let StepTemplate::Remote { command } = &step.template else {
            return Err(FlowError::Dispatch(format!(
                "step '{}' is not a remote step",
                step.name
            )));
        };
        let base = step.profile.as_ref().ok_or_else(|| {
            FlowError::Dispatch(format!("step '{}' has no executor profile", step.name))
        })?;
        let profile = base.with_overrides(&step.overrides);
        let transport = self
            .transport(&profile.connection)
            .map_err(RemoteError::into_dispatch)?;

        let remote_dir = Self::remote_dir(&profile, run_id, step);
        transport
            .exec_checked(&format!("mkdir -p {}", shell_quote(&remote_dir)))
            .await
            .map_err(RemoteError::into_dispatch)?;
        let remote_inputs = self
            .upload_inputs(&transport, &remote_dir, inputs)
            .await
            .map_err(RemoteError::into_dispatch)?;

        let scheduler = scheduler_for(profile.scheduler);
        let job_name = profile.job_name_for(&step.name);
        let script = render_script(
            scheduler,
            &ScriptSpec {
                job_name: &job_name,
                profile: &profile,
                remote_dir: &remote_dir,
                command,
                inputs: &remote_inputs,
            },
        );
        transport
            .write_file(&remote_join(&remote_dir, SCRIPT_FILE_NAME), &script)
            .await
            .map_err(RemoteError::into_dispatch)?;

        let submitted = transport
            .exec_checked(&format!(
                "cd {} && {}",
                shell_quote(&remote_dir),
                scheduler.submit_command(SCRIPT_FILE_NAME)
            ))
            .await
            .map_err(RemoteError::into_dispatch)?;
        let job_id = scheduler
            .parse_job_id(&submitted.stdout)
            .map_err(RemoteError::into_dispatch)?;

        info!(
            step = %step.name,
            job_id = %job_id,
            job_name = %job_name,
            host = %profile.connection.host,
            queue = %profile.queue,
            scheduler = %profile.scheduler,
            remote_dir = %remote_dir,
            "submitted batch job"
        );
        Ok(JobHandle {
            job_id,
            step: step.name.clone(),
            job_name,
            remote_dir,
            scheduler: profile.scheduler,
            connection: profile.connection.clone(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, FlowError> {
        let transport = self
            .transport(&job.connection)
            .map_err(RemoteError::into_status_query)?;
        let scheduler = scheduler_for(job.scheduler);
        let result = transport
            .exec(&scheduler.status_command(&job.job_id))
            .await
            .map_err(RemoteError::into_status_query)?;
        match scheduler
            .parse_status(&result)
            .map_err(RemoteError::into_status_query)?
        {
            SchedulerPhase::Listed(state) => Ok(JobStatus::new(state)),
            SchedulerPhase::Gone => self
                .read_exit_marker(&transport, job)
                .await
                .map_err(RemoteError::into_status_query),
        }
    }

    async fn fetch_result(
        &self,
        job: &JobHandle,
        step: &Step,
        local_dir: &Path,
    ) -> Result<FetchedOutputs, FlowError> {
        let transport = self
            .transport(&job.connection)
            .map_err(RemoteError::into_transfer)?;
        let mut fetched = FetchedOutputs::new();
        for (slot, output) in &step.outputs {
            let remote_path = remote_join(&job.remote_dir, &output.path);
            let present = transport
                .exists(&remote_path)
                .await
                .map_err(RemoteError::into_transfer)?;
            if !present {
                return Err(FlowError::IncompleteOutput {
                    step: step.name.clone(),
                    path: output.path.clone(),
                });
            }

            let local_path = local_dir.join(&output.path);
            if let Ok(metadata) = tokio::fs::symlink_metadata(&local_path).await {
                let removed = if metadata.is_dir() {
                    tokio::fs::remove_dir_all(&local_path).await
                } else {
                    tokio::fs::remove_file(&local_path).await
                };
                removed.map_err(|error| {
                    FlowError::Transfer(format!(
                        "failed to clear stale '{}': {}",
                        local_path.display(),
                        error
                    ))
                })?;
            }
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|error| {
                    FlowError::Transfer(format!(
                        "failed to create '{}': {}",
                        parent.display(),
                        error
                    ))
                })?;
            }
            transport
                .download(&remote_path, &local_path)
                .await
                .map_err(RemoteError::into_transfer)?;
            debug!(
                step = %step.name,
                slot = %slot,
                remote = %remote_path,
                local = %local_path.display(),
                "output downloaded"
            );
            fetched.insert(slot.clone(), local_path);
        }
        Ok(fetched)
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), FlowError> {
        let transport = self
            .transport(&job.connection)
            .map_err(RemoteError::into_dispatch)?;
        transport
            .exec_checked(&scheduler_for(job.scheduler).cancel_command(&job.job_id))
            .await
            .map_err(RemoteError::into_dispatch)?;
        info!(step = %job.step, job_id = %job.job_id, "cancelled batch job");
        Ok(())
    }
}

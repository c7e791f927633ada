use crate::events::EventEmitter;
use crate::{
    Artifact, ArtifactEvent, ArtifactId, ArtifactLocation, ArtifactStore, FetchedOutputs,
    FlowError, JobDriver, JobHandle, JobState, JobStatus, RunConfig, RunEvent, RunReport,
    RunStatus, Step, StepEvent, StepReport, StepStatus, StepTemplate, WorkflowGraph,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Drives a [`WorkflowGraph`] to completion.
///
/// Each round polls every in-flight job, fetches the outputs of jobs that
/// succeeded, then releases newly ready steps: local steps run in-process,
/// remote steps are submitted through the configured [`JobDriver`]. Rounds
/// are separated by the configured poll interval while anything is in flight.
///
/// A failed step never aborts the run. Its dependents stay pending and are
/// reported as blocked, and the returned [`RunReport`] carries
/// [`RunStatus::Failed`]. Timeout and cancellation are errors that carry the
/// last report; submitted jobs are left alone on the cluster.
#[derive(Debug, Default)]
pub struct Orchestrator;

impl Orchestrator {
    pub async fn run(
        &self,
        graph: &mut WorkflowGraph,
        mut config: RunConfig,
    ) -> Result<RunReport, FlowError> {
        for diagnostic in graph.validate()? {
            warn!(graph_id = %graph.id(), "{diagnostic}");
        }

        let run_id = config
            .run_id
            .take()
            .unwrap_or_else(|| format!("{}-run", graph.id()));
        let store = match config.artifacts.take() {
            Some(store) => store,
            None => ArtifactStore::new(config.artifact_root.clone())?,
        };
        store.declare(graph.steps())?;

        let mut run = ActiveRun {
            tracking: graph
                .steps()
                .map(|step| (step.name.clone(), StepTracking::default()))
                .collect(),
            graph,
            run_id,
            store,
            driver: Arc::clone(&config.driver),
            events: EventEmitter::new(config.events.clone()),
            status_retry_budget: config.status_retry_budget,
            started: Instant::now(),
        };

        info!(
            run_id = %run.run_id,
            graph_id = %run.graph.id(),
            steps = run.graph.len(),
            "workflow run started"
        );
        run.events.run(RunEvent::Started {
            run_id: run.run_id.clone(),
            graph_id: run.graph.id().to_string(),
            step_count: run.graph.len(),
        });

        let mut round: u32 = 0;
        loop {
            if config.cancel.is_cancelled() {
                let report = run.report()?;
                warn!(run_id = %run.run_id, "workflow run cancelled");
                run.events.run(RunEvent::Cancelled {
                    run_id: run.run_id.clone(),
                    graph_id: run.graph.id().to_string(),
                });
                return Err(FlowError::Cancelled {
                    run_id: run.run_id,
                    report: Box::new(report),
                });
            }
            if config
                .timeout
                .is_some_and(|timeout| run.started.elapsed() >= timeout)
            {
                let report = run.report()?;
                let elapsed_ms = run.started.elapsed().as_millis();
                warn!(
                    run_id = %run.run_id,
                    elapsed_ms = elapsed_ms as u64,
                    in_flight = run.in_flight_count(),
                    "workflow run timed out; submitted jobs keep running"
                );
                run.events.run(RunEvent::TimedOut {
                    run_id: run.run_id.clone(),
                    graph_id: run.graph.id().to_string(),
                    elapsed_ms,
                });
                return Err(FlowError::Timeout {
                    run_id: run.run_id,
                    elapsed_ms,
                    report: Box::new(report),
                });
            }

            run.poll_in_flight().await?;

            let ready = run.release_ready()?;
            let (local, remote): (Vec<String>, Vec<String>) = ready.into_iter().partition(|name| {
                run.graph
                    .step(name)
                    .is_some_and(|step| step.template.is_local())
            });
            run.run_local_steps(&local).await?;
            run.submit_remote_steps(&remote).await?;

            let in_flight = run.in_flight_count();
            let more_ready = !run.graph.ready_steps(&run.graph.statuses()).is_empty();
            if in_flight == 0 && !more_ready {
                break;
            }
            if in_flight == 0 {
                continue;
            }

            round = round.saturating_add(1);
            let mut interval = config.poll.interval_for_round(round);
            if let Some(timeout) = config.timeout {
                interval = interval.min(timeout.saturating_sub(run.started.elapsed()));
            }
            debug!(
                run_id = %run.run_id,
                round,
                in_flight,
                interval_ms = interval.as_millis() as u64,
                "waiting for next poll round"
            );
            tokio::select! {
                _ = config.cancel.cancelled() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }

        let report = run.report()?;
        match report.status {
            RunStatus::Succeeded => {
                info!(
                    run_id = %run.run_id,
                    elapsed_ms = report.elapsed_ms as u64,
                    "workflow run succeeded"
                );
                run.events.run(RunEvent::Completed {
                    run_id: run.run_id.clone(),
                    graph_id: run.graph.id().to_string(),
                    elapsed_ms: report.elapsed_ms,
                });
            }
            _ => {
                let failed_steps: Vec<String> =
                    report.failed_steps().into_iter().map(str::to_string).collect();
                warn!(
                    run_id = %run.run_id,
                    failed = ?failed_steps,
                    "workflow run finished with failures"
                );
                run.events.run(RunEvent::Failed {
                    run_id: run.run_id.clone(),
                    graph_id: run.graph.id().to_string(),
                    failed_steps,
                });
            }
        }
        Ok(report)
    }
}

#[derive(Clone, Debug, Default)]
struct StepTracking {
    job: Option<JobHandle>,
    job_state: Option<JobState>,
    reason: Option<String>,
    unknown_streak: u32,
}

struct ActiveRun<'g> {
    graph: &'g mut WorkflowGraph,
    run_id: String,
    store: ArtifactStore,
    driver: Arc<dyn JobDriver>,
    events: EventEmitter,
    status_retry_budget: u32,
    tracking: BTreeMap<String, StepTracking>,
    started: Instant,
}

impl ActiveRun<'_> {
    fn in_flight_count(&self) -> usize {
        self.graph
            .steps()
            .filter(|step| step.status.is_in_flight())
            .count()
    }

    fn tracking_mut(&mut self, name: &str) -> &mut StepTracking {
        self.tracking.entry(name.to_string()).or_default()
    }

    fn release_ready(&mut self) -> Result<Vec<String>, FlowError> {
        let names: Vec<String> = self
            .graph
            .ready_steps(&self.graph.statuses())
            .into_iter()
            .map(|step| step.name.clone())
            .collect();
        for name in &names {
            self.graph.set_status(name, StepStatus::Ready)?;
            debug!(run_id = %self.run_id, step = %name, "step ready");
            self.events.step(StepEvent::Ready {
                run_id: self.run_id.clone(),
                step: name.clone(),
            });
        }
        Ok(names)
    }

    async fn run_local_steps(&mut self, names: &[String]) -> Result<(), FlowError> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            self.graph.set_status(name, StepStatus::Running)?;
        }
        let results = {
            let this = &*self;
            join_all(
                names
                    .iter()
                    .filter_map(|name| this.graph.step(name))
                    .map(|step| async move { (step.name.clone(), this.execute_local(step).await) }),
            )
            .await
        };
        for (name, result) in results {
            match result {
                Ok(artifacts) => self.complete_step(&name, artifacts)?,
                Err(error) => self.fail_step(&name, error.to_string())?,
            }
        }
        Ok(())
    }

    async fn execute_local(&self, step: &Step) -> Result<Vec<Artifact>, FlowError> {
        let StepTemplate::Local(task) = &step.template else {
            return Err(FlowError::Runtime(format!(
                "step '{}' is not a local step",
                step.name
            )));
        };
        let inputs = self.store.local_inputs(step)?;
        let output_dir = self.store.step_dir(step);
        fs::create_dir_all(&output_dir).map_err(|error| {
            FlowError::Artifact(format!(
                "failed to create '{}': {}",
                output_dir.display(),
                error
            ))
        })?;
        debug!(run_id = %self.run_id, step = %step.name, task = task.name(), "running local task");
        task.run(&inputs, &output_dir).await?;

        let produced: FetchedOutputs = step
            .outputs
            .iter()
            .map(|(slot, output)| (slot.clone(), output_dir.join(&output.path)))
            .collect();
        self.register_outputs(step, &produced)
    }

    async fn submit_remote_steps(&mut self, names: &[String]) -> Result<(), FlowError> {
        if names.is_empty() {
            return Ok(());
        }
        let results = {
            let this = &*self;
            join_all(
                names
                    .iter()
                    .filter_map(|name| this.graph.step(name))
                    .map(|step| async move { (step.name.clone(), this.submit_one(step).await) }),
            )
            .await
        };
        for (name, result) in results {
            let job = match result {
                Ok(job) => job,
                Err(error) => {
                    self.fail_step(&name, error.to_string())?;
                    continue;
                }
            };
            if let Some(step) = self.graph.step(&name) {
                for (slot, output) in &step.outputs {
                    self.store.mark_in_flight(
                        &step.output(slot.clone()),
                        job.connection.host.clone(),
                        format!("{}/{}", job.remote_dir, output.path),
                    )?;
                }
            }
            self.graph.set_status(&name, StepStatus::Submitted)?;
            info!(
                run_id = %self.run_id,
                step = %name,
                job_id = %job.job_id,
                job_name = %job.job_name,
                "job submitted"
            );
            self.events.step(StepEvent::Submitted {
                run_id: self.run_id.clone(),
                step: name.clone(),
                job_id: job.job_id.clone(),
                job_name: job.job_name.clone(),
            });
            let tracking = self.tracking_mut(&name);
            tracking.job = Some(job);
            tracking.job_state = Some(JobState::Submitted);
        }
        Ok(())
    }

    async fn submit_one(&self, step: &Step) -> Result<JobHandle, FlowError> {
        let inputs = self.store.stage_inputs(step)?;
        self.driver.submit(&self.run_id, step, &inputs).await
    }

    async fn poll_in_flight(&mut self) -> Result<(), FlowError> {
        let in_flight: Vec<(String, JobHandle)> = self
            .graph
            .steps()
            .filter(|step| step.status.is_in_flight())
            .filter_map(|step| {
                self.tracking
                    .get(&step.name)
                    .and_then(|tracking| tracking.job.clone())
                    .map(|job| (step.name.clone(), job))
            })
            .collect();
        if in_flight.is_empty() {
            return Ok(());
        }

        let driver = Arc::clone(&self.driver);
        let polls = join_all(in_flight.iter().map(|(name, job)| {
            let driver = &driver;
            async move { (name.clone(), driver.poll(job).await) }
        }))
        .await;

        let mut finished = Vec::new();
        for ((name, result), (_, job)) in polls.into_iter().zip(in_flight) {
            let status = result.unwrap_or_else(|error| {
                JobStatus::new(JobState::Unknown).with_detail(error.to_string())
            });
            if status.state == JobState::Unknown {
                self.note_unknown(&name, &job, status.detail)?;
                continue;
            }

            self.tracking_mut(&name).unknown_streak = 0;
            self.record_job_state(&name, &job, status.state, status.detail.clone());
            match status.state {
                JobState::Submitted | JobState::Queued => {
                    self.graph.set_status(&name, StepStatus::Submitted)?;
                }
                JobState::Running => self.graph.set_status(&name, StepStatus::Running)?,
                JobState::Succeeded => finished.push((name, job)),
                JobState::Failed => {
                    let reason = status
                        .detail
                        .unwrap_or_else(|| format!("job {} failed", job.job_id));
                    self.fail_step(&name, reason)?;
                }
                JobState::Unknown => {}
            }
        }

        if finished.is_empty() {
            return Ok(());
        }
        let results = {
            let this = &*self;
            join_all(
                finished
                    .iter()
                    .filter_map(|(name, job)| this.graph.step(name).map(|step| (step, job)))
                    .map(|(step, job)| async move {
                        (step.name.clone(), this.fetch_outputs(step, job).await)
                    }),
            )
            .await
        };
        for (name, result) in results {
            match result {
                Ok(artifacts) => self.complete_step(&name, artifacts)?,
                Err(error) => self.fail_step(&name, error.to_string())?,
            }
        }
        Ok(())
    }

    async fn fetch_outputs(&self, step: &Step, job: &JobHandle) -> Result<Vec<Artifact>, FlowError> {
        let local_dir = self.store.step_dir(step);
        fs::create_dir_all(&local_dir).map_err(|error| {
            FlowError::Transfer(format!(
                "failed to create '{}': {}",
                local_dir.display(),
                error
            ))
        })?;
        let fetched = self.driver.fetch_result(job, step, &local_dir).await?;
        self.register_outputs(step, &fetched)
    }

    fn register_outputs(
        &self,
        step: &Step,
        produced: &FetchedOutputs,
    ) -> Result<Vec<Artifact>, FlowError> {
        let mut artifacts = Vec::with_capacity(step.outputs.len());
        for (slot, output) in &step.outputs {
            let path = produced
                .get(slot)
                .ok_or_else(|| FlowError::IncompleteOutput {
                    step: step.name.clone(),
                    path: output.path.clone(),
                })?;
            artifacts.push(self.store.register_output(
                &step.output(slot.clone()),
                output.kind,
                path,
            )?);
        }
        Ok(artifacts)
    }

    fn record_job_state(
        &mut self,
        name: &str,
        job: &JobHandle,
        state: JobState,
        detail: Option<String>,
    ) {
        let tracking = self.tracking_mut(name);
        if tracking.job_state == Some(state) {
            return;
        }
        tracking.job_state = Some(state);
        debug!(run_id = %self.run_id, step = %name, job_id = %job.job_id, state = %state, "job state changed");
        self.events.step(StepEvent::StateChanged {
            run_id: self.run_id.clone(),
            step: name.to_string(),
            job_id: job.job_id.clone(),
            state: state.as_str().to_string(),
            detail,
        });
    }

    fn note_unknown(
        &mut self,
        name: &str,
        job: &JobHandle,
        detail: Option<String>,
    ) -> Result<(), FlowError> {
        let detail = detail.unwrap_or_else(|| "scheduler reported no state".to_string());
        self.record_job_state(name, job, JobState::Unknown, Some(detail.clone()));
        let tracking = self.tracking_mut(name);
        tracking.unknown_streak += 1;
        let streak = tracking.unknown_streak;
        warn!(
            run_id = %self.run_id,
            step = %name,
            job_id = %job.job_id,
            streak,
            error = %detail,
            "job status query failed"
        );
        if streak > self.status_retry_budget {
            self.fail_step(
                name,
                format!("job {} status unknown after {streak} consecutive failed queries: {detail}", job.job_id),
            )?;
        }
        Ok(())
    }

    fn complete_step(&mut self, name: &str, artifacts: Vec<Artifact>) -> Result<(), FlowError> {
        self.graph.set_status(name, StepStatus::Succeeded)?;
        for artifact in artifacts {
            let ArtifactId::Output { step, slot } = &artifact.id else {
                continue;
            };
            let path = match &artifact.location {
                ArtifactLocation::Local { path } => path.display().to_string(),
                ArtifactLocation::Remote { path, .. } => path.clone(),
            };
            self.events.artifact(ArtifactEvent::Registered {
                run_id: self.run_id.clone(),
                step: step.clone(),
                slot: slot.clone(),
                path,
                version: artifact.version,
            });
        }
        info!(run_id = %self.run_id, step = %name, "step succeeded");
        self.events.step(StepEvent::Succeeded {
            run_id: self.run_id.clone(),
            step: name.to_string(),
        });
        Ok(())
    }

    fn fail_step(&mut self, name: &str, reason: String) -> Result<(), FlowError> {
        self.graph.set_status(name, StepStatus::Failed)?;
        let blocked = self.graph.transitive_dependents(name);
        warn!(
            run_id = %self.run_id,
            step = %name,
            reason = %reason,
            blocked = blocked.len(),
            "step failed"
        );
        self.events.step(StepEvent::Failed {
            run_id: self.run_id.clone(),
            step: name.to_string(),
            reason: reason.clone(),
        });
        self.tracking_mut(name).reason = Some(reason);
        Ok(())
    }

    fn report(&self) -> Result<RunReport, FlowError> {
        let statuses = self.graph.statuses();
        let failed: Vec<&str> = statuses
            .iter()
            .filter(|(_, status)| **status == StepStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect();

        let mut steps = BTreeMap::new();
        for (name, status) in &statuses {
            let tracking = self.tracking.get(name).cloned().unwrap_or_default();
            let mut report = StepReport::new(*status);
            report.job_id = tracking.job.as_ref().map(|job| job.job_id.clone());
            report.job_name = tracking.job.as_ref().map(|job| job.job_name.clone());
            report.job_state = tracking.job_state;
            report.reason = tracking.reason;
            if *status == StepStatus::Pending && report.reason.is_none() {
                report.reason = failed
                    .iter()
                    .find(|upstream| self.graph.transitive_dependents(upstream).contains(name))
                    .map(|upstream| format!("blocked by failed dependency '{upstream}'"));
            }
            steps.insert(name.clone(), report);
        }

        Ok(RunReport {
            run_id: self.run_id.clone(),
            graph_id: self.graph.id().to_string(),
            status: RunStatus::from_steps(&statuses),
            steps,
            artifacts: self.store.list()?,
            elapsed_ms: self.started.elapsed().as_millis(),
        })
    }
}

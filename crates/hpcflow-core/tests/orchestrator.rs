use async_trait::async_trait;
use hpcflow_core::{
    ArtifactId, ArtifactStore, ConnectionSpec, ExecutorProfile, FetchedOutputs, FlowError,
    JobDriver, JobHandle, JobState, JobStatus, LocalInputs, LocalTask, Orchestrator, OutputRef,
    PollBackoff, RunConfig, RunStatus, RuntimeEvent, RuntimeEventKind, RuntimeEventSink,
    SchedulerKind, SharedRuntimeEventObserver, StagedInput, Step, StepEvent, StepStatus,
    WorkflowGraph,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

type PollScript = VecDeque<Result<JobState, String>>;

/// Replays a per-step script of poll results; the last entry repeats.
#[derive(Default)]
struct ScriptedDriver {
    scripts: Mutex<BTreeMap<String, PollScript>>,
    reject_submit: BTreeSet<String>,
    skip_outputs: BTreeSet<String>,
    submissions: Mutex<Vec<(String, Vec<StagedInput>)>>,
    polls: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    fn script(self, step: &str, states: &[Result<JobState, &str>]) -> Self {
        let script = states
            .iter()
            .copied()
            .map(|state| state.map_err(str::to_string))
            .collect();
        self.scripts
            .lock()
            .expect("scripts mutex should lock")
            .insert(step.to_string(), script);
        self
    }

    fn reject(mut self, step: &str) -> Self {
        self.reject_submit.insert(step.to_string());
        self
    }

    fn skip_outputs(mut self, step: &str) -> Self {
        self.skip_outputs.insert(step.to_string());
        self
    }

    fn submitted(&self) -> Vec<String> {
        self.submissions
            .lock()
            .expect("submissions mutex should lock")
            .iter()
            .map(|(step, _)| step.clone())
            .collect()
    }
}

#[async_trait]
impl JobDriver for ScriptedDriver {
    async fn submit(
        &self,
        run_id: &str,
        step: &Step,
        inputs: &[StagedInput],
    ) -> Result<JobHandle, FlowError> {
        if self.reject_submit.contains(&step.name) {
            return Err(FlowError::Dispatch(format!(
                "qsub: Unknown queue for '{}'",
                step.name
            )));
        }
        for input in inputs {
            assert!(
                input.local_path.exists(),
                "input '{}' of '{}' staged before it exists",
                input.slot,
                step.name
            );
        }
        let mut submissions = self
            .submissions
            .lock()
            .expect("submissions mutex should lock");
        submissions.push((step.name.clone(), inputs.to_vec()));
        Ok(JobHandle {
            job_id: format!("{}.mgr", 100 + submissions.len()),
            step: step.name.clone(),
            job_name: step.name.clone(),
            remote_dir: format!("/scratch/{run_id}/{}", step.workdir),
            scheduler: SchedulerKind::Torque,
            connection: ConnectionSpec::new("cluster.example", "flow"),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, FlowError> {
        self.polls
            .lock()
            .expect("polls mutex should lock")
            .push(job.step.clone());
        let mut scripts = self.scripts.lock().expect("scripts mutex should lock");
        let script = scripts.entry(job.step.clone()).or_default();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match next.unwrap_or(Ok(JobState::Succeeded)) {
            Ok(state) => Ok(JobStatus::new(state)),
            Err(message) => Err(FlowError::StatusQuery(message)),
        }
    }

    async fn fetch_result(
        &self,
        _job: &JobHandle,
        step: &Step,
        local_dir: &Path,
    ) -> Result<FetchedOutputs, FlowError> {
        let mut fetched = BTreeMap::new();
        for (slot, output) in &step.outputs {
            if self.skip_outputs.contains(&step.name) {
                return Err(FlowError::IncompleteOutput {
                    step: step.name.clone(),
                    path: output.path.clone(),
                });
            }
            let path = local_dir.join(&output.path);
            fs::create_dir_all(&path).expect("output dir should create");
            fs::write(path.join("OUTCAR"), format!("{}\n", step.name))
                .expect("output file should write");
            fetched.insert(slot.clone(), path);
        }
        Ok(fetched)
    }

    async fn cancel(&self, _job: &JobHandle) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Concatenates the OUTCAR of every input directory into `summary.txt`.
struct Summarize {
    calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl LocalTask for Summarize {
    fn name(&self) -> &str {
        "summarize"
    }

    async fn run(&self, inputs: &LocalInputs, output_dir: &Path) -> Result<(), FlowError> {
        let mut lines = Vec::new();
        for path in inputs.values() {
            let content = fs::read_to_string(path.join("OUTCAR"))
                .map_err(|error| FlowError::LocalTask(error.to_string()))?;
            lines.push(content.trim().to_string());
        }
        fs::write(output_dir.join("summary.txt"), lines.join(","))
            .map_err(|error| FlowError::LocalTask(error.to_string()))?;
        self.calls
            .lock()
            .expect("calls mutex should lock")
            .push(lines);
        Ok(())
    }
}

fn profile() -> Arc<ExecutorProfile> {
    Arc::new(
        ExecutorProfile::builder("spst_pub")
            .connection(ConnectionSpec::new("cluster.example", "flow"))
            .remote_root("/scratch")
            .build()
            .expect("profile should build"),
    )
}

fn remote(name: &str) -> Step {
    Step::remote(name, "mpirun vasp_std")
        .output_dir("out", name)
        .profile(profile())
}

fn fan_in_graph(summarize: Arc<Summarize>) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("fan-in");
    for name in ["a", "b", "c"] {
        graph.add_step(remote(name)).expect("add remote step");
    }
    graph
        .add_step(
            Step::local("agg", summarize)
                .input_from("a", OutputRef::new("a", "out"))
                .input_from("b", OutputRef::new("b", "out"))
                .input_from("c", OutputRef::new("c", "out"))
                .output_file("summary", "summary.txt"),
        )
        .expect("add aggregation");
    graph
}

fn config(temp: &TempDir, driver: Arc<ScriptedDriver>) -> RunConfig {
    RunConfig {
        run_id: Some("run-1".to_string()),
        artifact_root: temp.path().to_path_buf(),
        poll: PollBackoff::fixed(Duration::from_secs(10)),
        driver,
        ..RunConfig::default()
    }
}

fn recording_sink() -> (RuntimeEventSink, Arc<Mutex<Vec<RuntimeEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer_seen = Arc::clone(&seen);
    let observer: SharedRuntimeEventObserver = Arc::new(move |event: &RuntimeEvent| {
        observer_seen
            .lock()
            .expect("events mutex should lock")
            .push(event.clone());
    });
    (RuntimeEventSink::with_observer(observer), seen)
}

fn step_events(events: &[RuntimeEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            RuntimeEventKind::Step(StepEvent::Ready { step, .. }) => Some(format!("ready:{step}")),
            RuntimeEventKind::Step(StepEvent::Succeeded { step, .. }) => {
                Some(format!("succeeded:{step}"))
            }
            RuntimeEventKind::Step(StepEvent::Failed { step, .. }) => {
                Some(format!("failed:{step}"))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_independent_steps_submitted_together_and_aggregation_waits_for_last() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(
        ScriptedDriver::default()
            .script("a", &[Ok(JobState::Running), Ok(JobState::Succeeded)])
            .script("b", &[Ok(JobState::Succeeded)])
            .script(
                "c",
                &[
                    Ok(JobState::Queued),
                    Ok(JobState::Running),
                    Ok(JobState::Running),
                    Ok(JobState::Succeeded),
                ],
            ),
    );
    let summarize = Arc::new(Summarize {
        calls: Mutex::new(Vec::new()),
    });
    let mut graph = fan_in_graph(Arc::clone(&summarize));
    let (sink, events) = recording_sink();

    let report = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                events: sink,
                ..config(&temp, Arc::clone(&driver))
            },
        )
        .await
        .expect("run should complete");

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(driver.submitted(), vec!["a", "b", "c"]);

    let events = step_events(&events.lock().expect("events mutex should lock"));
    let position = |label: &str| {
        events
            .iter()
            .position(|entry| entry == label)
            .unwrap_or_else(|| panic!("missing event {label} in {events:?}"))
    };
    assert!(position("ready:a") < position("succeeded:a"));
    assert!(position("ready:c") < position("succeeded:b"));
    assert!(position("succeeded:c") < position("ready:agg"));

    let calls = summarize.calls.lock().expect("calls mutex should lock");
    assert_eq!(calls.as_slice(), &[vec!["a", "b", "c"]]);

    let summary = temp.path().join("agg/agg/summary.txt");
    assert_eq!(
        fs::read_to_string(summary).expect("summary should exist"),
        "a,b,c"
    );
    assert!(graph.steps().all(|step| step.status == StepStatus::Succeeded));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_failed_step_blocks_dependents_and_siblings_continue() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(
        ScriptedDriver::default()
            .script("a", &[Ok(JobState::Running), Ok(JobState::Failed)])
            .script("b", &[Ok(JobState::Succeeded)])
            .script("c", &[Ok(JobState::Running), Ok(JobState::Succeeded)]),
    );
    let mut graph = WorkflowGraph::new("partial");
    graph.add_step(remote("a")).expect("add a");
    graph.add_step(remote("c")).expect("add c");
    graph
        .add_step(remote("b").input_from("prev", OutputRef::new("a", "out")))
        .expect("add b");

    let report = Orchestrator
        .run(&mut graph, config(&temp, Arc::clone(&driver)))
        .await
        .expect("partial failure is a reported outcome");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(driver.submitted(), vec!["a", "c"]);
    assert_eq!(report.failed_steps(), vec!["a"]);

    let blocked = report.step("b").expect("b should be reported");
    assert_eq!(blocked.status, StepStatus::Pending);
    assert_eq!(
        blocked.reason.as_deref(),
        Some("blocked by failed dependency 'a'")
    );
    assert_eq!(
        report.step("c").expect("c should be reported").status,
        StepStatus::Succeeded
    );
    assert_eq!(
        report.step("a").expect("a should be reported").job_state,
        Some(JobState::Failed)
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_failed_step_blocks_transitive_dependents() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(
        ScriptedDriver::default()
            .script("a", &[Ok(JobState::Queued), Ok(JobState::Failed)])
            .script("b", &[Ok(JobState::Succeeded)])
            .script(
                "c",
                &[
                    Ok(JobState::Running),
                    Ok(JobState::Running),
                    Ok(JobState::Succeeded),
                ],
            )
            .script("d", &[Ok(JobState::Succeeded)]),
    );
    let mut graph = WorkflowGraph::new("chain");
    graph.add_step(remote("a")).expect("add a");
    graph.add_step(remote("c")).expect("add c");
    graph
        .add_step(remote("b").input_from("prev", OutputRef::new("a", "out")))
        .expect("add b");
    graph
        .add_step(remote("d").input_from("prev", OutputRef::new("b", "out")))
        .expect("add d");

    let report = Orchestrator
        .run(&mut graph, config(&temp, Arc::clone(&driver)))
        .await
        .expect("partial failure is a reported outcome");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(driver.submitted(), vec!["a", "c"]);
    for name in ["b", "d"] {
        let blocked = report.step(name).expect("blocked step should be reported");
        assert_eq!(blocked.status, StepStatus::Pending, "{name}");
        assert_eq!(blocked.job_id, None, "{name}");
        assert_eq!(
            blocked.reason.as_deref(),
            Some("blocked by failed dependency 'a'"),
            "{name}"
        );
    }
    assert_eq!(graph.status("d"), Some(StepStatus::Pending));
    assert_eq!(
        report.step("c").expect("c should be reported").status,
        StepStatus::Succeeded
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_dispatch_error_fails_only_that_step() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(ScriptedDriver::default().reject("a"));
    let mut graph = WorkflowGraph::new("dispatch");
    graph.add_step(remote("a")).expect("add a");
    graph.add_step(remote("b")).expect("add b");

    let report = Orchestrator
        .run(&mut graph, config(&temp, Arc::clone(&driver)))
        .await
        .expect("run should complete");

    let failed = report.step("a").expect("a should be reported");
    assert_eq!(failed.status, StepStatus::Failed);
    assert!(
        failed
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("Unknown queue"))
    );
    assert_eq!(failed.job_id, None);
    assert_eq!(
        report.step("b").expect("b should be reported").status,
        StepStatus::Succeeded
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_transient_status_errors_within_budget_expected_success() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(ScriptedDriver::default().script(
        "a",
        &[
            Err("ssh: connection reset"),
            Err("ssh: connection reset"),
            Ok(JobState::Running),
            Err("ssh: connection reset"),
            Ok(JobState::Succeeded),
        ],
    ));
    let mut graph = WorkflowGraph::new("flaky");
    graph.add_step(remote("a")).expect("add a");

    let report = Orchestrator
        .run(&mut graph, config(&temp, Arc::clone(&driver)))
        .await
        .expect("run should complete");

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(driver.polls.lock().expect("polls mutex").len(), 5);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_status_errors_beyond_budget_expected_step_failed() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(ScriptedDriver::default().script("a", &[Err("qstat: timeout")]));
    let mut graph = WorkflowGraph::new("lost");
    graph.add_step(remote("a")).expect("add a");

    let report = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                status_retry_budget: 2,
                ..config(&temp, Arc::clone(&driver))
            },
        )
        .await
        .expect("run should complete");

    let failed = report.step("a").expect("a should be reported");
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.job_state, Some(JobState::Unknown));
    assert!(
        failed
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("3 consecutive failed queries"))
    );
    assert_eq!(driver.polls.lock().expect("polls mutex").len(), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_missing_output_after_success_expected_incomplete_output_failure() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(
        ScriptedDriver::default()
            .script("a", &[Ok(JobState::Succeeded)])
            .skip_outputs("a"),
    );
    let mut graph = WorkflowGraph::new("incomplete");
    graph.add_step(remote("a")).expect("add a");
    graph
        .add_step(remote("b").input_from("prev", OutputRef::new("a", "out")))
        .expect("add b");

    let report = Orchestrator
        .run(&mut graph, config(&temp, Arc::clone(&driver)))
        .await
        .expect("run should complete");

    let failed = report.step("a").expect("a should be reported");
    assert_eq!(failed.status, StepStatus::Failed);
    assert_eq!(failed.job_state, Some(JobState::Succeeded));
    assert!(
        failed
            .reason
            .as_deref()
            .is_some_and(|reason| reason.contains("missing expected output"))
    );
    assert_eq!(driver.submitted(), vec!["a"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_timeout_preserves_last_known_running_status() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(ScriptedDriver::default().script("a", &[Ok(JobState::Running)]));
    let mut graph = WorkflowGraph::new("slow");
    graph.add_step(remote("a")).expect("add a");

    let error = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                timeout: Some(Duration::from_secs(25)),
                ..config(&temp, Arc::clone(&driver))
            },
        )
        .await
        .expect_err("run should time out");

    let FlowError::Timeout { report, elapsed_ms, .. } = error else {
        panic!("expected timeout, got {error:?}");
    };
    assert!(elapsed_ms >= 25_000);
    assert_eq!(report.status, RunStatus::Running);
    let step = report.step("a").expect("a should be reported");
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.job_state, Some(JobState::Running));
    assert_eq!(graph.status("a"), Some(StepStatus::Running));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_cancelled_token_expected_cancelled_error() {
    let temp = TempDir::new().expect("temp dir should create");
    let driver = Arc::new(ScriptedDriver::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut graph = WorkflowGraph::new("cancelled");
    graph.add_step(remote("a")).expect("add a");

    let error = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                cancel,
                ..config(&temp, Arc::clone(&driver))
            },
        )
        .await
        .expect_err("run should be cancelled");

    assert!(matches!(error, FlowError::Cancelled { .. }));
    assert!(driver.submitted().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn run_registers_fetched_outputs_in_supplied_store() {
    let temp = TempDir::new().expect("temp dir should create");
    let store = ArtifactStore::new(temp.path().join("store")).expect("store should initialize");
    let driver = Arc::new(ScriptedDriver::default());
    let mut graph = WorkflowGraph::new("store");
    graph.add_step(remote("a").workdir("relax")).expect("add a");

    let report = Orchestrator
        .run(
            &mut graph,
            RunConfig {
                artifacts: Some(store.clone()),
                ..config(&temp, Arc::clone(&driver))
            },
        )
        .await
        .expect("run should complete");

    assert!(report.succeeded());
    let id = ArtifactId::Output {
        step: "a".to_string(),
        slot: "out".to_string(),
    };
    let path = store.resolve(&id).expect("output should be ready");
    assert_eq!(path, temp.path().join("store/a/relax/a"));
    assert!(report.artifacts.iter().any(|artifact| artifact.id == id && artifact.ready));
}

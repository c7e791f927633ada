mod plan;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hpcflow_core::{
    ArtifactEvent, ArtifactId, ArtifactStore, DEFAULT_ARTIFACT_ROOT, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_STATUS_RETRY_BUDGET, JobDriver, Orchestrator, PollBackoff, RunConfig, RunEvent,
    RunReport, RunStatus, RuntimeEvent, RuntimeEventKind, RuntimeEventSink, StepEvent,
    run_report_path, runtime_event_channel,
};
use hpcflow_remote::{RemoteJobDriver, SshOptions};
use plan::{ConnectionEnv, PlanFile, describe_flow_error, parse_output_ref};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,hpcflow=info";
const STAGING_DIR_NAME: &str = "staging";

#[derive(Parser, Debug)]
#[command(name = "hpcflow")]
#[command(about = "Runs workflow plans on batch-scheduled clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Validate(ValidateArgs),
    InspectReport(InspectReportArgs),
    /// Deletes the local artifact directories of finished steps.
    Clean(CleanArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, default_value = DEFAULT_ARTIFACT_ROOT)]
    artifact_root: PathBuf,
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,
    /// Growth factor between poll rounds; 1.0 keeps the interval fixed.
    #[arg(long, default_value_t = 1.0)]
    poll_backoff: f64,
    #[arg(long)]
    max_poll_interval_ms: Option<u64>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long, default_value_t = DEFAULT_STATUS_RETRY_BUDGET)]
    status_retry_budget: u32,
    #[arg(long, value_enum, default_value_t = TransportMode::Ssh)]
    transport: TransportMode,
    /// `<step>.<slot>` to copy out of the artifact store after a successful run.
    #[arg(long = "export")]
    exports: Vec<String>,
    #[arg(long, default_value = ".")]
    export_dir: PathBuf,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectReportArgs {
    #[arg(long)]
    report: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct CleanArgs {
    #[arg(long, default_value = DEFAULT_ARTIFACT_ROOT)]
    artifact_root: PathBuf,
    #[arg(long = "step", required = true)]
    steps: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportMode {
    Ssh,
    Local,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::InspectReport(args) => inspect_report_command(args),
        Commands::Clean(args) => clean_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let plan = PlanFile::load(&args.plan)?;
    let built = plan.build(
        &plan_base_dir(&args.plan),
        &ConnectionEnv::from_env(),
        &args.artifact_root.join(STAGING_DIR_NAME),
    )?;
    for warning in &built.warnings {
        eprintln!("warning: {warning}");
    }
    let mut graph = built.graph;
    info!(
        plan = %args.plan.display(),
        graph = %graph.id(),
        steps = graph.len(),
        transport = ?args.transport,
        "starting run"
    );

    let store = ArtifactStore::new(&args.artifact_root).map_err(|e| e.to_string())?;
    let driver: Arc<dyn JobDriver> = match args.transport {
        TransportMode::Ssh => Arc::new(RemoteJobDriver::ssh(SshOptions::default())),
        TransportMode::Local => Arc::new(RemoteJobDriver::local()),
    };
    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);

    let config = RunConfig {
        run_id: args.run_id.clone(),
        artifact_root: args.artifact_root.clone(),
        artifacts: Some(store.clone()),
        poll: poll_backoff(&args),
        timeout: args.timeout_secs.map(Duration::from_secs),
        status_retry_budget: args.status_retry_budget,
        events: event_sink,
        driver,
        ..RunConfig::default()
    };
    let cancel = config.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = Orchestrator.run(&mut graph, config).await;
    interrupt.abort();
    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    let (report, code) = match outcome {
        Ok(report) => {
            let code = exit_code_for_status(report.status);
            (report, code)
        }
        Err(error) => {
            let Some(report) = error.report().cloned() else {
                return Err(describe_flow_error(error));
            };
            eprintln!("error: {error}");
            (report, ExitCode::from(3))
        }
    };

    let report_path = run_report_path(&args.artifact_root);
    report
        .save_to_path(&report_path)
        .map_err(|e| e.to_string())?;
    print_run_summary(&report);
    println!("report: {}", report_path.display());

    if report.succeeded() {
        export_artifacts(&store, &args.exports, &args.export_dir)?;
    }
    Ok(code)
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode, String> {
    let plan = PlanFile::load(&args.plan)?;
    // Staged INCARs are only needed to build the graph; drop them afterwards.
    let staging = tempfile::TempDir::new().map_err(|e| e.to_string())?;
    let built = plan.build(
        &plan_base_dir(&args.plan),
        &ConnectionEnv::from_env(),
        staging.path(),
    )?;
    let order = built
        .graph
        .topological_order()
        .map_err(describe_flow_error)?;

    if args.json {
        let value = serde_json::json!({
            "graph_id": built.graph.id(),
            "order": order,
            "warnings": built.warnings,
        });
        let json = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("graph: {}", built.graph.id());
        println!("steps: {}", built.graph.len());
        println!("order: {}", order.join(", "));
        for warning in &built.warnings {
            println!("warning: {warning}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect_report_command(args: InspectReportArgs) -> Result<ExitCode, String> {
    let report = RunReport::load_from_path(&args.report).map_err(|e| e.to_string())?;
    if args.json {
        let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("report: {}", args.report.display());
        print_run_summary(&report);
        println!("artifacts: {}", report.artifacts.len());
    }
    Ok(ExitCode::SUCCESS)
}

fn clean_command(args: CleanArgs) -> Result<ExitCode, String> {
    let store = ArtifactStore::new(&args.artifact_root).map_err(|e| e.to_string())?;
    for step in &args.steps {
        if store.remove_step(step).map_err(|e| e.to_string())? {
            println!("removed: {}", args.artifact_root.join(step).display());
        } else {
            println!("not present: {step}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn plan_base_dir(plan: &Path) -> PathBuf {
    plan.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn poll_backoff(args: &RunArgs) -> PollBackoff {
    let initial = Duration::from_millis(args.poll_interval_ms);
    match args.max_poll_interval_ms {
        Some(max) => PollBackoff::exponential(initial, args.poll_backoff, Duration::from_millis(max)),
        None => PollBackoff::fixed(initial),
    }
}

fn export_artifacts(store: &ArtifactStore, exports: &[String], dest: &Path) -> Result<(), String> {
    for reference in exports {
        let output = parse_output_ref(reference)?;
        let path = store
            .export(&ArtifactId::from(&output), dest)
            .map_err(|e| e.to_string())?;
        println!("exported: {} -> {}", output, path.display());
    }
    Ok(())
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RuntimeEventSink::default(), None);
    }

    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_label(&event.kind),
        event_detail(&event.kind)
    );
}

fn event_kind_label(kind: &RuntimeEventKind) -> &'static str {
    match kind {
        RuntimeEventKind::Run(_) => "run",
        RuntimeEventKind::Step(_) => "step",
        RuntimeEventKind::Artifact(_) => "artifact",
    }
}

fn event_detail(kind: &RuntimeEventKind) -> String {
    match kind {
        RuntimeEventKind::Run(event) => match event {
            RunEvent::Started {
                graph_id,
                step_count,
                ..
            } => format!("started graph={graph_id} steps={step_count}"),
            RunEvent::Completed { elapsed_ms, .. } => format!("completed elapsed_ms={elapsed_ms}"),
            RunEvent::Failed { failed_steps, .. } => {
                format!("failed steps={}", failed_steps.join(","))
            }
            RunEvent::TimedOut { elapsed_ms, .. } => format!("timed_out elapsed_ms={elapsed_ms}"),
            RunEvent::Cancelled { .. } => "cancelled".to_string(),
        },
        RuntimeEventKind::Step(event) => match event {
            StepEvent::Ready { step, .. } => format!("ready step={step}"),
            StepEvent::Submitted {
                step,
                job_id,
                job_name,
                ..
            } => format!("submitted step={step} job={job_id} name={job_name}"),
            StepEvent::StateChanged {
                step,
                job_id,
                state,
                detail,
                ..
            } => {
                let mut line = format!("state step={step} job={job_id} state={state}");
                if let Some(detail) = detail.as_deref() {
                    line.push_str(&format!(" detail={detail}"));
                }
                line
            }
            StepEvent::Succeeded { step, .. } => format!("succeeded step={step}"),
            StepEvent::Failed { step, reason, .. } => format!("failed step={step} reason={reason}"),
        },
        RuntimeEventKind::Artifact(ArtifactEvent::Registered {
            step,
            slot,
            path,
            version,
            ..
        }) => format!("registered artifact={step}.{slot} version={version} path={path}"),
    }
}

fn print_run_summary(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("graph: {}", report.graph_id);
    println!("status: {}", report.status);
    for (name, step) in &report.steps {
        let mut line = format!("step {name}: {}", step.status.as_str());
        if let Some(job_id) = step.job_id.as_deref() {
            line.push_str(&format!(" job={job_id}"));
        }
        if let Some(reason) = step.reason.as_deref() {
            line.push_str(&format!(" reason={reason}"));
        }
        println!("{line}");
    }
    println!("elapsed_ms: {}", report.elapsed_ms);
}

fn exit_code_for_status(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Pending | RunStatus::Running => ExitCode::from(2),
    }
}

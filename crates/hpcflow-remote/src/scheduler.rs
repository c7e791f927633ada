use crate::{ExecResult, RemoteError, shell_quote};
use hpcflow_core::{ExecutorProfile, JobState, SchedulerKind};

/// File in the job's remote directory that receives the payload exit code.
pub const EXIT_MARKER_FILE: &str = ".hpcflow_exit";
pub const SCRIPT_FILE_NAME: &str = "hpcflow-job.sh";

/// What the scheduler says about a job it was asked about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerPhase {
    Listed(JobState),
    /// Finished or purged; the exit marker decides the outcome.
    Gone,
}

/// Inputs for rendering one submission script.
#[derive(Clone, Debug)]
pub struct ScriptSpec<'a> {
    pub job_name: &'a str,
    pub profile: &'a ExecutorProfile,
    pub remote_dir: &'a str,
    pub command: &'a str,
    /// `(slot, remote path)` pairs exported to the payload.
    pub inputs: &'a [(String, String)],
}

pub trait BatchScheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Prefix of a directive line, e.g. `#PBS`.
    fn directive_prefix(&self) -> &'static str;

    /// Resource and naming directives derived from the profile.
    fn resource_directives(&self, job_name: &str, profile: &ExecutorProfile) -> Vec<String>;

    fn submit_command(&self, script_path: &str) -> String;

    fn parse_job_id(&self, stdout: &str) -> Result<String, RemoteError>;

    fn status_command(&self, job_id: &str) -> String;

    fn parse_status(&self, result: &ExecResult) -> Result<SchedulerPhase, RemoteError>;

    fn cancel_command(&self, job_id: &str) -> String;
}

pub fn scheduler_for(kind: SchedulerKind) -> &'static dyn BatchScheduler {
    match kind {
        SchedulerKind::Torque => &TorqueScheduler,
        SchedulerKind::Slurm => &SlurmScheduler,
    }
}

pub fn render_script(scheduler: &dyn BatchScheduler, spec: &ScriptSpec<'_>) -> String {
    let mut lines = vec!["#!/bin/bash -l".to_string()];
    lines.extend(scheduler.resource_directives(spec.job_name, spec.profile));
    for directive in &spec.profile.directives {
        let directive = directive.trim();
        if directive.starts_with('#') {
            lines.push(directive.to_string());
        } else {
            lines.push(format!("{} {directive}", scheduler.directive_prefix()));
        }
    }
    lines.push(String::new());

    for fragment in &spec.profile.bootstrap {
        lines.push(format!("source {fragment}"));
    }
    let run_dir = shell_quote(spec.remote_dir);
    lines.push(format!("export HPCFLOW_RUN_DIR={run_dir}"));
    for (slot, path) in spec.inputs {
        lines.push(format!(
            "export HPCFLOW_INPUT_{}={}",
            env_suffix(slot),
            shell_quote(path)
        ));
    }
    let marker = shell_quote(&format!(
        "{}/{EXIT_MARKER_FILE}",
        spec.remote_dir.trim_end_matches('/')
    ));
    lines.push(String::new());
    lines.push(format!("cd {run_dir} || exit 1"));
    lines.push(format!("rm -f {marker}"));
    lines.push("(".to_string());
    lines.push(spec.command.trim_end().to_string());
    lines.push(")".to_string());
    lines.push("status=$?".to_string());
    lines.push(format!("echo \"$status\" > {marker}"));
    lines.push("exit \"$status\"".to_string());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

pub fn parse_exit_marker(contents: &str) -> Option<i32> {
    contents.trim().parse().ok()
}

fn env_suffix(slot: &str) -> String {
    slot.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn first_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Torque/PBS: `qsub`, `qstat -f`, `qdel`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TorqueScheduler;

impl BatchScheduler for TorqueScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Torque
    }

    fn directive_prefix(&self) -> &'static str {
        "#PBS"
    }

    fn resource_directives(&self, job_name: &str, profile: &ExecutorProfile) -> Vec<String> {
        vec![
            format!("#PBS -N {job_name}"),
            format!("#PBS -q {}", profile.queue),
            format!(
                "#PBS -l nodes={}:ppn={}",
                profile.resources.nodes, profile.resources.cores_per_node
            ),
            format!("#PBS -l walltime={}", profile.resources.walltime),
        ]
    }

    fn submit_command(&self, script_path: &str) -> String {
        format!("qsub {}", shell_quote(script_path))
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String, RemoteError> {
        first_line(stdout)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Scheduler("qsub printed no job id".to_string()))
    }

    fn status_command(&self, job_id: &str) -> String {
        format!("qstat -f {}", shell_quote(job_id))
    }

    fn parse_status(&self, result: &ExecResult) -> Result<SchedulerPhase, RemoteError> {
        if !result.success() {
            if result.stderr.contains("Unknown Job Id") || result.stderr.contains("Job has finished")
            {
                return Ok(SchedulerPhase::Gone);
            }
            return Err(RemoteError::Scheduler(format!(
                "qstat exited with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        let state = result
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("job_state"))
            .filter_map(|rest| rest.trim_start().strip_prefix('='))
            .map(str::trim)
            .next()
            .ok_or_else(|| RemoteError::Scheduler("qstat output has no job_state".to_string()))?;
        match state {
            "Q" | "H" | "W" | "T" | "S" => Ok(SchedulerPhase::Listed(JobState::Queued)),
            "R" | "E" => Ok(SchedulerPhase::Listed(JobState::Running)),
            "C" | "F" => Ok(SchedulerPhase::Gone),
            other => Err(RemoteError::Scheduler(format!(
                "unrecognized torque job_state '{other}'"
            ))),
        }
    }

    fn cancel_command(&self, job_id: &str) -> String {
        format!("qdel {}", shell_quote(job_id))
    }
}

/// Slurm: `sbatch --parsable`, `squeue`, `scancel`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SlurmScheduler;

impl BatchScheduler for SlurmScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    fn directive_prefix(&self) -> &'static str {
        "#SBATCH"
    }

    fn resource_directives(&self, job_name: &str, profile: &ExecutorProfile) -> Vec<String> {
        vec![
            format!("#SBATCH --job-name={job_name}"),
            format!("#SBATCH --partition={}", profile.queue),
            format!("#SBATCH --nodes={}", profile.resources.nodes),
            format!(
                "#SBATCH --ntasks-per-node={}",
                profile.resources.cores_per_node
            ),
            format!("#SBATCH --time={}", profile.resources.walltime),
        ]
    }

    fn submit_command(&self, script_path: &str) -> String {
        format!("sbatch --parsable {}", shell_quote(script_path))
    }

    fn parse_job_id(&self, stdout: &str) -> Result<String, RemoteError> {
        let line = first_line(stdout)
            .ok_or_else(|| RemoteError::Scheduler("sbatch printed no job id".to_string()))?;
        let id = line.split(';').next().unwrap_or(line).trim();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
            return Err(RemoteError::Scheduler(format!(
                "unexpected sbatch output '{line}'"
            )));
        }
        Ok(id.to_string())
    }

    fn status_command(&self, job_id: &str) -> String {
        format!("squeue -h -j {} -o %T", shell_quote(job_id))
    }

    fn parse_status(&self, result: &ExecResult) -> Result<SchedulerPhase, RemoteError> {
        if !result.success() {
            if result.stderr.contains("Invalid job id") {
                return Ok(SchedulerPhase::Gone);
            }
            return Err(RemoteError::Scheduler(format!(
                "squeue exited with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        let Some(state) = first_line(&result.stdout) else {
            return Ok(SchedulerPhase::Gone);
        };
        match state {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "SUSPENDED" | "RESV_DEL_HOLD" => {
                Ok(SchedulerPhase::Listed(JobState::Queued))
            }
            "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => {
                Ok(SchedulerPhase::Listed(JobState::Running))
            }
            "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY"
            | "PREEMPTED" | "BOOT_FAIL" | "DEADLINE" => Ok(SchedulerPhase::Gone),
            other => Err(RemoteError::Scheduler(format!(
                "unrecognized slurm state '{other}'"
            ))),
        }
    }

    fn cancel_command(&self, job_id: &str) -> String {
        format!("scancel {}", shell_quote(job_id))
    }
}

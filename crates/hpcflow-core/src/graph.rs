use crate::{Diagnostic, ExecutorProfile, FlowError, ProfileOverrides, ValidationError, lint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Directory,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub step: String,
    pub slot: String,
}

impl OutputRef {
    pub fn new(step: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            slot: slot.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.step, self.slot)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBinding {
    Upload { path: PathBuf, kind: ArtifactKind },
    Output(OutputRef),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub kind: ArtifactKind,
    /// Path relative to the step's working directory.
    pub path: String,
}

pub type LocalInputs = BTreeMap<String, PathBuf>;

/// A computation executed in-process once all of its inputs are local.
#[async_trait]
pub trait LocalTask: Send + Sync {
    fn name(&self) -> &str;

    /// Reads `inputs` (slot -> local path) and writes every declared output
    /// below `output_dir`.
    async fn run(&self, inputs: &LocalInputs, output_dir: &Path) -> Result<(), FlowError>;
}

#[derive(Clone)]
pub enum StepTemplate {
    /// Shell payload executed by the batch scheduler on the remote side.
    Remote { command: String },
    Local(Arc<dyn LocalTask>),
}

impl StepTemplate {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Remote { command } => format!("remote: {command}"),
            Self::Local(task) => format!("local: {}", task.name()),
        }
    }
}

/// Single-quotes `value` for a POSIX shell. Plain path-like values pass
/// through unchanged.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl fmt::Debug for StepTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { command } => f.debug_struct("Remote").field("command", command).finish(),
            Self::Local(task) => f.debug_tuple("Local").field(&task.name()).finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Step {
    pub name: String,
    pub template: StepTemplate,
    pub workdir: String,
    pub inputs: BTreeMap<String, InputBinding>,
    pub outputs: BTreeMap<String, OutputSlot>,
    pub profile: Option<Arc<ExecutorProfile>>,
    pub overrides: ProfileOverrides,
    pub status: StepStatus,
}

impl Step {
    pub fn remote(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_template(
            name.into(),
            StepTemplate::Remote {
                command: command.into(),
            },
        )
    }

    pub fn local(name: impl Into<String>, task: Arc<dyn LocalTask>) -> Self {
        Self::with_template(name.into(), StepTemplate::Local(task))
    }

    fn with_template(name: String, template: StepTemplate) -> Self {
        Self {
            workdir: name.clone(),
            name,
            template,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            profile: None,
            overrides: ProfileOverrides::default(),
            status: StepStatus::Pending,
        }
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn upload_file(mut self, slot: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(
            slot.into(),
            InputBinding::Upload {
                path: path.into(),
                kind: ArtifactKind::File,
            },
        );
        self
    }

    pub fn upload_dir(mut self, slot: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(
            slot.into(),
            InputBinding::Upload {
                path: path.into(),
                kind: ArtifactKind::Directory,
            },
        );
        self
    }

    pub fn input_from(mut self, slot: impl Into<String>, output: OutputRef) -> Self {
        self.inputs.insert(slot.into(), InputBinding::Output(output));
        self
    }

    pub fn output_dir(mut self, slot: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(
            slot.into(),
            OutputSlot {
                kind: ArtifactKind::Directory,
                path: path.into(),
            },
        );
        self
    }

    pub fn output_file(mut self, slot: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(
            slot.into(),
            OutputSlot {
                kind: ArtifactKind::File,
                path: path.into(),
            },
        );
        self
    }

    pub fn profile(mut self, profile: Arc<ExecutorProfile>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn overrides(mut self, overrides: ProfileOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn output(&self, slot: impl Into<String>) -> OutputRef {
        OutputRef::new(self.name.clone(), slot)
    }

    /// Names of the steps whose outputs this step consumes.
    pub fn upstream_steps(&self) -> BTreeSet<String> {
        self.inputs
            .values()
            .filter_map(|binding| match binding {
                InputBinding::Output(output) => Some(output.step.clone()),
                InputBinding::Upload { .. } => None,
            })
            .collect()
    }
}

pub type StatusSnapshot = BTreeMap<String, StepStatus>;

#[derive(Clone, Debug)]
pub struct WorkflowGraph {
    id: String,
    steps: BTreeMap<String, Step>,
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: BTreeMap::new(),
        }
    }

    pub fn builder(id: impl Into<String>) -> WorkflowGraphBuilder {
        WorkflowGraphBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a step whose every upstream output is already in the graph.
    pub fn add_step(&mut self, step: Step) -> Result<(), FlowError> {
        if self.steps.contains_key(&step.name) {
            return Err(FlowError::DuplicateName(step.name));
        }
        self.check_bindings(&step)?;
        self.steps.insert(step.name.clone(), step);
        Ok(())
    }

    fn check_bindings(&self, step: &Step) -> Result<(), FlowError> {
        for (slot, binding) in &step.inputs {
            let InputBinding::Output(output) = binding else {
                continue;
            };
            let declared = self
                .steps
                .get(&output.step)
                .is_some_and(|producer| producer.outputs.contains_key(&output.slot));
            if !declared {
                return Err(FlowError::UnresolvedDependency {
                    step: step.name.clone(),
                    slot: slot.clone(),
                    producer: output.step.clone(),
                    output: output.slot.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Steps in name order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn status(&self, name: &str) -> Option<StepStatus> {
        self.steps.get(name).map(|step| step.status)
    }

    pub(crate) fn set_status(&mut self, name: &str, status: StepStatus) -> Result<(), FlowError> {
        let step = self
            .steps
            .get_mut(name)
            .ok_or_else(|| FlowError::Runtime(format!("unknown step '{name}'")))?;
        step.status = status;
        Ok(())
    }

    pub fn statuses(&self) -> StatusSnapshot {
        self.steps
            .iter()
            .map(|(name, step)| (name.clone(), step.status))
            .collect()
    }

    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.steps
            .get(name)
            .map(Step::upstream_steps)
            .unwrap_or_default()
    }

    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.steps
            .values()
            .filter(|step| step.upstream_steps().contains(name))
            .map(|step| step.name.clone())
            .collect()
    }

    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// Pending steps whose every upstream step has succeeded, in name order.
    pub fn ready_steps(&self, statuses: &StatusSnapshot) -> Vec<&Step> {
        self.steps
            .values()
            .filter(|step| statuses.get(&step.name) == Some(&StepStatus::Pending))
            .filter(|step| {
                step.upstream_steps()
                    .iter()
                    .all(|upstream| statuses.get(upstream) == Some(&StepStatus::Succeeded))
            })
            .collect()
    }

    /// Runs every lint rule; a cycle is reported as [`FlowError::Cycle`].
    pub fn validate(&self) -> Result<Vec<Diagnostic>, FlowError> {
        if let Some(cycle) = self.find_cycle() {
            return Err(FlowError::Cycle { cycle });
        }
        let diagnostics = lint::validate(self, &[]);
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(ValidationError::new(diagnostics).into());
        }
        Ok(diagnostics)
    }

    /// Returns the steps on the first cycle found, closing back on its first
    /// step (`a -> b -> a`).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &WorkflowGraph,
            name: &str,
            marks: &mut BTreeMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|entry| entry == name)?;
                    let mut cycle = path[start..].to_vec();
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(name.to_string(), Mark::Visiting);
            path.push(name.to_string());
            for upstream in graph.dependencies(name) {
                if !graph.steps.contains_key(&upstream) {
                    continue;
                }
                if let Some(cycle) = visit(graph, &upstream, marks, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            marks.insert(name.to_string(), Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for name in self.steps.keys() {
            let mut path = Vec::new();
            if let Some(mut cycle) = visit(self, name, &mut marks, &mut path) {
                // Walked along dependency edges; report in execution order.
                cycle.reverse();
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn's algorithm with ties broken by step name.
    pub fn topological_order(&self) -> Result<Vec<String>, FlowError> {
        let mut remaining: BTreeMap<&str, usize> = self
            .steps
            .values()
            .map(|step| {
                let known = step
                    .upstream_steps()
                    .iter()
                    .filter(|upstream| self.steps.contains_key(*upstream))
                    .count();
                (step.name.as_str(), known)
            })
            .collect();
        let mut available: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(name) = available.pop_first() {
            remaining.remove(name);
            order.push(name.to_string());
            for dependent in self.dependents(name) {
                if let Some((key, count)) = remaining.get_key_value(dependent.as_str()) {
                    let key = *key;
                    let next = count.saturating_sub(1);
                    remaining.insert(key, next);
                    if next == 0 {
                        available.insert(key);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let cycle = self.find_cycle().unwrap_or_else(|| {
                remaining.keys().map(|name| name.to_string()).collect()
            });
            return Err(FlowError::Cycle { cycle });
        }
        Ok(order)
    }
}

/// Collects steps in any order and resolves their bindings in [`build`].
///
/// [`build`]: WorkflowGraphBuilder::build
#[derive(Clone, Debug)]
pub struct WorkflowGraphBuilder {
    id: String,
    steps: Vec<Step>,
}

impl WorkflowGraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> Result<WorkflowGraph, FlowError> {
        let mut graph = WorkflowGraph::new(self.id);
        for step in self.steps {
            if graph.steps.contains_key(&step.name) {
                return Err(FlowError::DuplicateName(step.name));
            }
            graph.steps.insert(step.name.clone(), step);
        }
        for step in graph.steps.values() {
            graph.check_bindings(step)?;
        }
        graph.validate()?;
        Ok(graph)
    }
}

use crate::{Diagnostic, InputBinding, Severity, StepTemplate, ValidationError, WorkflowGraph};
use std::collections::BTreeMap;
use std::path::{Component, Path};

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &WorkflowGraph, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_inputs_resolve(graph));
    diagnostics.extend(rule_acyclic(graph));
    diagnostics.extend(rule_profile_matches_template(graph));
    diagnostics.extend(rule_step_paths_contained(graph));
    diagnostics.extend(rule_unique_workdir(graph));
    diagnostics.extend(rule_command_not_empty(graph));
    diagnostics.extend(rule_output_paths_relative(graph));
    diagnostics.extend(rule_declares_outputs(graph));
    diagnostics.extend(rule_uploads_exist(graph));

    for rule in extra_rules {
        diagnostics.extend(rule.apply(graph));
    }

    diagnostics
}

pub fn validate_or_raise(
    graph: &WorkflowGraph,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_inputs_resolve(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for step in graph.steps() {
        for (slot, binding) in &step.inputs {
            let InputBinding::Output(output) = binding else {
                continue;
            };
            let message = match graph.step(&output.step) {
                None => format!("input '{slot}' references unknown step '{}'", output.step),
                Some(producer) if !producer.outputs.contains_key(&output.slot) => format!(
                    "input '{slot}' references undeclared output '{output}'"
                ),
                Some(_) => continue,
            };
            diagnostics.push(
                Diagnostic::new("inputs_resolve", Severity::Error, message)
                    .with_step(step.name.clone())
                    .with_edge(output.step.clone(), step.name.clone()),
            );
        }
    }
    diagnostics
}

fn rule_acyclic(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    match graph.find_cycle() {
        Some(cycle) => vec![Diagnostic::new(
            "acyclic",
            Severity::Error,
            format!("dependency cycle: {}", cycle.join(" -> ")),
        )],
        None => Vec::new(),
    }
}

fn rule_profile_matches_template(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for step in graph.steps() {
        match (&step.template, step.profile.is_some()) {
            (StepTemplate::Remote { .. }, false) => diagnostics.push(
                Diagnostic::new(
                    "profile_matches_template",
                    Severity::Error,
                    "remote step has no executor profile",
                )
                .with_step(step.name.clone())
                .with_fix("attach a profile with Step::profile"),
            ),
            (StepTemplate::Local(_), true) => diagnostics.push(
                Diagnostic::new(
                    "profile_matches_template",
                    Severity::Error,
                    "local step must not carry an executor profile",
                )
                .with_step(step.name.clone()),
            ),
            _ => {}
        }
    }
    diagnostics
}

fn rule_step_paths_contained(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for step in graph.steps() {
        if !is_single_component(&step.name) {
            diagnostics.push(
                Diagnostic::new(
                    "step_paths_contained",
                    Severity::Error,
                    format!(
                        "step name '{}' must be a single path component without '/'",
                        step.name
                    ),
                )
                .with_step(step.name.clone()),
            );
        }
        if normalized_relative(&step.workdir).is_none() {
            diagnostics.push(
                Diagnostic::new(
                    "step_paths_contained",
                    Severity::Error,
                    format!(
                        "working directory '{}' must be a non-empty relative path without '..'",
                        step.workdir
                    ),
                )
                .with_step(step.name.clone())
                .with_fix("use a plain directory name such as the step name"),
            );
        }
    }
    diagnostics
}

fn rule_unique_workdir(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    let mut diagnostics = Vec::new();
    for step in graph.steps() {
        let Some(workdir) = normalized_relative(&step.workdir) else {
            continue;
        };
        if let Some(owner) = owners.insert(workdir, step.name.as_str()) {
            diagnostics.push(
                Diagnostic::new(
                    "unique_workdir",
                    Severity::Error,
                    format!(
                        "working directory '{}' is already used by step '{owner}'",
                        step.workdir
                    ),
                )
                .with_step(step.name.clone()),
            );
        }
    }
    diagnostics
}

fn rule_command_not_empty(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    graph
        .steps()
        .filter(|step| {
            matches!(&step.template, StepTemplate::Remote { command } if command.trim().is_empty())
        })
        .map(|step| {
            Diagnostic::new(
                "command_not_empty",
                Severity::Error,
                "remote step has an empty command",
            )
            .with_step(step.name.clone())
        })
        .collect()
}

fn rule_output_paths_relative(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for step in graph.steps() {
        for (slot, output) in &step.outputs {
            if is_contained_relative(&output.path) {
                continue;
            }
            diagnostics.push(
                Diagnostic::new(
                    "output_paths_relative",
                    Severity::Error,
                    format!(
                        "output '{slot}' path '{}' must be a non-empty relative path inside the working directory",
                        output.path
                    ),
                )
                .with_step(step.name.clone()),
            );
        }
    }
    diagnostics
}

fn rule_declares_outputs(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    graph
        .steps()
        .filter(|step| step.outputs.is_empty())
        .map(|step| {
            Diagnostic::new(
                "declares_outputs",
                Severity::Warning,
                "step declares no outputs; nothing will be fetched",
            )
            .with_step(step.name.clone())
        })
        .collect()
}

fn rule_uploads_exist(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for step in graph.steps() {
        for (slot, binding) in &step.inputs {
            let InputBinding::Upload { path, .. } = binding else {
                continue;
            };
            if !path.exists() {
                diagnostics.push(
                    Diagnostic::new(
                        "uploads_exist",
                        Severity::Warning,
                        format!("upload '{slot}' path '{}' does not exist yet", path.display()),
                    )
                    .with_step(step.name.clone()),
                );
            }
        }
    }
    diagnostics
}

pub(crate) fn is_contained_relative(path: &str) -> bool {
    normalized_relative(path).is_some()
}

/// `./x//y/` -> `x/y`. `None` for empty, absolute or `..`-bearing paths.
pub(crate) fn normalized_relative(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub(crate) fn is_single_component(name: &str) -> bool {
    !name.contains('/')
        && matches!(
            Path::new(name).components().collect::<Vec<_>>().as_slice(),
            [Component::Normal(_)]
        )
}

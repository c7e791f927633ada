use crate::events::timestamp_now;
use crate::{ArtifactKind, FlowError, InputBinding, LocalInputs, OutputRef, StagedInput, Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ArtifactId {
    Output { step: String, slot: String },
    Upload { path: PathBuf },
}

impl From<&OutputRef> for ArtifactId {
    fn from(output: &OutputRef) -> Self {
        Self::Output {
            step: output.step.clone(),
            slot: output.slot.clone(),
        }
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Output { step, slot } => write!(f, "{step}.{slot}"),
            Self::Upload { path } => write!(f, "upload:{}", path.display()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum ArtifactLocation {
    Local { path: PathBuf },
    Remote { host: String, path: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub location: ArtifactLocation,
    pub ready: bool,
    pub version: u32,
    pub stored_at: Option<String>,
}

/// Handles to the filesystem content flowing between steps.
///
/// Local content lives under `<root>/<step>/<workdir>`. An output becomes
/// readable only once [`register_output`](ArtifactStore::register_output)
/// has recorded its local copy.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    entries: Arc<RwLock<BTreeMap<ArtifactId, Artifact>>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FlowError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| {
            FlowError::Artifact(format!(
                "failed to create artifact root '{}': {}",
                root.display(),
                error
            ))
        })?;
        Ok(Self {
            root,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn step_dir(&self, step: &Step) -> PathBuf {
        self.root.join(&step.name).join(&step.workdir)
    }

    /// Records every output and upload of `steps` as not-yet-ready (outputs)
    /// or ready (uploads that already exist).
    pub fn declare<'a>(&self, steps: impl IntoIterator<Item = &'a Step>) -> Result<(), FlowError> {
        let mut entries = self.write()?;
        for step in steps {
            for (slot, output) in &step.outputs {
                let id = ArtifactId::Output {
                    step: step.name.clone(),
                    slot: slot.clone(),
                };
                entries.entry(id.clone()).or_insert_with(|| Artifact {
                    id,
                    kind: output.kind,
                    location: ArtifactLocation::Local {
                        path: self.step_dir(step).join(&output.path),
                    },
                    ready: false,
                    version: 0,
                    stored_at: None,
                });
            }
            for binding in step.inputs.values() {
                let InputBinding::Upload { path, kind } = binding else {
                    continue;
                };
                let id = ArtifactId::Upload { path: path.clone() };
                entries.entry(id.clone()).or_insert_with(|| Artifact {
                    id,
                    kind: *kind,
                    location: ArtifactLocation::Local { path: path.clone() },
                    ready: path.exists(),
                    version: 0,
                    stored_at: None,
                });
            }
        }
        Ok(())
    }

    /// Notes where a pending output will be produced on the remote side.
    pub fn mark_in_flight(
        &self,
        output: &OutputRef,
        host: impl Into<String>,
        remote_path: impl Into<String>,
    ) -> Result<(), FlowError> {
        let mut entries = self.write()?;
        let artifact = entries
            .get_mut(&ArtifactId::from(output))
            .ok_or_else(|| FlowError::Artifact(format!("artifact '{output}' was never declared")))?;
        artifact.location = ArtifactLocation::Remote {
            host: host.into(),
            path: remote_path.into(),
        };
        artifact.ready = false;
        Ok(())
    }

    /// Marks `output` as materialized at `local_path` and bumps its version.
    pub fn register_output(
        &self,
        output: &OutputRef,
        kind: ArtifactKind,
        local_path: impl Into<PathBuf>,
    ) -> Result<Artifact, FlowError> {
        let local_path = local_path.into();
        let present = match kind {
            ArtifactKind::Directory => local_path.is_dir(),
            ArtifactKind::File => local_path.is_file(),
        };
        if !present {
            return Err(FlowError::IncompleteOutput {
                step: output.step.clone(),
                path: local_path.display().to_string(),
            });
        }

        let mut entries = self.write()?;
        let id = ArtifactId::from(output);
        let version = entries.get(&id).map_or(0, |artifact| artifact.version) + 1;
        let artifact = Artifact {
            id: id.clone(),
            kind,
            location: ArtifactLocation::Local { path: local_path },
            ready: true,
            version,
            stored_at: Some(timestamp_now()),
        };
        entries.insert(id, artifact.clone());
        Ok(artifact)
    }

    pub fn get(&self, id: &ArtifactId) -> Result<Option<Artifact>, FlowError> {
        Ok(self.read()?.get(id).cloned())
    }

    /// Local path of a ready artifact. Pending and remote-only artifacts are
    /// errors; nothing may read an output before it has been fetched.
    pub fn resolve(&self, id: &ArtifactId) -> Result<PathBuf, FlowError> {
        let entries = self.read()?;
        let artifact = entries
            .get(id)
            .ok_or_else(|| FlowError::Artifact(format!("artifact '{id}' is unknown")))?;
        match (&artifact.location, artifact.ready) {
            (ArtifactLocation::Local { path }, true) => Ok(path.clone()),
            _ => Err(FlowError::Artifact(format!("artifact '{id}' is not ready"))),
        }
    }

    pub fn stage_inputs(&self, step: &Step) -> Result<Vec<StagedInput>, FlowError> {
        let mut staged = Vec::with_capacity(step.inputs.len());
        for (slot, binding) in &step.inputs {
            let (local_path, kind) = match binding {
                InputBinding::Upload { path, kind } => {
                    if !path.exists() {
                        return Err(FlowError::Artifact(format!(
                            "upload '{}' for step '{}' does not exist",
                            path.display(),
                            step.name
                        )));
                    }
                    (path.clone(), *kind)
                }
                InputBinding::Output(output) => {
                    let id = ArtifactId::from(output);
                    let path = self.resolve(&id)?;
                    let kind = self
                        .get(&id)?
                        .map_or(ArtifactKind::Directory, |artifact| artifact.kind);
                    (path, kind)
                }
            };
            staged.push(StagedInput {
                slot: slot.clone(),
                local_path,
                kind,
            });
        }
        Ok(staged)
    }

    pub fn local_inputs(&self, step: &Step) -> Result<LocalInputs, FlowError> {
        Ok(self
            .stage_inputs(step)?
            .into_iter()
            .map(|input| (input.slot, input.local_path))
            .collect())
    }

    pub fn list(&self) -> Result<Vec<Artifact>, FlowError> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Copies a ready artifact into `dest_dir`, keeping its file name.
    pub fn export(&self, id: &ArtifactId, dest_dir: &Path) -> Result<PathBuf, FlowError> {
        let source = self.resolve(id)?;
        let name = source.file_name().ok_or_else(|| {
            FlowError::Artifact(format!(
                "artifact '{id}' path '{}' has no file name",
                source.display()
            ))
        })?;
        let target = dest_dir.join(name);
        copy_tree(&source, &target)?;
        Ok(target)
    }

    /// Forgets every output of `step` and deletes its local directory.
    /// Returns whether a directory was removed.
    pub fn remove_step(&self, step: &str) -> Result<bool, FlowError> {
        if !crate::lint::is_single_component(step) {
            return Err(FlowError::Artifact(format!(
                "refusing to remove '{step}': not a step directory name"
            )));
        }
        {
            let mut entries = self.write()?;
            entries.retain(|id, _| !matches!(id, ArtifactId::Output { step: owner, .. } if owner == step));
        }
        let dir = self.root.join(step);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|error| {
            FlowError::Artifact(format!(
                "failed to remove '{}': {}",
                dir.display(),
                error
            ))
        })?;
        Ok(true)
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<ArtifactId, Artifact>>, FlowError> {
        self.entries
            .read()
            .map_err(|_| FlowError::Artifact("artifact read lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<ArtifactId, Artifact>>, FlowError> {
        self.entries
            .write()
            .map_err(|_| FlowError::Artifact("artifact write lock poisoned".to_string()))
    }
}

/// Copies a file or a whole directory tree to `dst`, creating parents.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), FlowError> {
    let io_error = |action: &str, path: &Path, error: std::io::Error| {
        FlowError::Artifact(format!("failed to {action} '{}': {}", path.display(), error))
    };

    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("create", parent, e))?;
        }
        fs::copy(src, dst).map_err(|e| io_error("copy", src, e))?;
        return Ok(());
    }

    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|error| {
            FlowError::Artifact(format!("failed to walk '{}': {}", src.display(), error))
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|error| {
            FlowError::Artifact(format!("failed to relativize '{}': {}", entry.path().display(), error))
        })?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_error("create", &target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io_error("copy", entry.path(), e))?;
        }
    }
    Ok(())
}

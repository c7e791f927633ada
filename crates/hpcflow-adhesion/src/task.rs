use crate::{AdhesionError, AdhesionRecord};
use async_trait::async_trait;
use hpcflow_core::{FlowError, LocalInputs, LocalTask, OutputRef, Step};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const SLOT_A: &str = "a";
pub const SLOT_B: &str = "b";
pub const SLOT_A_B: &str = "a_b";
pub const RECORD_SLOT: &str = "record";
pub const DEFAULT_RECORD_FILE: &str = "workofadhesion.json";

/// Local aggregation: reads the slab and interface results bound to slots
/// `a`, `b` and `a_b` and writes the [`AdhesionRecord`] as JSON.
#[derive(Clone, Debug)]
pub struct WorkOfAdhesionTask {
    record_file: String,
}

impl Default for WorkOfAdhesionTask {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_FILE)
    }
}

impl WorkOfAdhesionTask {
    pub fn new(record_file: impl Into<String>) -> Self {
        Self {
            record_file: record_file.into(),
        }
    }

    pub fn record_file(&self) -> &str {
        &self.record_file
    }

    /// Builds the step that runs this task over three upstream outputs.
    pub fn step(self, name: impl Into<String>, a: OutputRef, b: OutputRef, a_b: OutputRef) -> Step {
        let record_file = self.record_file.clone();
        Step::local(name, Arc::new(self))
            .input_from(SLOT_A, a)
            .input_from(SLOT_B, b)
            .input_from(SLOT_A_B, a_b)
            .output_file(RECORD_SLOT, record_file)
    }

    pub fn compute(&self, inputs: &LocalInputs, output_dir: &Path) -> Result<AdhesionRecord, AdhesionError> {
        let record = AdhesionRecord::from_results(
            slot(inputs, SLOT_A)?,
            slot(inputs, SLOT_B)?,
            slot(inputs, SLOT_A_B)?,
        )?;
        record.write_to_path(&output_dir.join(&self.record_file))?;
        Ok(record)
    }
}

fn slot<'a>(inputs: &'a LocalInputs, name: &str) -> Result<&'a PathBuf, AdhesionError> {
    inputs
        .get(name)
        .ok_or_else(|| AdhesionError::MissingInput(name.to_string()))
}

#[async_trait]
impl LocalTask for WorkOfAdhesionTask {
    fn name(&self) -> &str {
        "work_of_adhesion"
    }

    async fn run(&self, inputs: &LocalInputs, output_dir: &Path) -> Result<(), FlowError> {
        let record = self.compute(inputs, output_dir)?;
        info!(
            energy_a = record.energy_a,
            energy_b = record.energy_b,
            energy_a_b = record.energy_a_b,
            area_a_b = record.area_a_b,
            adhesion = record.adhesion,
            "work of adhesion computed"
        );
        Ok(())
    }
}

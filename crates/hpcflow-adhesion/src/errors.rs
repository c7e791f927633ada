use hpcflow_core::FlowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdhesionError {
    #[error("failed to parse '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("degenerate interface geometry: {0}")]
    DegenerateGeometry(String),
    #[error("missing input slot '{0}'")]
    MissingInput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AdhesionError> for FlowError {
    fn from(error: AdhesionError) -> Self {
        FlowError::LocalTask(error.to_string())
    }
}

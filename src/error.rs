use dataviser_ipc::BridgeError;
use thiserror::Error;

use crate::dataframe::DataError;

#[derive(Debug, Error)]
pub enum DataviserError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A script raised inside the interpreter; carries the interpreter's text.
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// The interpreter thread is gone and no further replies will arrive.
    #[error("interpreter worker crashed")]
    WorkerCrashed,

    #[error("interpreter request {id} got no reply after {ms} ms")]
    Timeout { id: u64, ms: u64 },

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("pipeline bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("pipeline is closed")]
    PipelineClosed,

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("`{0}` is not a valid script identifier")]
    InvalidIdentifier(String),

    #[error("no script named `{0}` in the catalogue")]
    UnknownScript(String),

    #[error("no filter named `{0}`")]
    UnknownFilter(String),

    #[error("pipeline task panicked: {0}")]
    TaskPanicked(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = DataviserError> = std::result::Result<T, E>;

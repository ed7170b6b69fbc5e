//! In-memory tabular data: frames, the pure aggregation operations over them, file
//! parsing, and the versioned two-slot store the pipeline writes into.

mod frame;
pub mod ops;
pub mod parse;
pub mod store;

pub use frame::{Dataframe, Sums};
pub use ops::{AxisFilter, AxisOrder, filter, sum, to_matrix};
pub use store::{DataStore, FrameSet, GroupSnapshot, GroupUpdate, ListenerId, StoreEvent};

use thiserror::Error;

/// Malformed data handed to the aggregation engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("cell ({column}, {row}) is not numeric: {value}")]
    NonNumeric { column: String, row: String, value: String },

    #[error("cell {0} overflows")]
    Overflow(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unsupported file format `{0}`")]
    UnsupportedFormat(String),

    #[error("CSV error: {0}")]
    Csv(String),
}

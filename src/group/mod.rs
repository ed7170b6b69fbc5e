//! Consumer-side derived datasets: subscriptions that re-derive a group whenever the
//! loaded dataset changes, and the per-visual filter registry.

pub mod filter;
mod staleness;
mod subscription;

pub use filter::{FilterKind, FilterRegistry};
pub use staleness::StalenessChecker;
pub use subscription::{GroupFailure, GroupManager, GroupParams, Subscription, DEFAULT_GROUP};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// How each frame is reduced after filtering.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Orientation {
    /// One `sum` column of row sums.
    Row,
    /// One `sum` row of column sums.
    Col,
    #[default]
    None,
}

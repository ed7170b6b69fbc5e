pub mod bridge;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod host;
pub mod message;
pub mod relay;

pub use bridge::BridgeClient;
pub use correlation::{Bus, CorrelationChannel};
pub use envelope::{Body, Envelope, Outcome};
pub use error::{BridgeError, HostFailure, HostFailureKind};
pub use relay::Relay;

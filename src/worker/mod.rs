//! The interpreter worker: one dedicated OS thread owning a stateful `rhai` engine,
//! driven through id-correlated request/reply messages.

mod client;
mod natives;
pub mod protocol;
mod runtime;

pub use client::{DEFAULT_MAX_EXPR_DEPTH, InterpreterClient, WorkerOptions, WARM_UP_SCRIPT};
pub use natives::SUM_LABEL;
pub use protocol::{WorkerAction, WorkerReply, WorkerRequest};
pub use runtime::Interpreter;

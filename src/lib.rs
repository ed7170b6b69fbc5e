pub mod app;
pub mod config;
pub mod dataframe;
pub mod error;
pub mod group;
pub mod logger;
pub mod pipeline;
pub mod script;
pub mod worker;

pub use app::{Dataviser, HostConnection};
pub use error::DataviserError;

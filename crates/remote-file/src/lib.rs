pub mod attributes;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod install;
pub mod log_sanitize;
pub mod resource;
pub mod timestamp;
pub mod transport;

pub use engine::{Action, Observed, Outcome, Reconciler};
pub use error::{Error, Result};
pub use resource::{Ensure, RemoteFileConfig, ResourceSpec};

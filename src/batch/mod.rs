//! Batch orchestration of query tasks

pub mod executor;
pub mod listeners;
pub mod task;
pub mod types;

pub use executor::*;
pub use listeners::{CompletedListener, ListenerId};
pub use task::*;
pub use types::*;

/// Errors raised by the batch orchestrator
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A task was added without a context and the batch has no default
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    /// The completion hand-off did not identify a task of this batch
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    /// A run was requested while another run of the same batch is in flight
    #[error("Batch {0} is already running")]
    AlreadyRunning(String),
}

//! # Query Batch
//!
//! Client-side orchestration of remote data loads. A [`batch::QueryBatch`] holds an
//! ordered list of query tasks, each bound to a data context, and runs them either
//! strictly one after another or all at once. Listeners registered on the batch are
//! notified exactly once when every task of a run has finished.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use query_batch::batch::QueryBatch;
//! use query_batch::context::{LoadBehavior, MemoryContext, Query};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Customer {
//!     name: String,
//! }
//!
//! # async fn example() -> query_batch::Result<()> {
//! let crm = Arc::new(
//!     MemoryContext::new("crm").with_entity_set("Customers", vec![json!({"name": "Ada"})]),
//! );
//!
//! let batch = QueryBatch::with_defaults(crm, LoadBehavior::MergeIntoCurrent);
//! batch.on_completed(|| println!("all loads finished"));
//! batch.add_task(Query::<Customer>::new("Customers"), |op| {
//!     for customer in op.entities() {
//!         println!("loaded {}", customer.name);
//!     }
//! })?;
//!
//! batch.run_sequential().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`context`]: the data context contract, queries, load behaviors and results
//! - [`batch`]: query tasks and the batch orchestrator

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for batch operations
pub type Result<T> = std::result::Result<T, QueryBatchError>;

/// Main error type for batch operations
#[derive(Error, Debug)]
pub enum QueryBatchError {
    /// Orchestrator error (missing defaults, bad completion hand-off, overlapping runs)
    #[error("Batch error: {0}")]
    Batch(#[from] batch::BatchError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Data contexts and the load contract
pub mod context;

/// Query tasks and the batch orchestrator
pub mod batch;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: QueryBatchError =
            batch::BatchError::MissingConfiguration("no default context".to_string()).into();
        assert_eq!(err.to_string(), "Batch error: Missing configuration: no default context");

        let err: QueryBatchError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(matches!(err, QueryBatchError::Serialization(_)));
    }
}

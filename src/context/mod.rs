//! Remote data contexts and the load contract the batch drives.
//!
//! A [`DataContext`] is the opaque collaborator that actually talks to a remote
//! data source. The batch never looks inside a query or a result; it only calls
//! [`DataContext::load`] and waits for the returned future.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::batch::TaskId;

pub mod memory;

pub use memory::MemoryContext;

/// Entity types a context can materialize
pub trait Entity: DeserializeOwned + Send + Sync + 'static {}

impl<T> Entity for T where T: DeserializeOwned + Send + Sync + 'static {}

/// Opaque value carried from `add_task` to the per-task callback untouched
pub type UserState = Arc<dyn Any + Send + Sync>;

/// Faults reported by a data context for a single load
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadFault {
    /// The context has no such entity set
    #[error("Unknown entity set: {0}")]
    UnknownEntitySet(String),

    /// The remote source reported an error
    #[error("Server fault: {0}")]
    Server(String),

    /// The request never reached the source or the reply was lost
    #[error("Transport fault: {0}")]
    Transport(String),

    /// Rows came back but did not deserialize into the entity type
    #[error("Materialization failed: {0}")]
    Materialization(String),

    /// The load was dropped before it resolved
    #[error("Load cancelled")]
    Cancelled,
}

/// How fetched entities are merged into the entities a context already holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBehavior {
    /// Keep local entities; only add ones not already present
    #[default]
    KeepCurrent,
    /// Merge fetched values into unmodified local properties
    MergeIntoCurrent,
    /// Overwrite local entities with fetched values
    RefreshCurrent,
}

impl fmt::Display for LoadBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadBehavior::KeepCurrent => "keep_current",
            LoadBehavior::MergeIntoCurrent => "merge_into_current",
            LoadBehavior::RefreshCurrent => "refresh_current",
        };
        f.write_str(name)
    }
}

/// A typed, opaque query against one entity set.
///
/// Parameters are only ever read by the [`DataContext`] that executes the query.
pub struct Query<T> {
    entity_set: String,
    parameters: serde_json::Map<String, Value>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Query<T> {
    /// Create a query over the named entity set
    pub fn new(entity_set: impl Into<String>) -> Self {
        Self {
            entity_set: entity_set.into(),
            parameters: serde_json::Map::new(),
            _entity: PhantomData,
        }
    }

    /// Attach a named parameter for the context to interpret
    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Entity set this query targets
    pub fn entity_set(&self) -> &str {
        &self.entity_set
    }

    /// Raw parameters
    pub fn parameters(&self) -> &serde_json::Map<String, Value> {
        &self.parameters
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            entity_set: self.entity_set.clone(),
            parameters: self.parameters.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity_set", &self.entity_set)
            .field("entity_type", &std::any::type_name::<T>())
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// A remote data source that executes queries.
///
/// Calling [`load`](DataContext::load) issues the request; the returned future
/// resolves once the context has the result. Implementations must resolve the
/// future exactly once, with either the entities or a [`LoadFault`].
pub trait DataContext: Send + Sync + 'static {
    /// Name used in logs and on [`LoadOperation`]
    fn name(&self) -> &str;

    /// Issue `query` and return the pending result
    fn load<T: Entity>(
        &self,
        query: &Query<T>,
        load_behavior: LoadBehavior,
    ) -> BoxFuture<'static, Result<Vec<T>, LoadFault>>;
}

/// The finished load handed to a task's callback
pub struct LoadOperation<T> {
    /// Task that issued the load
    pub task_id: TaskId,
    /// Name of the context the load ran against
    pub context: String,
    /// Entity set that was queried
    pub entity_set: String,
    /// Merge policy the load ran with
    pub load_behavior: LoadBehavior,
    /// Entities, or the fault the context reported
    pub result: Result<Vec<T>, LoadFault>,
    /// User state supplied when the task was added
    pub user_state: Option<UserState>,
    /// Time between invocation and completion
    pub elapsed: Duration,
    /// Wall-clock completion time
    pub completed_at: DateTime<Utc>,
}

impl<T> LoadOperation<T> {
    /// Loaded entities; empty when the load faulted
    pub fn entities(&self) -> &[T] {
        match &self.result {
            Ok(entities) => entities,
            Err(_) => &[],
        }
    }

    /// Whether the context reported a fault
    pub fn has_error(&self) -> bool {
        self.result.is_err()
    }

    /// The fault, if any
    pub fn error(&self) -> Option<&LoadFault> {
        self.result.as_ref().err()
    }

    /// Typed view of the user state
    pub fn user_state<S: Any + Send + Sync>(&self) -> Option<&S> {
        self.user_state.as_deref().and_then(|state| state.downcast_ref::<S>())
    }
}

impl<T> fmt::Debug for LoadOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOperation")
            .field("task_id", &self.task_id)
            .field("context", &self.context)
            .field("entity_set", &self.entity_set)
            .field("load_behavior", &self.load_behavior)
            .field("entities", &self.result.as_ref().map(Vec::len))
            .field("has_user_state", &self.user_state.is_some())
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

//! Shared batch types and configuration

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::LoadBehavior;
use crate::Result;

/// Identity of a task within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random task id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    /// No run has started, or the last run was abandoned
    Idle,
    /// A run is driving tasks
    Running,
    /// The last run fired its completed notification
    Completed,
}

/// Result of one task invocation, as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Task that finished
    pub task_id: TaskId,
    /// Whether the context reported a fault
    pub faulted: bool,
    /// Time between invocation and completion
    pub elapsed: Duration,
}

/// Batch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Label attached to every log line of the batch
    pub name: String,
    /// Load behavior for tasks added without one
    pub default_load_behavior: LoadBehavior,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "query-batch".to_string(),
            default_load_behavior: LoadBehavior::KeepCurrent,
        }
    }
}

impl BatchConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the batch name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the default load behavior
    pub fn with_default_load_behavior(mut self, load_behavior: LoadBehavior) -> Self {
        self.default_load_behavior = load_behavior;
        self
    }
}

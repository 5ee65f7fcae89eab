//! In-memory data context for tests, demos and benchmarks

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::context::{DataContext, Entity, LoadBehavior, LoadFault, Query};

/// In-memory data context serving JSON entity sets
///
/// Every load is recorded in an invocation log, in the order `load` was called.
pub struct MemoryContext {
    name: String,
    entity_sets: RwLock<HashMap<String, Vec<Value>>>,
    faults: RwLock<HashMap<String, LoadFault>>,
    latency: Option<Duration>,
    invocations: Mutex<Vec<String>>,
}

impl MemoryContext {
    /// Create an empty context that completes loads on first poll
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_sets: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            latency: None,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Delay every load by `latency` on the tokio timer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed an entity set
    pub fn with_entity_set(self, entity_set: impl Into<String>, rows: Vec<Value>) -> Self {
        self.insert_entity_set(entity_set, rows);
        self
    }

    /// Replace the rows of an entity set
    pub fn insert_entity_set(&self, entity_set: impl Into<String>, rows: Vec<Value>) {
        self.entity_sets.write().insert(entity_set.into(), rows);
    }

    /// Make every load of `entity_set` fail with `fault`
    pub fn fail_entity_set(&self, entity_set: impl Into<String>, fault: LoadFault) {
        self.faults.write().insert(entity_set.into(), fault);
    }

    /// Entity sets loaded so far, in invocation order
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().clone()
    }
}

impl DataContext for MemoryContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn load<T: Entity>(
        &self,
        query: &Query<T>,
        load_behavior: LoadBehavior,
    ) -> BoxFuture<'static, Result<Vec<T>, LoadFault>> {
        let entity_set = query.entity_set().to_string();
        debug!(context = %self.name, entity_set = %entity_set, load_behavior = %load_behavior, "Memory load invoked");
        self.invocations.lock().push(entity_set.clone());

        // Resolve the rows now so the result reflects the state at invocation time
        let rows = match self.faults.read().get(&entity_set) {
            Some(fault) => Err(fault.clone()),
            None => self
                .entity_sets
                .read()
                .get(&entity_set)
                .cloned()
                .ok_or_else(|| LoadFault::UnknownEntitySet(entity_set.clone())),
        };
        let latency = self.latency;

        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            match rows {
                Ok(rows) => rows
                    .into_iter()
                    .map(|row| {
                        serde_json::from_value::<T>(row)
                            .map_err(|e| LoadFault::Materialization(format!("{}: {}", entity_set, e)))
                    })
                    .collect::<Result<Vec<T>, LoadFault>>(),
                Err(fault) => Err(fault),
            }
        })
    }
}

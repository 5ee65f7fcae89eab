//! Shared contexts for the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use query_batch::batch::QueryBatch;
use query_batch::context::{DataContext, Entity, LoadBehavior, LoadFault, Query};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// Ordered record of everything observable during a run
pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Row {
    pub id: u32,
}

pub fn rows(ids: &[u32]) -> Vec<Value> {
    ids.iter().map(|id| json!({ "id": id })).collect()
}

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn materialize<T: Entity>(rows: Vec<Value>) -> Result<Vec<T>, LoadFault> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| LoadFault::Materialization(e.to_string())))
        .collect()
}

/// Completes every load on first poll and logs invocation and completion
pub struct RecordingContext {
    name: String,
    log: EventLog,
    faults: HashMap<String, LoadFault>,
}

impl RecordingContext {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            faults: HashMap::new(),
        }
    }

    pub fn failing(mut self, entity_set: &str, fault: LoadFault) -> Self {
        self.faults.insert(entity_set.to_string(), fault);
        self
    }
}

impl DataContext for RecordingContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn load<T: Entity>(
        &self,
        query: &Query<T>,
        _load_behavior: LoadBehavior,
    ) -> BoxFuture<'static, Result<Vec<T>, LoadFault>> {
        let entity_set = query.entity_set().to_string();
        self.log.lock().push(format!("{}:invoke:{}", self.name, entity_set));

        let log = self.log.clone();
        let name = self.name.clone();
        let fault = self.faults.get(&entity_set).cloned();
        Box::pin(async move {
            log.lock().push(format!("{}:complete:{}", name, entity_set));
            match fault {
                Some(fault) => Err(fault),
                None => materialize(rows(&[1])),
            }
        })
    }
}

/// Holds every load open until the test releases it
pub struct GatedContext {
    name: String,
    log: EventLog,
    gates: Mutex<HashMap<String, oneshot::Sender<Result<Vec<Value>, LoadFault>>>>,
}

impl GatedContext {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Complete the pending load of `entity_set`; false if none is pending
    pub fn release(&self, entity_set: &str, ids: &[u32]) -> bool {
        self.resolve(entity_set, Ok(rows(ids)))
    }

    /// Fail the pending load of `entity_set`
    pub fn fail(&self, entity_set: &str, fault: LoadFault) -> bool {
        self.resolve(entity_set, Err(fault))
    }

    pub fn is_pending(&self, entity_set: &str) -> bool {
        self.gates.lock().contains_key(entity_set)
    }

    fn resolve(&self, entity_set: &str, result: Result<Vec<Value>, LoadFault>) -> bool {
        match self.gates.lock().remove(entity_set) {
            Some(gate) => gate.send(result).is_ok(),
            None => false,
        }
    }
}

impl DataContext for GatedContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn load<T: Entity>(
        &self,
        query: &Query<T>,
        _load_behavior: LoadBehavior,
    ) -> BoxFuture<'static, Result<Vec<T>, LoadFault>> {
        let entity_set = query.entity_set().to_string();
        self.log.lock().push(format!("{}:invoke:{}", self.name, entity_set));

        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(entity_set, tx);

        Box::pin(async move {
            match rx.await {
                Ok(Ok(rows)) => materialize(rows),
                Ok(Err(fault)) => Err(fault),
                Err(_) => Err(LoadFault::Cancelled),
            }
        })
    }
}

/// Yield to spawned runs until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Register a listener that logs "completed"
pub fn log_completion<C: DataContext>(batch: &QueryBatch<C>, log: &EventLog) {
    let log = log.clone();
    batch.on_completed(move || log.lock().push("completed".to_string()));
}

pub fn completions(log: &EventLog) -> usize {
    log.lock().iter().filter(|entry| *entry == "completed").count()
}

//! Query tasks: one bound load request, run behind a type-erased handle.
//!
//! [`BatchTask`] is the capability the orchestrator sees. [`QueryTask`] is the
//! concrete task for a given context and entity type; its callback receives the
//! typed [`LoadOperation`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::batch::types::{TaskId, TaskOutcome};
use crate::context::{
    DataContext, Entity, LoadBehavior, LoadFault, LoadOperation, Query, UserState,
};

/// Continuation handed to [`BatchTask::run`], called with the finished task
pub type TaskDone = Box<dyn FnOnce(&dyn BatchTask) + Send>;

/// Per-task callback receiving the materialized result
pub type LoadCallback<T> = Box<dyn FnMut(&LoadOperation<T>) + Send>;

/// A unit of work the batch can drive without knowing its result type
pub trait BatchTask: Send + Sync {
    /// Task identity
    fn id(&self) -> TaskId;

    /// Name of the context the task loads from
    fn context_name(&self) -> &str;

    /// Entity set the task queries
    fn entity_set(&self) -> &str;

    /// Whether the last invocation finished
    fn is_complete(&self) -> bool;

    /// Whether an invocation is in flight
    fn is_running(&self) -> bool;

    /// Invoke the load and return its completion.
    ///
    /// The load is issued before this returns. When it finishes the task is marked
    /// complete, its callback runs, then `on_done` runs, then the task stops running.
    /// A faulted load still completes.
    fn run(self: Arc<Self>, on_done: TaskDone) -> BoxFuture<'static, TaskOutcome>;
}

/// A load of `T` from context `C`
pub struct QueryTask<C, T> {
    id: TaskId,
    context: Arc<C>,
    query: Query<T>,
    load_behavior: LoadBehavior,
    callback: Mutex<Option<LoadCallback<T>>>,
    user_state: Option<UserState>,
    complete: AtomicBool,
    running: AtomicBool,
}

impl<C: DataContext, T: Entity> QueryTask<C, T> {
    /// Bind `query` to `context` with the default load behavior and no callback
    pub fn new(context: Arc<C>, query: Query<T>) -> Self {
        Self {
            id: TaskId::new(),
            context,
            query,
            load_behavior: LoadBehavior::default(),
            callback: Mutex::new(None),
            user_state: None,
            complete: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Set the load behavior
    pub fn with_load_behavior(mut self, load_behavior: LoadBehavior) -> Self {
        self.load_behavior = load_behavior;
        self
    }

    /// Set the callback invoked with each finished load
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&LoadOperation<T>) + Send + 'static,
    {
        self.callback = Mutex::new(Some(Box::new(callback)));
        self
    }

    /// Attach user state passed through to the callback
    pub fn with_user_state(mut self, user_state: UserState) -> Self {
        self.user_state = Some(user_state);
        self
    }

    /// Context this task is bound to
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Query this task executes
    pub fn query(&self) -> &Query<T> {
        &self.query
    }

    /// Load behavior this task uses
    pub fn load_behavior(&self) -> LoadBehavior {
        self.load_behavior
    }

    /// Run the task and call `on_done` once it finished
    pub fn run_with<F>(self: &Arc<Self>, on_done: F) -> BoxFuture<'static, TaskOutcome>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::clone(self).run(Box::new(move |_| on_done()))
    }

    fn finish(&self, result: Result<Vec<T>, LoadFault>, started: Instant) -> TaskOutcome {
        let elapsed = started.elapsed();
        let faulted = result.is_err();
        if let Err(fault) = &result {
            warn!(
                task_id = %self.id,
                context = %self.context.name(),
                entity_set = %self.query.entity_set(),
                fault = %fault,
                "Load faulted; task still completes"
            );
        }

        self.complete.store(true, Ordering::SeqCst);

        if let Some(callback) = self.callback.lock().as_mut() {
            let operation = LoadOperation {
                task_id: self.id,
                context: self.context.name().to_string(),
                entity_set: self.query.entity_set().to_string(),
                load_behavior: self.load_behavior,
                result,
                user_state: self.user_state.clone(),
                elapsed,
                completed_at: Utc::now(),
            };
            callback(&operation);
        }

        TaskOutcome {
            task_id: self.id,
            faulted,
            elapsed,
        }
    }
}

impl<C: DataContext, T: Entity> BatchTask for QueryTask<C, T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn context_name(&self) -> &str {
        self.context.name()
    }

    fn entity_set(&self) -> &str {
        self.query.entity_set()
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run(self: Arc<Self>, on_done: TaskDone) -> BoxFuture<'static, TaskOutcome> {
        self.complete.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        debug!(
            task_id = %self.id,
            context = %self.context.name(),
            entity_set = %self.query.entity_set(),
            load_behavior = %self.load_behavior,
            "Invoking load"
        );
        let started = Instant::now();
        let pending = self.context.load(&self.query, self.load_behavior);

        Box::pin(async move {
            let result = pending.await;
            let outcome = self.finish(result, started);
            let finished: &dyn BatchTask = &*self;
            on_done(finished);
            self.running.store(false, Ordering::SeqCst);
            debug!(task_id = %self.id, elapsed_ms = outcome.elapsed.as_millis(), "Task finished");
            outcome
        })
    }
}

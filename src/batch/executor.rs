//! Batch orchestrator
//!
//! Drives a list of [`BatchTask`]s either one at a time or all at once and fires
//! the completed notification exactly once per run:
//! - Sequential runs re-scan for the first incomplete task after every completion
//! - Parallel runs start every task before handling any completion
//! - Completion is detected by scanning current task state, never by counting,
//!   so tasks appended during a run are picked up
//! - Load faults do not fail the run; they reach the per-task callbacks only

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::batch::listeners::{CompletedListeners, ListenerId};
use crate::batch::task::{BatchTask, QueryTask};
use crate::batch::types::{BatchConfig, BatchState, TaskId, TaskOutcome};
use crate::batch::BatchError;
use crate::context::{DataContext, Entity, LoadBehavior, LoadOperation, Query, UserState};
use crate::{QueryBatchError, Result};

/// Ordered batch of query tasks with a single completed notification.
///
/// Cloning is cheap and every clone drives the same batch, so tasks can be
/// appended from elsewhere while a run is in flight.
pub struct QueryBatch<C> {
    inner: Arc<BatchInner<C>>,
}

struct BatchInner<C> {
    name: String,
    default_context: RwLock<Option<Arc<C>>>,
    default_load_behavior: RwLock<LoadBehavior>,
    tasks: RwLock<Vec<Arc<dyn BatchTask>>>,
    state: Mutex<BatchState>,
    completed: CompletedListeners,
}

impl<C> Clone for QueryBatch<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// First completion hand-off a parallel run rejected
type RejectedHandOff = Arc<Mutex<Option<QueryBatchError>>>;

/// Returns the batch to `Idle` if a run future is dropped before it completes
struct RunGuard<'a, C> {
    inner: &'a BatchInner<C>,
}

impl<C> Drop for RunGuard<'_, C> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if *state == BatchState::Running {
            *state = BatchState::Idle;
            warn!(batch = %self.inner.name, "Batch run abandoned before completion");
        }
    }
}

impl<C: DataContext> QueryBatch<C> {
    /// Create a batch with no default context.
    ///
    /// `C` only types the default context. A batch whose tasks all name their
    /// context through [`add_task_to`](Self::add_task_to) or [`push`](Self::push)
    /// still has to pick one, usually the context type its tasks use:
    ///
    /// ```
    /// use std::sync::Arc;
    /// use query_batch::batch::QueryBatch;
    /// use query_batch::context::{LoadBehavior, MemoryContext, Query};
    ///
    /// let crm = Arc::new(MemoryContext::new("crm"));
    /// let batch = QueryBatch::<MemoryContext>::new();
    /// batch.add_task_to(
    ///     crm,
    ///     Query::<serde_json::Value>::new("Accounts"),
    ///     LoadBehavior::KeepCurrent,
    ///     |_| {},
    ///     None,
    /// );
    /// assert!(batch.default_context().is_none());
    /// assert_eq!(batch.len(), 1);
    /// ```
    pub fn new() -> Self {
        Self::from_config(BatchConfig::default(), None)
    }

    /// Create a batch whose tasks default to `context`
    pub fn with_default_context(context: Arc<C>) -> Self {
        Self::from_config(BatchConfig::default(), Some(context))
    }

    /// Create a batch with both a default context and a default load behavior
    pub fn with_defaults(context: Arc<C>, load_behavior: LoadBehavior) -> Self {
        Self::from_config(
            BatchConfig::default().with_default_load_behavior(load_behavior),
            Some(context),
        )
    }

    /// Create a batch from configuration
    pub fn from_config(config: BatchConfig, default_context: Option<Arc<C>>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                name: config.name,
                default_context: RwLock::new(default_context),
                default_load_behavior: RwLock::new(config.default_load_behavior),
                tasks: RwLock::new(Vec::new()),
                state: Mutex::new(BatchState::Idle),
                completed: CompletedListeners::default(),
            }),
        }
    }

    /// Batch name used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Context used by tasks added without one
    pub fn default_context(&self) -> Option<Arc<C>> {
        self.inner.default_context.read().clone()
    }

    /// Replace the default context
    pub fn set_default_context(&self, context: Arc<C>) {
        *self.inner.default_context.write() = Some(context);
    }

    /// Remove the default context
    pub fn clear_default_context(&self) {
        *self.inner.default_context.write() = None;
    }

    /// Load behavior used by tasks added without one
    pub fn default_load_behavior(&self) -> LoadBehavior {
        *self.inner.default_load_behavior.read()
    }

    /// Replace the default load behavior
    pub fn set_default_load_behavior(&self, load_behavior: LoadBehavior) {
        *self.inner.default_load_behavior.write() = load_behavior;
    }

    /// Add a task against an explicit context and load behavior
    pub fn add_task_to<D, T, F>(
        &self,
        context: Arc<D>,
        query: Query<T>,
        load_behavior: LoadBehavior,
        callback: F,
        user_state: Option<UserState>,
    ) -> TaskId
    where
        D: DataContext,
        T: Entity,
        F: FnMut(&LoadOperation<T>) + Send + 'static,
    {
        let mut task = QueryTask::new(context, query)
            .with_load_behavior(load_behavior)
            .with_callback(callback);
        if let Some(user_state) = user_state {
            task = task.with_user_state(user_state);
        }
        self.push(Arc::new(task))
    }

    /// Add a task against the default context with an explicit load behavior
    pub fn add_task_with_behavior<T, F>(
        &self,
        query: Query<T>,
        load_behavior: LoadBehavior,
        callback: F,
        user_state: Option<UserState>,
    ) -> Result<TaskId>
    where
        T: Entity,
        F: FnMut(&LoadOperation<T>) + Send + 'static,
    {
        let context = self.require_default_context(&query)?;
        Ok(self.add_task_to(context, query, load_behavior, callback, user_state))
    }

    /// Add a task against the default context and default load behavior
    pub fn add_task_with_state<T, F>(
        &self,
        query: Query<T>,
        callback: F,
        user_state: Option<UserState>,
    ) -> Result<TaskId>
    where
        T: Entity,
        F: FnMut(&LoadOperation<T>) + Send + 'static,
    {
        let load_behavior = self.default_load_behavior();
        self.add_task_with_behavior(query, load_behavior, callback, user_state)
    }

    /// Add a task against the default context and default load behavior, with no user state
    pub fn add_task<T, F>(&self, query: Query<T>, callback: F) -> Result<TaskId>
    where
        T: Entity,
        F: FnMut(&LoadOperation<T>) + Send + 'static,
    {
        self.add_task_with_state(query, callback, None)
    }

    /// Append an already built task
    pub fn push(&self, task: Arc<dyn BatchTask>) -> TaskId {
        let task_id = task.id();
        debug!(
            batch = %self.inner.name,
            task_id = %task_id,
            context = %task.context_name(),
            entity_set = %task.entity_set(),
            "Task added"
        );
        self.inner.tasks.write().push(task);
        task_id
    }

    /// Drop every task; defaults and listeners are kept
    pub fn clear(&self) {
        let mut tasks = self.inner.tasks.write();
        debug!(batch = %self.inner.name, discarded = tasks.len(), "Clearing batch");
        tasks.clear();
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.inner.tasks.read().len()
    }

    /// Whether the batch holds no tasks
    pub fn is_empty(&self) -> bool {
        self.inner.tasks.read().is_empty()
    }

    /// Number of tasks not yet complete
    pub fn pending_count(&self) -> usize {
        self.inner.tasks.read().iter().filter(|task| !task.is_complete()).count()
    }

    /// Snapshot of the tasks in insertion order
    pub fn tasks(&self) -> Vec<Arc<dyn BatchTask>> {
        self.inner.tasks.read().clone()
    }

    /// Look up a task by id
    pub fn task(&self, task_id: TaskId) -> Option<Arc<dyn BatchTask>> {
        self.inner.tasks.read().iter().find(|task| task.id() == task_id).cloned()
    }

    /// Current run state
    pub fn state(&self) -> BatchState {
        *self.inner.state.lock()
    }

    /// Register a listener for the completed notification
    pub fn on_completed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.completed.add(Arc::new(listener))
    }

    /// Unregister a completed listener; false if it was not registered
    pub fn remove_completed_listener(&self, id: ListenerId) -> bool {
        self.inner.completed.remove(id)
    }

    /// Number of registered completed listeners
    pub fn completed_listener_count(&self) -> usize {
        self.inner.completed.len()
    }

    /// Run tasks one at a time in insertion order.
    ///
    /// Tasks already complete are skipped. Each task's load, callback and
    /// continuation finish before the next incomplete task is looked up.
    #[instrument(skip(self), fields(batch = %self.inner.name, tasks = self.len()))]
    pub async fn run_sequential(&self) -> Result<()> {
        let _guard = self.begin_run()?;
        let mut completed = 0usize;
        let mut faulted = 0usize;

        while let Some(task) = self.next_incomplete() {
            let outcome = task
                .run(Box::new(|done: &dyn BatchTask| {
                    debug!(task_id = %done.id(), "Task done; looking for next incomplete task");
                }))
                .await;

            completed += 1;
            if outcome.faulted {
                faulted += 1;
            }
        }

        info!(completed, faulted, "Sequential run finished");
        self.fire_completed();
        Ok(())
    }

    /// Start every task at once and wait for all of them.
    ///
    /// Every task is invoked, including tasks completed by an earlier run, before
    /// any completion is handled. A task listed more than once is started once.
    /// Each completion goes through [`task_completed`](Self::task_completed).
    ///
    /// If that handler rejects a hand-off, for example because the batch was
    /// cleared while loads were in flight, no further hand-offs are made, the
    /// completed notification does not fire and the rejection is returned once
    /// the in-flight loads have drained.
    #[instrument(skip(self), fields(batch = %self.inner.name, tasks = self.len()))]
    pub async fn run_parallel(&self) -> Result<()> {
        let _guard = self.begin_run()?;

        let tasks = self.tasks();
        if tasks.is_empty() {
            debug!("Empty batch; completing immediately");
            self.fire_completed();
            return Ok(());
        }

        let rejected: RejectedHandOff = Arc::new(Mutex::new(None));
        let mut started = HashSet::with_capacity(tasks.len());
        let mut in_flight = FuturesUnordered::new();
        for task in tasks {
            if started.insert(task.id()) {
                in_flight.push(self.start_parallel(task, &rejected));
            } else {
                debug!(task_id = %task.id(), "Task listed more than once; already started");
            }
        }
        debug!(in_flight = in_flight.len(), "All tasks invoked");

        let mut completed = 0usize;
        let mut faulted = 0usize;
        while let Some(outcome) = in_flight.next().await {
            completed += 1;
            if outcome.faulted {
                faulted += 1;
            }

            if self.state() != BatchState::Running || rejected.lock().is_some() {
                continue;
            }
            for task in self.tasks() {
                if !task.is_complete() && started.insert(task.id()) {
                    debug!(task_id = %task.id(), "Starting task appended mid-batch");
                    in_flight.push(self.start_parallel(task, &rejected));
                }
            }
        }

        info!(completed, faulted, "Parallel run finished");

        let rejection = rejected.lock().take();
        if let Some(e) = rejection {
            error!(error = %e, "Parallel run aborted by a rejected completion hand-off");
            return Err(e);
        }

        if self.state() == BatchState::Running && self.pending_count() == 0 {
            warn!("No completion report fired the notification; firing after drain");
            self.fire_completed();
        }
        Ok(())
    }

    /// Shared completion handler for parallel runs.
    ///
    /// Fails with [`BatchError::InvalidCallback`] if no task, or a task that is not
    /// in this batch, is reported. Returns true only on the call that fires the
    /// completed notification; a repeated report while other tasks are still
    /// incomplete never fires.
    pub fn task_completed(&self, task: Option<TaskId>) -> Result<bool> {
        let task_id = task.ok_or_else(|| {
            BatchError::InvalidCallback("completion reported without a task".to_string())
        })?;

        let remaining = {
            let tasks = self.inner.tasks.read();
            if !tasks.iter().any(|candidate| candidate.id() == task_id) {
                return Err(BatchError::InvalidCallback(format!(
                    "task {} is not part of batch {}",
                    task_id, self.inner.name
                ))
                .into());
            }
            tasks.iter().filter(|candidate| !candidate.is_complete()).count()
        };

        if remaining > 0 {
            debug!(batch = %self.inner.name, task_id = %task_id, remaining, "Task completed");
            return Ok(false);
        }
        Ok(self.fire_completed())
    }

    fn require_default_context<T>(&self, query: &Query<T>) -> Result<Arc<C>> {
        self.default_context().ok_or_else(|| {
            BatchError::MissingConfiguration(format!(
                "batch {} has no default context for a query on {}",
                self.inner.name,
                query.entity_set()
            ))
            .into()
        })
    }

    fn begin_run(&self) -> Result<RunGuard<'_, C>> {
        let mut state = self.inner.state.lock();
        if *state == BatchState::Running {
            return Err(BatchError::AlreadyRunning(self.inner.name.clone()).into());
        }
        *state = BatchState::Running;
        Ok(RunGuard { inner: &*self.inner })
    }

    fn next_incomplete(&self) -> Option<Arc<dyn BatchTask>> {
        self.inner.tasks.read().iter().find(|task| !task.is_complete()).cloned()
    }

    fn start_parallel(
        &self,
        task: Arc<dyn BatchTask>,
        rejected: &RejectedHandOff,
    ) -> BoxFuture<'static, TaskOutcome> {
        let batch = self.clone();
        let rejected = Arc::clone(rejected);
        task.run(Box::new(move |done: &dyn BatchTask| {
            if rejected.lock().is_some() {
                debug!(task_id = %done.id(), "Run already aborted; skipping hand-off");
                return;
            }
            if let Err(e) = batch.task_completed(Some(done.id())) {
                error!(task_id = %done.id(), error = %e, "Completion hand-off rejected");
                *rejected.lock() = Some(e);
            }
        }))
    }

    /// Running -> Completed, then notify. False if no run is in flight.
    fn fire_completed(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != BatchState::Running {
                return false;
            }
            *state = BatchState::Completed;
        }

        info!(
            batch = %self.inner.name,
            tasks = self.len(),
            listeners = self.inner.completed.len(),
            "Batch completed"
        );
        self.inner.completed.notify();
        true
    }
}

impl<C: DataContext> Default for QueryBatch<C> {
    fn default() -> Self {
        Self::new()
    }
}

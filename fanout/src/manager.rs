// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! The task manager: tables, worker slots and the lifecycle machinery.
//!
//! One [`Manager`] is instantiated per external request, fans the request's
//! subwork out through [`Manager::submit`] and [`Manager::defer`], and is
//! torn down with [`Manager::shutdown`] when the request ends. Handles are
//! cheap to clone and share the same tables.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use dashmap::DashMap;
use futures::{stream::FuturesUnordered, FutureExt as _, StreamExt as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument as _;

use crate::{
    error::{Error, Panicked},
    runnable::Runnable,
    scope::Scope,
    task::{Stats, Status, TaskId, TaskRecord},
};

/// Environment variable consulted by [`Config::from_env`].
pub const WORKER_LIMIT_ENV: &str = "WORKER_LIMIT";

const WORKERS_PER_CPU: usize = 4;

#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of concurrently running tasks. Must be greater than
    /// zero. Defaults to a multiple of the logical CPU count.
    pub worker_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_limit: WORKERS_PER_CPU * num_cpus::get().max(1),
        }
    }
}

impl Config {
    /// The default configuration with overrides read from the process
    /// environment.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(WORKER_LIMIT_ENV) {
            config.worker_limit = raw.trim().parse().map_err(|_| {
                Error::Argument(format!(
                    "{} must be a positive integer, got `{}`",
                    WORKER_LIMIT_ENV, raw
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.worker_limit == 0 {
            return Err(Error::Argument(
                "worker limit must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// The request-scoped task manager.
///
/// Submitted work units run as independent workers, bounded by the worker
/// slot semaphore. Every public operation is safe to call from any number of
/// handles concurrently.
pub struct Manager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Manager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    config: Config,
    tasks: DashMap<TaskId, Entry<T>>,
    slots: Arc<Semaphore>,
    /// Checked and set under this mutex together with table insertion, so a
    /// submission can never slip in after shutdown started.
    shutdown: Mutex<bool>,
    tracker: TaskTracker,
}

/// One slot in the task table: either a live (or finished) async task, or a
/// deferral waiting for its first awaiter.
enum Entry<T> {
    Async(Arc<AsyncTask<T>>),
    Deferred(Arc<DeferredTask<T>>),
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Async(task) => Self::Async(Arc::clone(task)),
            Self::Deferred(deferred) => Self::Deferred(Arc::clone(deferred)),
        }
    }
}

struct AsyncTask<T> {
    id: TaskId,
    /// Completion latch: fired exactly once, after the outcome is written.
    latch: CancellationToken,
    /// The task scope's trigger, recorded so [`Manager::cancel`] and
    /// shutdown can fire it.
    trigger: CancellationToken,
    state: RwLock<TaskState<T>>,
}

struct TaskState<T> {
    status: Status,
    started_at: Option<SystemTime>,
    started: Option<Instant>,
    duration: Option<Duration>,
    outcome: Option<Result<T, Error>>,
}

impl<T: Clone> AsyncTask<T> {
    fn new(id: TaskId, trigger: CancellationToken) -> Self {
        Self {
            id,
            latch: CancellationToken::new(),
            trigger,
            state: RwLock::new(TaskState {
                status: Status::Pending,
                started_at: None,
                started: None,
                duration: None,
                outcome: None,
            }),
        }
    }

    /// A task that was refused at submission and is born terminal.
    fn rejected(id: TaskId) -> Arc<Self> {
        let task = Arc::new(Self::new(id, CancellationToken::new()));
        task.finish(Status::Canceled, Err(Error::Canceled));
        task
    }

    fn start(&self) {
        let mut state = self.state.write();
        if state.status == Status::Pending {
            state.status = Status::Running;
            state.started_at = Some(SystemTime::now());
            state.started = Some(Instant::now());
        }
    }

    fn finish(&self, status: Status, outcome: Result<T, Error>) {
        {
            let mut state = self.state.write();
            if state.outcome.is_some() {
                return;
            }
            state.duration = state.started.map(|started| started.elapsed());
            state.status = status;
            state.outcome = Some(outcome);
        }
        self.latch.cancel();
    }

    fn status(&self) -> Status {
        self.state.read().status
    }

    fn record(&self) -> TaskRecord<T> {
        let state = self.state.read();
        TaskRecord {
            id: self.id,
            result: state
                .outcome
                .as_ref()
                .and_then(|outcome| outcome.as_ref().ok().cloned()),
            error: state
                .outcome
                .as_ref()
                .and_then(|outcome| outcome.as_ref().err().cloned()),
            start_time: state.started_at,
            duration: state.duration,
            status: state.status,
        }
    }
}

struct DeferredTask<T> {
    id: TaskId,
    /// The scope captured at submission; promotion runs under it, not under
    /// the awaiter's scope.
    scope: Scope,
    runnable: Mutex<Option<Box<dyn Runnable<T>>>>,
    /// One-shot promotion guard; all concurrent first-awaiters agree on the
    /// id it resolves to.
    promoted: OnceCell<TaskId>,
}

impl<T> Manager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A manager with the default [`Config`].
    pub fn new() -> Self {
        Self::build(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: Config) -> Self {
        let slots = Arc::new(Semaphore::new(config.worker_limit.min(Semaphore::MAX_PERMITS)));
        Self {
            inner: Arc::new(Inner {
                config,
                tasks: DashMap::new(),
                slots,
                shutdown: Mutex::new(false),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.inner.config.worker_limit
    }

    /// Submit a work unit for execution, returning its id immediately.
    ///
    /// The unit starts as soon as a worker slot is free and runs under a
    /// child of `scope`: cancelling the submission scope, or the id, stops
    /// it. While the manager is shutting down the returned id is already in
    /// terminal `Canceled` state and the unit never runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<R>(&self, scope: &Scope, runnable: R) -> TaskId
    where
        R: Runnable<T> + 'static,
    {
        self.submit_boxed(scope, Box::new(runnable))
    }

    fn submit_boxed(&self, scope: &Scope, runnable: Box<dyn Runnable<T>>) -> TaskId {
        let id = TaskId::generate();
        let task_scope = scope.child();
        let task = Arc::new(AsyncTask::new(id, task_scope.trigger()));
        {
            let shutting_down = self.inner.shutdown.lock();
            if *shutting_down {
                task.finish(Status::Canceled, Err(Error::Canceled));
                self.inner.tasks.insert(id, Entry::Async(task));
                tracing::debug!(task = %id, "submission refused, shutting down");
                return id;
            }
            self.inner.tasks.insert(id, Entry::Async(Arc::clone(&task)));
        }
        tracing::debug!(task = %id, "task submitted");

        let worker = Self::work(Arc::clone(&self.inner.slots), task, task_scope, runnable);
        let _ = tokio::spawn(self.inner.tracker.track_future(worker).in_current_span());
        id
    }

    /// Record a work unit without running it; execution starts on the first
    /// [`Manager::wait`] for the returned id.
    pub fn defer<R>(&self, scope: &Scope, runnable: R) -> TaskId
    where
        R: Runnable<T> + 'static,
    {
        let id = TaskId::generate();
        let shutting_down = self.inner.shutdown.lock();
        if *shutting_down {
            self.inner.tasks.insert(id, Entry::Async(AsyncTask::rejected(id)));
            tracing::debug!(task = %id, "deferral refused, shutting down");
            return id;
        }
        self.inner.tasks.insert(
            id,
            Entry::Deferred(Arc::new(DeferredTask {
                id,
                scope: scope.clone(),
                runnable: Mutex::new(Some(Box::new(runnable))),
                promoted: OnceCell::new(),
            })),
        );
        drop(shutting_down);
        tracing::debug!(task = %id, "task deferred");
        id
    }

    async fn work(
        slots: Arc<Semaphore>,
        task: Arc<AsyncTask<T>>,
        scope: Scope,
        runnable: Box<dyn Runnable<T>>,
    ) {
        let acquired = tokio::select! {
            biased;
            _ = scope.done() => None,
            permit = slots.acquire_owned() => Some(permit),
        };
        let permit = match acquired {
            Some(Ok(permit)) => permit,
            Some(Err(_)) | None => {
                task.finish(Status::Canceled, Err(scope.err().unwrap_or(Error::Canceled)));
                return;
            },
        };

        task.start();
        tracing::trace!(task = %task.id, "task running");

        let result = AssertUnwindSafe(runnable.run(scope.clone()))
            .catch_unwind()
            .await;

        let (status, outcome) = match result {
            Err(payload) => {
                let panicked = Panicked::from_payload(payload);
                tracing::warn!(task = %task.id, err = %panicked, "task panicked");
                (
                    Status::Failed,
                    Err(Error::failed(anyhow::Error::new(panicked))),
                )
            },
            Ok(_) if scope.is_done() => (
                Status::Canceled,
                Err(scope.err().unwrap_or(Error::Canceled)),
            ),
            Ok(Ok(value)) => (Status::Completed, Ok(value)),
            Ok(Err(err)) => {
                tracing::debug!(task = %task.id, err = %err, "task failed");
                (Status::Failed, Err(Error::failed(err)))
            },
        };
        task.finish(status, outcome);
        drop(permit);
    }

    /// Wait for a task to reach a terminal state and return its record.
    ///
    /// A deferred id is promoted on its first wait: the captured work unit is
    /// submitted under the scope captured at deferral, and this (and every
    /// later) wait follows the promoted task. Waiting is repeatable; once a
    /// task finished, every caller observes the identical record.
    ///
    /// When `scope` fires before the task finishes, the task is canceled and
    /// the scope's timeout or cancellation error is returned.
    pub async fn wait(&self, scope: &Scope, id: TaskId) -> Result<TaskRecord<T>, Error> {
        let entry = self.entry(id).ok_or(Error::NotFound(id))?;
        match entry {
            Entry::Async(task) => self.wait_task(scope, &task).await,
            Entry::Deferred(deferred) => {
                let promoted = self.promote(&deferred).await;
                match self.entry(promoted) {
                    Some(Entry::Async(task)) => self.wait_task(scope, &task).await,
                    _ => Err(Error::NotFound(promoted)),
                }
            },
        }
    }

    async fn promote(&self, deferred: &DeferredTask<T>) -> TaskId {
        *deferred
            .promoted
            .get_or_init(|| async {
                let runnable = deferred.runnable.lock().take();
                match runnable {
                    Some(runnable) => {
                        let id = self.submit_boxed(&deferred.scope, runnable);
                        tracing::debug!(deferred = %deferred.id, task = %id, "deferred task promoted");
                        id
                    },
                    // the slot is only drained by this one-shot init
                    None => unreachable!("deferred runnable taken before promotion"),
                }
            })
            .await
    }

    async fn wait_task(&self, scope: &Scope, task: &AsyncTask<T>) -> Result<TaskRecord<T>, Error> {
        tokio::select! {
            biased;
            _ = task.latch.cancelled() => {
                let record = task.record();
                match &record.error {
                    Some(err) => Err(err.clone()),
                    None => Ok(record),
                }
            },
            _ = scope.done() => {
                self.cancel(task.id);
                Err(scope.err().unwrap_or(Error::Canceled))
            },
        }
    }

    /// Wait for all of `ids`, returning records in input order.
    ///
    /// The first task-level error is returned as-is; the remaining tasks are
    /// left running. Only when `scope` fires is every listed id canceled.
    pub async fn wait_all(
        &self,
        scope: &Scope,
        ids: &[TaskId],
    ) -> Result<Vec<TaskRecord<T>>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let group = scope.child();
        let mut waiters = ids
            .iter()
            .copied()
            .enumerate()
            .map(|(index, id)| {
                let group = group.clone();
                async move { (index, self.wait(&group, id).await) }
            })
            .collect::<FuturesUnordered<_>>();

        let mut records: Vec<Option<TaskRecord<T>>> = Vec::with_capacity(ids.len());
        records.resize_with(ids.len(), || None);
        let mut missing = ids.len();
        while missing > 0 {
            tokio::select! {
                biased;
                _ = scope.done() => {
                    for id in ids {
                        self.cancel(*id);
                    }
                    return Err(scope.err().unwrap_or(Error::Canceled));
                },
                Some((index, outcome)) = waiters.next() => match outcome {
                    Ok(record) => {
                        records[index] = Some(record);
                        missing -= 1;
                    },
                    Err(err) => return Err(err),
                },
            }
        }
        Ok(records.into_iter().flatten().collect())
    }

    /// Wait for the first of `ids` to finish.
    ///
    /// On the first successful completion every other listed id is canceled
    /// and the winner's record returned. On the first failure, or when
    /// `scope` fires, every listed id is canceled.
    pub async fn wait_any(&self, scope: &Scope, ids: &[TaskId]) -> Result<TaskRecord<T>, Error> {
        if ids.is_empty() {
            return Ok(TaskRecord::empty());
        }
        let group = scope.child();
        let mut waiters = ids
            .iter()
            .copied()
            .map(|id| {
                let group = group.clone();
                async move { (id, self.wait(&group, id).await) }
            })
            .collect::<FuturesUnordered<_>>();

        tokio::select! {
            biased;
            _ = scope.done() => {
                for id in ids {
                    self.cancel(*id);
                }
                Err(scope.err().unwrap_or(Error::Canceled))
            },
            Some((winner, outcome)) = waiters.next() => match outcome {
                Ok(record) => {
                    for id in ids {
                        if *id != winner {
                            self.cancel(*id);
                        }
                    }
                    Ok(record)
                },
                Err(err) => {
                    for id in ids {
                        self.cancel(*id);
                    }
                    Err(err)
                },
            },
        }
    }

    /// Cancel a task and purge it from the tables.
    ///
    /// Returns whether the id existed. Cancellation is a request: a worker
    /// already polling its unit finishes on its own schedule, but its state
    /// is no longer reachable and later lookups report not-found.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.inner.tasks.remove(&id) {
            None => false,
            Some((_, Entry::Async(task))) => {
                task.trigger.cancel();
                tracing::debug!(task = %id, "task canceled");
                true
            },
            Some((_, Entry::Deferred(deferred))) => {
                if let Some(promoted) = deferred.promoted.get() {
                    self.cancel(*promoted);
                }
                tracing::debug!(task = %id, "deferred task canceled");
                true
            },
        }
    }

    /// The current status of a task, following promotion for deferred ids.
    /// Unknown ids report [`Status::Unknown`].
    pub fn status(&self, id: TaskId) -> Status {
        match self.entry(id) {
            None => Status::Unknown,
            Some(Entry::Async(task)) => task.status(),
            Some(Entry::Deferred(deferred)) => match deferred.promoted.get() {
                Some(promoted) => self.status(*promoted),
                None => Status::Deferred,
            },
        }
    }

    /// A point-in-time record of a task, without waiting. Unknown ids yield
    /// a minimal record carrying a not-found error.
    pub fn task(&self, id: TaskId) -> TaskRecord<T> {
        match self.entry(id) {
            None => TaskRecord::not_found(id),
            Some(Entry::Async(task)) => task.record(),
            Some(Entry::Deferred(deferred)) => match deferred.promoted.get() {
                Some(promoted) => self.task(*promoted),
                None => TaskRecord::deferred(id),
            },
        }
    }

    /// Remove terminal entries whose start time is older than `ttl`; a zero
    /// `ttl` removes every terminal entry. Deferred, pending and running
    /// entries are never pruned. Returns the number removed.
    pub fn prune(&self, ttl: Duration) -> usize {
        let mut dead = Vec::new();
        let mut forwarders = Vec::new();
        for entry in self.inner.tasks.iter() {
            match entry.value() {
                Entry::Async(task) => {
                    let state = task.state.read();
                    let expired = ttl.is_zero()
                        || state
                            .started
                            .map(|started| started.elapsed() > ttl)
                            .unwrap_or(true);
                    if state.status.is_terminal() && expired {
                        dead.push(task.id);
                    }
                },
                Entry::Deferred(deferred) => {
                    if let Some(promoted) = deferred.promoted.get() {
                        forwarders.push((deferred.id, *promoted));
                    }
                },
            }
        }
        for (id, promoted) in forwarders {
            if dead.contains(&promoted) || !self.inner.tasks.contains_key(&promoted) {
                dead.push(id);
            }
        }
        let mut pruned = 0;
        for id in dead {
            if self.inner.tasks.remove(&id).is_some() {
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::debug!(pruned, "terminal tasks pruned");
        }
        pruned
    }

    /// Stop accepting work, cancel everything, and wait for in-flight
    /// workers until `scope` gives up. All tables are purged either way.
    pub async fn shutdown(&self, scope: &Scope) {
        {
            let mut shutting_down = self.inner.shutdown.lock();
            *shutting_down = true;
        }
        tracing::debug!("manager shutting down");
        for entry in self.inner.tasks.iter() {
            if let Entry::Async(task) = entry.value() {
                task.trigger.cancel();
            }
        }
        self.inner.tracker.close();
        tokio::select! {
            _ = self.inner.tracker.wait() => {},
            _ = scope.done() => {},
        }
        self.inner.tasks.clear();
    }

    /// Per-status totals over the current table contents.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for entry in self.inner.tasks.iter() {
            let status = match entry.value() {
                Entry::Async(task) => task.status(),
                Entry::Deferred(deferred) => {
                    if deferred.promoted.get().is_some() {
                        // counted through the promoted entry
                        continue;
                    }
                    Status::Deferred
                },
            };
            match status {
                Status::Deferred => stats.deferred += 1,
                Status::Pending => stats.pending += 1,
                Status::Running => stats.running += 1,
                Status::Completed => stats.completed += 1,
                Status::Failed => stats.failed += 1,
                Status::Canceled => stats.canceled += 1,
                Status::Unknown => {},
            }
            stats.total += 1;
        }
        stats
    }

    fn entry(&self, id: TaskId) -> Option<Entry<T>> {
        self.inner.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Attach this manager to a scope, so nested code can recover it with
    /// [`Manager::from_scope`] instead of threading it through every call.
    pub fn bind_to(&self, scope: &Scope) -> Scope {
        scope.with_binding(Arc::new(self.clone()))
    }

    /// The manager attached to `scope`, or a fresh default manager when none
    /// (or one with a different value type) is attached.
    pub fn from_scope(scope: &Scope) -> Self {
        scope
            .binding()
            .and_then(|value| value.downcast_ref::<Self>())
            .cloned()
            .unwrap_or_default()
    }
}

impl Scope {
    /// Derive a scope carrying `manager`; the counterpart of
    /// [`Manager::from_scope`].
    pub fn with_manager<T>(&self, manager: &Manager<T>) -> Scope
    where
        T: Clone + Send + Sync + 'static,
    {
        manager.bind_to(self)
    }
}

impl<T> Default for Manager<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Manager<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Manager")
            .field("worker_limit", &self.inner.config.worker_limit)
            .field("tasks", &self.inner.tasks.len())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        tracing::trace!("manager dropped, firing remaining task scopes");
        for entry in self.tasks.iter() {
            if let Entry::Async(task) = entry.value() {
                task.trigger.cancel();
            }
        }
    }
}

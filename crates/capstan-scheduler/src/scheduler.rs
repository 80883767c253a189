//! The scheduler facade.
//!
//! Wires the store, dictionary, managed configuration, poller, monitor,
//! and pool together, and exposes the public surface: `schedule`,
//! `ensure_scheduled`, `run_now`, `fetch`, `get`, `remove`, plus the
//! lifecycle event stream.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► setup (register definitions, add middleware) ──► start ──► stop
//! ```
//!
//! Setup-phase registration after `start` fails with `AlreadyStarted`;
//! operations before `start` fail with `NotInitialized`. The facade owns
//! every in-memory singleton; runners receive non-owning handles (the
//! buffered store and the event bus) and never reference the facade back.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use capstan_core::TaskId;

use crate::backoff::RetryBackoff;
use crate::config::SchedulerConfig;
use crate::dictionary::{TaskDefinition, TaskTypeDictionary};
use crate::document::{TaskDocument, TaskInstance, TaskStatus};
use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent, TaskEventKind};
use crate::health::{HealthStatus, MonitoredStats, StatsHandle};
use crate::managed::ManagedConfiguration;
use crate::metrics::{time_claim_cycle, SchedulerMetrics};
use crate::middleware::SchedulingMiddleware;
use crate::monitor::{ObservableMonitor, PollerFactory};
use crate::pool::TaskPool;
use crate::poller::{CapacityFn, PollerActivity, RequestBuffer, TaskPoller, WorkHandler};
use crate::store::buffered::BufferedStore;
use crate::store::{ClaimRequest, FetchResult, SearchOpts, StoreErrorKind, TaskStore};

/// How long `stop` waits for in-flight runners to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reply to a successful `run_now` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunNowResult {
    /// The task that ran.
    pub id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Setup,
    Running,
    Stopped,
}

/// Handles owned by a started scheduler.
struct SchedulerRuntime {
    shutdown: CancellationToken,
    pool: TaskPool,
    requests: Arc<RequestBuffer>,
    poll_interval: watch::Receiver<Duration>,
    drivers: Vec<JoinHandle<()>>,
}

/// The coordination facade.
///
/// One `TaskScheduler` per process instance; peers coordinate purely
/// through the shared task store.
pub struct TaskScheduler {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    dictionary: Arc<TaskTypeDictionary>,
    middleware: RwLock<Vec<Arc<dyn SchedulingMiddleware>>>,
    events: EventBus,
    stats: StatsHandle,
    phase: Mutex<Phase>,
    runtime: Mutex<Option<SchedulerRuntime>>,
}

impl TaskScheduler {
    /// Creates a scheduler in the setup phase.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid.
    pub fn new(config: SchedulerConfig, store: Arc<dyn TaskStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            dictionary: Arc::new(TaskTypeDictionary::new()),
            middleware: RwLock::new(Vec::new()),
            events: EventBus::default(),
            stats: StatsHandle::new(),
            phase: Mutex::new(Phase::Setup),
            runtime: Mutex::new(None),
        })
    }

    /// Registers one task definition. Setup phase only.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` after `start`, `InvalidConfig` on a
    /// duplicate type name.
    pub fn register_task_definition(
        &self,
        task_type: impl Into<String>,
        definition: TaskDefinition,
    ) -> Result<()> {
        self.dictionary.register(task_type, definition)
    }

    /// Registers a batch of task definitions. Setup phase only.
    ///
    /// # Errors
    ///
    /// Returns the first registration error encountered.
    pub fn register_task_definitions(
        &self,
        definitions: impl IntoIterator<Item = (String, TaskDefinition)>,
    ) -> Result<()> {
        for (task_type, definition) in definitions {
            self.dictionary.register(task_type, definition)?;
        }
        Ok(())
    }

    /// Adds a scheduling middleware. Setup phase only.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` after `start`.
    pub fn add_middleware(&self, middleware: Arc<dyn SchedulingMiddleware>) -> Result<()> {
        if self.current_phase() != Phase::Setup {
            return Err(Error::AlreadyStarted {
                message: "middleware must be added before start".to_string(),
            });
        }
        let mut chain = self
            .middleware
            .write()
            .map_err(|_| Error::storage("middleware lock poisoned"))?;
        chain.push(middleware);
        Ok(())
    }

    /// Subscribes to the lifecycle event stream.
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Starts polling: seals the dictionary and spawns the managed
    /// configuration, buffered-store flusher, poller, and monitor.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` when called twice.
    pub fn start(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != Phase::Setup {
                return Err(Error::AlreadyStarted {
                    message: "start may only be called once".to_string(),
                });
            }
            *phase = Phase::Running;
        }

        self.dictionary.seal();

        if !self.config.enabled {
            info!("scheduler disabled by configuration, polling is off");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let mut drivers = Vec::new();

        let managed = Arc::new(ManagedConfiguration::new(&self.config));
        {
            let managed = Arc::clone(&managed);
            let errors = self.store.error_stream();
            let token = shutdown.child_token();
            drivers.push(tokio::spawn(async move {
                managed.run(errors, token).await;
            }));
        }

        let buffered = BufferedStore::new(Arc::clone(&self.store), managed.max_workers());
        let pool = TaskPool::new(managed.max_workers());
        let requests = Arc::new(RequestBuffer::new(self.config.request_capacity));
        let activity = Arc::new(PollerActivity::new());

        let context = Arc::new(PollContext {
            store: Arc::clone(&self.store),
            buffered,
            dictionary: Arc::clone(&self.dictionary),
            pool: pool.clone(),
            events: self.events.clone(),
            backoff: RetryBackoff::default(),
            default_max_attempts: self.config.max_attempts,
            claim_window: self.config.claim_window,
            stats: self.stats.clone(),
            metrics: SchedulerMetrics::new(),
        });

        let work: WorkHandler = {
            let context = Arc::clone(&context);
            Arc::new(move |ids| {
                let context = Arc::clone(&context);
                Box::pin(async move { context.poll_for_work(ids).await })
            })
        };
        let capacity: CapacityFn = {
            let pool = pool.clone();
            Arc::new(move || pool.available_workers())
        };

        let factory: PollerFactory = {
            let requests = Arc::clone(&requests);
            let activity = Arc::clone(&activity);
            let poll_interval = managed.poll_interval();
            let cycles = self.config.max_poll_inactivity_cycles;
            Arc::new(move || {
                TaskPoller::new(
                    Arc::clone(&requests),
                    Arc::clone(&activity),
                    poll_interval.clone(),
                    cycles,
                    Arc::clone(&work),
                    Arc::clone(&capacity),
                )
            })
        };

        let monitor = ObservableMonitor::new(
            factory,
            activity,
            managed.poll_interval(),
            self.config.max_poll_inactivity_cycles,
        );
        {
            let token = shutdown.child_token();
            drivers.push(tokio::spawn(async move {
                monitor.run(token).await;
            }));
        }

        let poll_interval = managed.poll_interval();
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        *runtime = Some(SchedulerRuntime {
            shutdown,
            pool,
            requests,
            poll_interval,
            drivers,
        });

        info!(owner = %self.store.owner_id(), "task scheduler started");
        Ok(())
    }

    /// Stops polling and cancels in-flight work.
    ///
    /// New claims stop immediately; executors receive the abort signal and
    /// get a short grace period to drain. Tasks that keep running lose
    /// their write authority once their lease expires.
    pub async fn stop(&self) {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != Phase::Running {
                return;
            }
            *phase = Phase::Stopped;
        }

        let runtime = {
            let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            runtime.take()
        };
        let Some(runtime) = runtime else { return };

        runtime.shutdown.cancel();
        runtime.pool.cancel_running();
        if !runtime.pool.wait_idle(SHUTDOWN_GRACE).await {
            warn!(
                running = runtime.pool.running(),
                "shutdown grace elapsed with tasks still in flight"
            );
        }
        for driver in runtime.drivers {
            let _ = driver.await;
        }
        info!("task scheduler stopped");
    }

    /// Schedules a new task.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `start`, middleware errors, and
    /// `VersionConflict` when a task with the same ID already exists.
    pub async fn schedule(&self, instance: TaskInstance) -> Result<TaskDocument> {
        self.ensure_running()?;
        let instance = self.apply_middleware(instance).await?;
        let doc = instance.into_document_at(Utc::now());
        self.store.create(doc).await
    }

    /// Schedules a task, treating "already exists" as success.
    ///
    /// Idempotent creation for tasks with caller-supplied stable IDs:
    /// a `VersionConflict` returns the supplied instance's document as if
    /// it had just been created.
    ///
    /// # Errors
    ///
    /// Returns every error `schedule` can, except `VersionConflict`.
    pub async fn ensure_scheduled(&self, instance: TaskInstance) -> Result<TaskDocument> {
        self.ensure_running()?;
        let instance = self.apply_middleware(instance).await?;
        let doc = instance.into_document_at(Utc::now());
        match self.store.create(doc.clone()).await {
            Ok(created) => Ok(created),
            Err(err) if err.is_version_conflict() => Ok(doc),
            Err(err) => Err(err),
        }
    }

    /// Requests an immediate run of a scheduled task.
    ///
    /// Enqueues an explicit claim request and resolves when the task's
    /// lifecycle produces a terminal event: `Ok` on a successful run,
    /// an error when the request is refused, the claim fails (missing or
    /// currently running task), or the run fails.
    ///
    /// Callers may drop the returned future without affecting the task's
    /// actual execution.
    ///
    /// # Errors
    ///
    /// `RequestCapacityReached` when the request buffer is full,
    /// `TaskNotFound` / `CurrentlyRunning` from claim diagnosis, or the
    /// run's own failure.
    pub async fn run_now(&self, id: &TaskId) -> Result<RunNowResult> {
        self.ensure_running()?;

        // Subscribe before enqueueing so the terminal event cannot be
        // missed, however fast the lifecycle completes.
        let mut events = self.events.subscribe();

        let requests = {
            let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(runtime) = runtime.as_ref() else {
                return Err(Error::InvalidConfig {
                    message: "run_now requires polling, but the scheduler is disabled".to_string(),
                });
            };
            Arc::clone(&runtime.requests)
        };

        if let Err(err) = requests.request(id.clone()) {
            self.events.publish(TaskEvent::err(
                TaskEventKind::RunRequest,
                id.clone(),
                Arc::new(err),
            ));
            return Err(Error::RequestCapacityReached {
                task_id: id.clone(),
            });
        }
        self.events
            .publish(TaskEvent::ok(TaskEventKind::RunRequest, id.clone(), None));

        loop {
            match events.recv().await {
                Ok(event) => {
                    if event.task_id != *id || !event.is_terminal_for_run_now() {
                        continue;
                    }
                    return match event.outcome.err() {
                        None => Ok(RunNowResult { id: id.clone() }),
                        Some(err) => Err(detach_error(err)),
                    };
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "run_now subscriber lagged behind the event stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(Error::storage("event stream closed while awaiting run_now"));
                }
            }
        }
    }

    /// Gets a task document by ID.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` when absent.
    pub async fn get(&self, id: &TaskId) -> Result<TaskDocument> {
        self.ensure_running()?;
        self.store.get(id).await
    }

    /// Read-only listing of task documents.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying store.
    pub async fn fetch(&self, opts: SearchOpts) -> Result<FetchResult> {
        self.ensure_running()?;
        self.store.fetch(opts).await
    }

    /// Removes a task document. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the underlying store.
    pub async fn remove(&self, id: &TaskId) -> Result<()> {
        self.ensure_running()?;
        self.store.remove(id).await
    }

    /// Returns the latest monitoring snapshot and its derived status.
    #[must_use]
    pub fn health(&self) -> (HealthStatus, MonitoredStats) {
        let stats = self.stats.snapshot();
        let poll_interval = {
            let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            runtime
                .as_ref()
                .map_or(self.config.poll_interval, |runtime| {
                    *runtime.poll_interval.borrow()
                })
        };
        let status = stats.status_at(Utc::now(), poll_interval, self.config.required_freshness());
        (status, stats)
    }

    fn current_phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.current_phase() {
            Phase::Running => Ok(()),
            Phase::Setup | Phase::Stopped => Err(Error::NotInitialized),
        }
    }

    async fn apply_middleware(&self, mut instance: TaskInstance) -> Result<TaskInstance> {
        let chain: Vec<Arc<dyn SchedulingMiddleware>> = {
            let chain = self
                .middleware
                .read()
                .map_err(|_| Error::storage("middleware lock poisoned"))?;
            chain.clone()
        };
        for middleware in chain {
            instance = middleware.before_save(instance).await?;
        }
        Ok(instance)
    }
}

/// Everything one poll cycle needs, shared with the poller's work closure.
///
/// Runners built here hold only the buffered store and the event bus, so
/// no reference cycle back to the facade exists.
struct PollContext {
    store: Arc<dyn TaskStore>,
    buffered: BufferedStore,
    dictionary: Arc<TaskTypeDictionary>,
    pool: TaskPool,
    events: EventBus,
    backoff: RetryBackoff,
    default_max_attempts: u32,
    claim_window: Duration,
    stats: StatsHandle,
    metrics: SchedulerMetrics,
}

impl PollContext {
    /// One claim cycle: claim eligible work, diagnose unfulfilled explicit
    /// requests, wrap documents in runners, hand them to the pool.
    ///
    /// Never propagates errors into the polling loop; failures are logged,
    /// classified, and reflected on the event stream.
    async fn poll_for_work(self: Arc<Self>, requested: Vec<TaskId>) -> crate::error::Result<()> {
        let _timer = time_claim_cycle();
        let capacity = self.pool.available_workers();

        if capacity == 0 {
            // A saturated pool claims nothing; explicit requests are
            // answered rather than left to hang.
            for id in requested {
                self.events.publish(TaskEvent::err(
                    TaskEventKind::Claim,
                    id.clone(),
                    Arc::new(Error::ClaimFailed { task_id: id }),
                ));
            }
            self.stats.record_cycle(0, self.pool.running());
            self.metrics.record_claim_cycle("no_capacity", 0);
            return Ok(());
        }

        let request = ClaimRequest::new(capacity, Utc::now() + chrono_window(self.claim_window))
            .with_tasks_by_id(requested.clone());

        let claim = match self.store.claim_available(request).await {
            Ok(claim) => claim,
            Err(err) => {
                let kind = StoreErrorKind::classify(&err.to_string());
                match kind {
                    StoreErrorKind::Fatal => {
                        warn!(error = %err, "fatal store error, skipping claim cycle");
                    }
                    StoreErrorKind::Overload | StoreErrorKind::Other => {
                        warn!(error = %err, "claim cycle failed");
                    }
                }
                self.metrics.record_claim_cycle("error", 0);
                // Settle any waiting run_now callers for this cycle.
                let shared = Arc::new(err);
                for id in requested {
                    self.events.publish(TaskEvent::err(
                        TaskEventKind::Claim,
                        id,
                        Arc::clone(&shared),
                    ));
                }
                return Ok(());
            }
        };

        if claim.claimed_count != claim.docs.len() {
            warn!(
                reported = claim.claimed_count,
                materialized = claim.docs.len(),
                "store claim count disagrees with returned documents"
            );
        }

        // Diagnose explicit requests the claim did not fulfill.
        for id in &requested {
            if claim.docs.iter().any(|doc| doc.id == *id) {
                continue;
            }
            let err = self.diagnose_unclaimed(id).await;
            self.events
                .publish(TaskEvent::err(TaskEventKind::Claim, id.clone(), Arc::new(err)));
        }

        for doc in &claim.docs {
            self.events.publish(TaskEvent::ok(
                TaskEventKind::Claim,
                doc.id.clone(),
                Some(doc.clone()),
            ));
        }

        let claimed = claim.docs.len();
        let runners: Vec<_> = claim
            .docs
            .into_iter()
            .map(|doc| {
                crate::runner::TaskRunner::new(
                    doc,
                    &self.dictionary,
                    self.buffered.clone(),
                    self.events.clone(),
                    self.backoff,
                    self.default_max_attempts,
                )
            })
            .collect();

        let outcome = self.pool.run(runners);
        if !outcome.rejected.is_empty() {
            debug!(
                rejected = outcome.rejected.len(),
                "claimed more than the pool accepted, claims will lapse"
            );
        }

        self.stats.record_cycle(claimed, self.pool.running());
        self.metrics.record_claim_cycle(
            if claimed == 0 { "empty" } else { "claimed" },
            claimed,
        );
        Ok(())
    }

    /// Distinguishes why an explicitly requested task was not claimed.
    async fn diagnose_unclaimed(&self, id: &TaskId) -> Error {
        match self.store.get_lifecycle(id).await {
            Ok(None) => Error::TaskNotFound {
                task_id: id.clone(),
            },
            Ok(Some(TaskStatus::Running)) => Error::CurrentlyRunning {
                task_id: id.clone(),
            },
            Ok(Some(_)) => Error::ClaimFailed {
                task_id: id.clone(),
            },
            Err(err) => err,
        }
    }
}

/// Converts a claim window into a chrono duration.
fn chrono_window(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

/// Reconstructs an owned error from a shared event error.
///
/// Event errors fan out behind `Arc`; `run_now` returns an owned error,
/// preserving the variants callers match on.
fn detach_error(err: &Arc<Error>) -> Error {
    match err.as_ref() {
        Error::VersionConflict { task_id } => Error::VersionConflict {
            task_id: task_id.clone(),
        },
        Error::TaskNotFound { task_id } => Error::TaskNotFound {
            task_id: task_id.clone(),
        },
        Error::CurrentlyRunning { task_id } => Error::CurrentlyRunning {
            task_id: task_id.clone(),
        },
        Error::UnknownTaskType { task_type } => Error::UnknownTaskType {
            task_type: task_type.clone(),
        },
        Error::ClaimFailed { task_id } => Error::ClaimFailed {
            task_id: task_id.clone(),
        },
        Error::ExecutorFailed { message } => Error::ExecutorFailed {
            message: message.clone(),
        },
        Error::ExecutorTimedOut { task_id, timeout } => Error::ExecutorTimedOut {
            task_id: task_id.clone(),
            timeout: *timeout,
        },
        Error::RequestCapacityReached { task_id } => Error::RequestCapacityReached {
            task_id: task_id.clone(),
        },
        other => Error::storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{ExecutionContext, ExecutorOutcome, TaskExecutor};
    use crate::store::memory::InMemoryTaskStore;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    struct NoOpExecutor;

    #[async_trait]
    impl TaskExecutor for NoOpExecutor {
        async fn run(&self, _ctx: ExecutionContext) -> Result<ExecutorOutcome> {
            Ok(ExecutorOutcome::new(JsonValue::Null))
        }
    }

    fn noop_definition() -> TaskDefinition {
        TaskDefinition::new(
            "no-op",
            Arc::new(|_doc| Arc::new(NoOpExecutor) as Arc<dyn TaskExecutor>),
        )
    }

    fn scheduler() -> TaskScheduler {
        let store = Arc::new(InMemoryTaskStore::new());
        TaskScheduler::new(SchedulerConfig::default(), store).unwrap()
    }

    #[tokio::test]
    async fn operations_before_start_fail() {
        let scheduler = scheduler();
        let err = scheduler
            .schedule(TaskInstance::new("sample"))
            .await
            .expect_err("not started");
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn registration_after_start_fails() {
        let scheduler = scheduler();
        scheduler.start().unwrap();

        let err = scheduler
            .register_task_definition("late", noop_definition())
            .expect_err("sealed");
        assert!(matches!(err, Error::AlreadyStarted { .. }));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn middleware_after_start_fails() {
        struct Nop;
        #[async_trait]
        impl SchedulingMiddleware for Nop {
            async fn before_save(&self, instance: TaskInstance) -> Result<TaskInstance> {
                Ok(instance)
            }
        }

        let scheduler = scheduler();
        scheduler.start().unwrap();

        let err = scheduler
            .add_middleware(Arc::new(Nop))
            .expect_err("too late");
        assert!(matches!(err, Error::AlreadyStarted { .. }));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn double_start_fails() {
        let scheduler = scheduler();
        scheduler.start().unwrap();

        let err = scheduler.start().expect_err("double start");
        assert!(matches!(err, Error::AlreadyStarted { .. }));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn ensure_scheduled_is_idempotent() {
        let scheduler = scheduler();
        scheduler
            .register_task_definition("sample", noop_definition())
            .unwrap();
        scheduler.start().unwrap();

        let id = TaskId::new("stable-id");
        let first = scheduler
            .ensure_scheduled(
                TaskInstance::new("sample")
                    .with_id(id.clone())
                    .with_run_at(Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();
        let second = scheduler
            .ensure_scheduled(
                TaskInstance::new("sample")
                    .with_id(id.clone())
                    .with_run_at(Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        assert_eq!(first.id, id);
        assert_eq!(second.id, id);

        // Exactly one create side effect
        let page = scheduler.fetch(SearchOpts::default()).await.unwrap();
        assert_eq!(page.docs.len(), 1);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn disabled_scheduler_accepts_writes_but_not_run_now() {
        let config = SchedulerConfig {
            enabled: false,
            ..SchedulerConfig::default()
        };
        let store = Arc::new(InMemoryTaskStore::new());
        let scheduler = TaskScheduler::new(config, store).unwrap();
        scheduler
            .register_task_definition("sample", noop_definition())
            .unwrap();
        scheduler.start().unwrap();

        let doc = scheduler
            .schedule(TaskInstance::new("sample").with_run_at(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(scheduler.get(&doc.id).await.unwrap().id, doc.id);

        let err = scheduler.run_now(&doc.id).await.expect_err("disabled");
        assert!(matches!(err, Error::InvalidConfig { .. }));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn health_reports_error_before_any_cycle() {
        let scheduler = scheduler();
        let (status, stats) = scheduler.health();
        assert_eq!(status, HealthStatus::Error);
        assert!(stats.last_polled_at.is_none());
    }

    #[test]
    fn detach_error_preserves_variants() {
        let id = TaskId::new("t");
        let shared = Arc::new(Error::CurrentlyRunning {
            task_id: id.clone(),
        });
        assert!(matches!(
            detach_error(&shared),
            Error::CurrentlyRunning { .. }
        ));

        let shared = Arc::new(Error::NotInitialized);
        assert!(matches!(detach_error(&shared), Error::Storage { .. }));
    }

    #[tokio::test]
    async fn middleware_runs_before_save() {
        struct Stamp;
        #[async_trait]
        impl SchedulingMiddleware for Stamp {
            async fn before_save(&self, mut instance: TaskInstance) -> Result<TaskInstance> {
                instance.params = serde_json::json!({ "stamped": true });
                Ok(instance)
            }
        }

        let scheduler = scheduler();
        scheduler
            .register_task_definition("sample", noop_definition())
            .unwrap();
        scheduler.add_middleware(Arc::new(Stamp)).unwrap();
        scheduler.start().unwrap();

        let doc = scheduler
            .schedule(TaskInstance::new("sample").with_run_at(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(doc.params, serde_json::json!({ "stamped": true }));

        scheduler.stop().await;
    }
}

//! End-to-end scheduler tests against the in-memory store.
//!
//! Each test wires a full scheduler (poller, monitor, pool, managed
//! configuration) with a millisecond-scale poll interval and drives real
//! task lifecycles through it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;

use capstan_core::TaskId;
use capstan_scheduler::config::SchedulerConfig;
use capstan_scheduler::dictionary::{
    ExecutionContext, ExecutorOutcome, TaskDefinition, TaskExecutor,
};
use capstan_scheduler::document::{TaskInstance, TaskSchedule, TaskStatus};
use capstan_scheduler::error::{Error, Result};
use capstan_scheduler::events::TaskEventKind;
use capstan_scheduler::scheduler::TaskScheduler;
use capstan_scheduler::store::memory::InMemoryTaskStore;
use capstan_scheduler::store::{SearchOpts, TaskStore};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(max_workers: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_max_workers(max_workers)
}

/// Polls an async condition until it holds or the wait budget elapses.
async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Increments `state.count` and records each resulting state.
struct CountingExecutor {
    history: Arc<Mutex<Vec<JsonValue>>>,
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutorOutcome> {
        let count = ctx
            .task
            .state
            .get("count")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);
        let state = json!({ "count": count + 1 });
        self.history.lock().unwrap().push(state.clone());
        Ok(ExecutorOutcome::new(state))
    }
}

/// Always fails.
struct FailingExecutor;

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn run(&self, _ctx: ExecutionContext) -> Result<ExecutorOutcome> {
        Err(Error::executor_failed("expected failure"))
    }
}

/// Blocks while the gate is closed; completes immediately once it opens.
struct GatedExecutor {
    gate_open: Arc<AtomicBool>,
    gate: Arc<Notify>,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutorOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        while !self.gate_open.load(Ordering::SeqCst) {
            tokio::select! {
                () = self.gate.notified() => {}
                () = ctx.abort.cancelled() => {
                    return Err(Error::executor_failed("aborted"));
                }
            }
        }
        Ok(ExecutorOutcome::new(json!({ "completed": true })))
    }
}

struct Fixture {
    store: Arc<InMemoryTaskStore>,
    scheduler: TaskScheduler,
    history: Arc<Mutex<Vec<JsonValue>>>,
    gate_open: Arc<AtomicBool>,
    gate: Arc<Notify>,
    started: Arc<AtomicUsize>,
}

impl Fixture {
    fn new(config: SchedulerConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let scheduler = TaskScheduler::new(config, store.clone()).unwrap();

        let history: Arc<Mutex<Vec<JsonValue>>> = Arc::new(Mutex::new(Vec::new()));
        let gate_open = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        {
            let history = history.clone();
            scheduler
                .register_task_definition(
                    "sample",
                    TaskDefinition::new(
                        "sample",
                        Arc::new(move |_doc| {
                            Arc::new(CountingExecutor {
                                history: history.clone(),
                            }) as Arc<dyn TaskExecutor>
                        }),
                    ),
                )
                .unwrap();
        }
        scheduler
            .register_task_definition(
                "failing",
                TaskDefinition::new(
                    "failing",
                    Arc::new(|_doc| Arc::new(FailingExecutor) as Arc<dyn TaskExecutor>),
                ),
            )
            .unwrap();
        {
            let gate_open = gate_open.clone();
            let gate = gate.clone();
            let started = started.clone();
            scheduler
                .register_task_definition(
                    "gated",
                    TaskDefinition::new(
                        "gated",
                        Arc::new(move |_doc| {
                            Arc::new(GatedExecutor {
                                gate_open: gate_open.clone(),
                                gate: gate.clone(),
                                started: started.clone(),
                            }) as Arc<dyn TaskExecutor>
                        }),
                    ),
                )
                .unwrap();
        }

        Self {
            store,
            scheduler,
            history,
            gate_open,
            gate,
            started,
        }
    }

    fn started() -> Self {
        let fixture = Self::new(fast_config(10));
        fixture.scheduler.start().unwrap();
        fixture
    }

    fn open_gate(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    fn run_count(&self) -> usize {
        self.history.lock().unwrap().len()
    }
}

#[tokio::test]
async fn schedule_and_observe_one_execution() {
    let fixture = Fixture::started();

    let doc = fixture
        .scheduler
        .schedule(TaskInstance::new("sample").with_state(json!({})))
        .await
        .unwrap();
    let id = doc.id.clone();

    // The task runs once and, being non-recurring, is removed
    let gone = {
        let store = fixture.store.clone();
        let id = id.clone();
        eventually(move || {
            let store = store.clone();
            let id = id.clone();
            async move { store.get(&id).await.is_err() }
        })
        .await
    };
    assert!(gone, "task should be removed after a successful run");

    let history = fixture.history.lock().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], json!({ "count": 1 }));
    drop(history);

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn recurring_task_is_rescheduled_one_interval_out() {
    let fixture = Fixture::started();

    let scheduled_at = Utc::now();
    let doc = fixture
        .scheduler
        .schedule(
            TaskInstance::new("sample")
                .with_schedule(TaskSchedule::new(Duration::from_secs(1800))),
        )
        .await
        .unwrap();
    let id = doc.id.clone();

    let ran = {
        let store = fixture.store.clone();
        let id = id.clone();
        eventually(move || {
            let store = store.clone();
            let id = id.clone();
            async move {
                store
                    .get(&id)
                    .await
                    .is_ok_and(|doc| doc.state == json!({ "count": 1 }))
            }
        })
        .await
    };
    assert!(ran, "recurring task should run and keep its document");

    let after = fixture.store.get(&id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Idle);
    assert_eq!(after.attempts, 0);
    assert!(after.owner_id.is_none());

    // Next run_at is the pre-run eligibility plus one interval, within
    // test slack
    let expected = scheduled_at + chrono::Duration::minutes(30);
    let delta = (after.run_at - expected).num_seconds().abs();
    assert!(delta <= 10, "run_at drifted {delta}s from one interval out");

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn failed_task_retries_with_backoff() {
    let fixture = Fixture::started();

    let before = Utc::now();
    let doc = fixture
        .scheduler
        .schedule(TaskInstance::new("failing"))
        .await
        .unwrap();
    let id = doc.id.clone();

    let retried = {
        let store = fixture.store.clone();
        let id = id.clone();
        eventually(move || {
            let store = store.clone();
            let id = id.clone();
            async move {
                store
                    .get(&id)
                    .await
                    .is_ok_and(|doc| doc.attempts == 1 && doc.status == TaskStatus::Idle)
            }
        })
        .await
    };
    assert!(retried, "failed task should be rescheduled for retry");

    let after = fixture.store.get(&id).await.unwrap();
    // Backoff base is five minutes
    assert!(after.run_at >= before + chrono::Duration::minutes(5));

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn run_now_preempts_a_recurring_schedule() {
    let fixture = Fixture::started();

    let doc = fixture
        .scheduler
        .schedule(
            TaskInstance::new("sample")
                .with_schedule(TaskSchedule::new(Duration::from_secs(1800))),
        )
        .await
        .unwrap();
    let id = doc.id.clone();

    // Wait for the first scheduled run's outcome to be persisted
    let first_run = {
        let store = fixture.store.clone();
        let id = id.clone();
        eventually(move || {
            let store = store.clone();
            let id = id.clone();
            async move {
                store
                    .get(&id)
                    .await
                    .is_ok_and(|doc| doc.status == TaskStatus::Idle && doc.state == json!({ "count": 1 }))
            }
        })
        .await
    };
    assert!(first_run);
    // The next scheduled run is 30 minutes out; only run_now can preempt
    let reply = fixture.scheduler.run_now(&id).await.unwrap();
    assert_eq!(reply.id, id);
    assert_eq!(fixture.run_count(), 2);

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn run_now_on_a_running_task_fails_fast() {
    let fixture = Fixture::started();

    let doc = fixture
        .scheduler
        .schedule(
            TaskInstance::new("gated")
                .with_schedule(TaskSchedule::new(Duration::from_secs(1800))),
        )
        .await
        .unwrap();
    let id = doc.id.clone();

    // Wait until the executor is actually inside its run
    let started = {
        let started = fixture.started.clone();
        eventually(move || {
            let started = started.clone();
            async move { started.load(Ordering::SeqCst) >= 1 }
        })
        .await
    };
    assert!(started);

    let err = fixture
        .scheduler
        .run_now(&id)
        .await
        .expect_err("task is mid-run");
    assert!(
        matches!(err, Error::CurrentlyRunning { .. }),
        "expected CurrentlyRunning, got: {err}"
    );
    assert!(err.to_string().contains("currently running"));

    // Release the block; the first run completes and a second run_now
    // succeeds
    fixture.open_gate();
    let idle = {
        let store = fixture.store.clone();
        let id = id.clone();
        eventually(move || {
            let store = store.clone();
            let id = id.clone();
            async move {
                store
                    .get(&id)
                    .await
                    .is_ok_and(|doc| doc.status == TaskStatus::Idle)
            }
        })
        .await
    };
    assert!(idle);

    let reply = fixture.scheduler.run_now(&id).await.unwrap();
    assert_eq!(reply.id, id);

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn run_now_on_a_missing_task_fails_with_does_not_exist() {
    let fixture = Fixture::started();

    let err = fixture
        .scheduler
        .run_now(&TaskId::new("nonexistent"))
        .await
        .expect_err("task does not exist");
    assert!(
        matches!(err, Error::TaskNotFound { .. }),
        "expected TaskNotFound, got: {err}"
    );
    assert!(err.to_string().contains("does not exist"));

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn concurrent_ensure_scheduled_is_idempotent() {
    let fixture = Fixture::started();
    let id = TaskId::new("stable");

    let instance = || {
        TaskInstance::new("sample")
            .with_id(id.clone())
            .with_run_at(Utc::now() + chrono::Duration::hours(1))
    };

    let (first, second) = tokio::join!(
        fixture.scheduler.ensure_scheduled(instance()),
        fixture.scheduler.ensure_scheduled(instance()),
    );

    assert_eq!(first.unwrap().id, id);
    assert_eq!(second.unwrap().id, id);

    // Exactly one create side effect
    let page = fixture.scheduler.fetch(SearchOpts::default()).await.unwrap();
    assert_eq!(page.docs.len(), 1);

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn saturated_pool_claims_the_overflow_task_later() {
    let fixture = Fixture::new(fast_config(2));
    fixture.scheduler.start().unwrap();

    for i in 0..3 {
        fixture
            .scheduler
            .schedule(TaskInstance::new("gated").with_id(TaskId::new(format!("long-{i}"))))
            .await
            .unwrap();
    }

    // Two tasks start; the third stays idle in the store
    let two_started = {
        let started = fixture.started.clone();
        eventually(move || {
            let started = started.clone();
            async move { started.load(Ordering::SeqCst) == 2 }
        })
        .await
    };
    assert!(two_started, "exactly two tasks should occupy the pool");

    // Give the poller a few more cycles: the third must NOT be claimed
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.started.load(Ordering::SeqCst), 2);
    let unclaimed: Vec<_> = fixture
        .store
        .fetch(SearchOpts {
            status: Some(TaskStatus::Idle),
            ..SearchOpts::default()
        })
        .await
        .unwrap()
        .docs;
    assert_eq!(unclaimed.len(), 1);

    // Release everything: the third gets claimed in a subsequent cycle
    // and all three complete and are removed
    fixture.open_gate();
    let drained = {
        let store = fixture.store.clone();
        eventually(move || {
            let store = store.clone();
            async move { store.task_count().unwrap() == 0 }
        })
        .await
    };
    assert!(drained, "all three tasks should finish and be removed");
    assert_eq!(fixture.started.load(Ordering::SeqCst), 3);

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn events_for_one_task_arrive_in_lifecycle_order() {
    let fixture = Fixture::started();
    let mut events = fixture.scheduler.events();

    let doc = fixture
        .scheduler
        .schedule(TaskInstance::new("sample"))
        .await
        .unwrap();
    let id = doc.id.clone();

    let mut kinds = Vec::new();
    while kinds.len() < 3 {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("lifecycle events within budget")
            .unwrap();
        if event.task_id == id {
            kinds.push(event.kind);
        }
    }

    assert_eq!(
        kinds,
        vec![
            TaskEventKind::Claim,
            TaskEventKind::MarkRunning,
            TaskEventKind::Run
        ]
    );

    fixture.scheduler.stop().await;
}

#[tokio::test]
async fn managed_configuration_sheds_workers_on_store_overload() {
    let fixture = Fixture::started();

    // Sustained overload signal from the store
    for _ in 0..3 {
        fixture.store.inject_error("request timed out while claiming");
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    // Shedding load must not wedge the polling loop: cycles keep running
    // on the stretched interval.
    let polling = {
        let scheduler = &fixture.scheduler;
        eventually(move || {
            let (_, stats) = scheduler.health();
            async move { stats.last_polled_at.is_some() }
        })
        .await
    };
    assert!(polling);

    fixture.scheduler.stop().await;
}

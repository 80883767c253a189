//! Registry of task-type definitions.
//!
//! Each task type pairs a caller-supplied executor factory with execution
//! limits (timeout, retry ceiling). Registration is only permitted during
//! the setup phase; the dictionary is sealed when the scheduler starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::document::TaskDocument;
use crate::error::{Error, Result};

/// Default execution timeout for task types that do not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Context handed to an executor for one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Snapshot of the claimed document, including `params` and the
    /// `state` left by the previous successful run.
    pub task: TaskDocument,
    /// Fired when the run should stop: task timeout or scheduler shutdown.
    /// Executors that honor it terminate promptly; those that don't keep
    /// running until their lease expires and another instance reclaims.
    pub abort: CancellationToken,
}

/// Successful outcome of one executor run.
#[derive(Debug, Clone)]
pub struct ExecutorOutcome {
    /// New execution state, persisted over the previous one.
    pub state: JsonValue,
    /// Explicit next eligibility time. For recurring tasks this overrides
    /// the schedule interval for the next run only.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl ExecutorOutcome {
    /// Creates an outcome carrying the given state.
    #[must_use]
    pub const fn new(state: JsonValue) -> Self {
        Self {
            state,
            next_run_at: None,
        }
    }

    /// Sets an explicit next eligibility time.
    #[must_use]
    pub fn with_next_run_at(mut self, next_run_at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(next_run_at);
        self
    }
}

/// Caller-supplied work associated with a task type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Performs one run of the task.
    ///
    /// An `Err` counts as one failed attempt and triggers backoff
    /// rescheduling (or terminal failure once attempts are exhausted).
    async fn run(&self, ctx: ExecutionContext) -> Result<ExecutorOutcome>;
}

/// Factory producing an executor for one claimed document.
pub type ExecutorFactory = Arc<dyn Fn(&TaskDocument) -> Arc<dyn TaskExecutor> + Send + Sync>;

/// Definition of a task type.
#[derive(Clone)]
pub struct TaskDefinition {
    /// Human-readable title for diagnostics.
    pub title: String,
    /// Execution timeout; on elapse the abort signal fires and the run
    /// counts as a failed attempt.
    pub timeout: Duration,
    /// Per-type retry ceiling; falls back to the configured default.
    pub max_attempts: Option<u32>,
    factory: ExecutorFactory,
}

impl TaskDefinition {
    /// Creates a definition with the default timeout and retry ceiling.
    #[must_use]
    pub fn new(title: impl Into<String>, factory: ExecutorFactory) -> Self {
        Self {
            title: title.into(),
            timeout: DEFAULT_TIMEOUT,
            max_attempts: None,
            factory,
        }
    }

    /// Sets the execution timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-type retry ceiling.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Builds an executor for the given claimed document.
    #[must_use]
    pub fn create_executor(&self, task: &TaskDocument) -> Arc<dyn TaskExecutor> {
        (self.factory)(task)
    }

    /// Resolves the retry ceiling against the configured default.
    #[must_use]
    pub fn resolved_max_attempts(&self, default: u32) -> u32 {
        self.max_attempts.unwrap_or(default)
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("title", &self.title)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// In-memory mapping from task type name to its definition.
///
/// Registration happens during setup; `seal` is called at scheduler start,
/// after which further registration fails. Lookups of unknown types at
/// claim time cause the runner to fail the task terminally.
#[derive(Debug, Default)]
pub struct TaskTypeDictionary {
    definitions: RwLock<HashMap<String, Arc<TaskDefinition>>>,
    sealed: AtomicBool,
}

impl TaskTypeDictionary {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task type.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` after the dictionary is sealed, and
    /// `InvalidConfig` on a duplicate type name.
    pub fn register(&self, task_type: impl Into<String>, definition: TaskDefinition) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::AlreadyStarted {
                message: "task definitions must be registered before start".to_string(),
            });
        }

        let task_type = task_type.into();
        let mut definitions = self
            .definitions
            .write()
            .map_err(|_| Error::storage("dictionary lock poisoned"))?;

        if definitions.contains_key(&task_type) {
            return Err(Error::InvalidConfig {
                message: format!("task type '{task_type}' is already registered"),
            });
        }

        definitions.insert(task_type, Arc::new(definition));
        Ok(())
    }

    /// Looks up a definition by type name.
    #[must_use]
    pub fn get(&self, task_type: &str) -> Option<Arc<TaskDefinition>> {
        self.definitions
            .read()
            .ok()
            .and_then(|definitions| definitions.get(task_type).cloned())
    }

    /// Returns the registered type names.
    #[must_use]
    pub fn task_types(&self) -> Vec<String> {
        self.definitions
            .read()
            .map(|definitions| definitions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Seals the dictionary; called when the scheduler starts.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Returns true once the dictionary is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TaskInstance;

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
            Arc::new(|_task| Arc::new(NoOpExecutor) as Arc<dyn TaskExecutor>),
        )
    }

    #[test]
    fn register_and_lookup() {
        let dictionary = TaskTypeDictionary::new();
        dictionary.register("sample", noop_definition()).unwrap();

        let definition = dictionary.get("sample").expect("definition registered");
        assert_eq!(definition.title, "no-op");
        assert_eq!(definition.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn unknown_type_returns_none() {
        let dictionary = TaskTypeDictionary::new();
        assert!(dictionary.get("missing").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let dictionary = TaskTypeDictionary::new();
        dictionary.register("sample", noop_definition()).unwrap();

        let err = dictionary
            .register("sample", noop_definition())
            .expect_err("duplicate must fail");
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn registration_after_seal_fails() {
        let dictionary = TaskTypeDictionary::new();
        dictionary.seal();

        let err = dictionary
            .register("late", noop_definition())
            .expect_err("sealed dictionary must reject registration");
        assert!(matches!(err, Error::AlreadyStarted { .. }));
    }

    #[test]
    fn max_attempts_falls_back_to_default() {
        let unset = noop_definition();
        assert_eq!(unset.resolved_max_attempts(3), 3);

        let set = noop_definition().with_max_attempts(7);
        assert_eq!(set.resolved_max_attempts(3), 7);
    }

    #[tokio::test]
    async fn factory_builds_runnable_executor() {
        let definition = noop_definition().with_timeout(Duration::from_secs(1));
        let doc = TaskInstance::new("sample").into_document_at(Utc::now());

        let executor = definition.create_executor(&doc);
        let outcome = executor
            .run(ExecutionContext {
                task: doc,
                abort: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert!(outcome.next_run_at.is_none());
    }
}

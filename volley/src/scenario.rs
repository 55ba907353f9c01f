use std::{fmt, future::Future, marker::PhantomData, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::{sync::mpsc, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    abort::AbortSignal,
    aggregate::{IterationSummary, aggregator_task},
    context::{ContextSnapshot, Credential, SharedContext, Tenant, User},
    error::{Result, RunnerError},
    result::{AtomicAction, IterationError, ScenarioOutput},
    runner::{RunReport, Runner},
    sleep::{DEFAULT_GRANULARITY, SleepPlan},
};

/// What a scenario action returns.
pub type ScenarioResult = std::result::Result<(), ScenarioError>;

/// A failed scenario iteration: `(type, message, traceback)`.
///
/// Any `std::error::Error` converts into it with `?`; the type name becomes
/// `kind` and the chain of `source()`s becomes the traceback.
#[derive(Clone, PartialEq, Eq)]
pub struct ScenarioError {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl ScenarioError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }
}

impl<E> From<E> for ScenarioError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let mut traceback = String::new();
        let mut source = err.source();
        while let Some(cause) = source {
            traceback.push_str("caused by: ");
            traceback.push_str(&cause.to_string());
            traceback.push('\n');
            source = cause.source();
        }
        Self {
            kind: short_type_name::<E>().to_owned(),
            message: err.to_string(),
            traceback,
        }
    }
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.traceback.is_empty() {
            write!(f, "\n{}", self.traceback)?;
        }
        Ok(())
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// A named load pattern: one async `action` run once per iteration.
///
/// `action` receives an [`IterationContext`] for the iteration and reports
/// failure by returning an error. Keep heavy setup (clients, pools) outside
/// the action and clone handles into it.
#[derive(TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    /// Arguments from the task file, visible to every iteration.
    #[builder(default, setter(transform = |args: Map<String, Value>| Arc::new(args)))]
    pub args: Arc<Map<String, Value>>,
    #[builder(default, setter(skip))]
    future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Scenario<F, Fut>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    /// Run the scenario with `runner` and collect every result in memory.
    pub async fn run_with<R>(&self, runner: &R, context: Arc<SharedContext>) -> Result<RunReport>
    where
        R: Runner<F, Fut>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(aggregator_task::<IterationSummary>(rx, 256));

        let outcome = runner.run(self, context, tx).await;
        let collected = collector.await.map_err(RunnerError::Join)?;
        Ok(RunReport {
            outcome: outcome?,
            results: collected.results,
            summary: collected.aggregate,
        })
    }
}

#[derive(Debug, Default)]
pub(crate) struct Record {
    pub atomic_actions: Vec<AtomicAction>,
    pub idle: Duration,
    pub output: ScenarioOutput,
}

/// Handed to the scenario action for a single iteration.
///
/// Cheap to clone; clones record into the same iteration.
#[derive(Debug, Clone)]
pub struct IterationContext {
    snapshot: Arc<ContextSnapshot>,
    args: Arc<Map<String, Value>>,
    abort: AbortSignal,
    record: Arc<Mutex<Record>>,
}

impl IterationContext {
    pub(crate) fn new(
        snapshot: ContextSnapshot,
        args: Arc<Map<String, Value>>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            args,
            abort,
            record: Arc::default(),
        }
    }

    pub(crate) fn take_record(&self) -> Record {
        std::mem::take(&mut *self.record.lock())
    }

    pub fn index(&self) -> u64 {
        self.snapshot.index()
    }

    pub fn iteration(&self) -> u64 {
        self.snapshot.iteration()
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn user(&self) -> Option<&User> {
        self.snapshot.user()
    }

    pub fn tenant(&self) -> Option<&Tenant> {
        self.snapshot.tenant()
    }

    pub fn admin(&self) -> Option<&Credential> {
        self.snapshot.admin()
    }

    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ScenarioError> {
        let value = self.args.get(key).ok_or_else(|| {
            ScenarioError::new("MissingArgument", format!("scenario argument '{key}' is missing"))
        })?;
        Ok(T::deserialize(value)?)
    }

    /// True once the run was hard-aborted. Long scenarios and retry loops
    /// should check this and give up early.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_hard()
    }

    /// Time `action` and record it as the named atomic action.
    pub async fn atomic<T, A>(&self, name: impl Into<String>, action: A) -> T
    where
        A: Future<Output = T>,
    {
        let name = name.into();
        let start = Instant::now();
        let out = action.await;
        let duration = start.elapsed().as_secs_f64();
        self.record
            .lock()
            .atomic_actions
            .push(AtomicAction { name, duration });
        out
    }

    /// Sleep a uniformly random time in `[min_sleep, max_sleep)` seconds and
    /// count it as idle time.
    pub async fn sleep_between(
        &self,
        min_sleep: f64,
        max_sleep: f64,
    ) -> std::result::Result<(), ScenarioError> {
        if !(0.0 <= min_sleep && min_sleep <= max_sleep) || !max_sleep.is_finite() {
            return Err(RunnerError::InvalidArgument(format!(
                "0 <= min_sleep <= max_sleep, got [{min_sleep}, {max_sleep}]"
            ))
            .into());
        }
        let secs = if min_sleep < max_sleep {
            rand::thread_rng().gen_range(min_sleep..max_sleep)
        } else {
            min_sleep
        };
        let plan = SleepPlan::new(secs, DEFAULT_GRANULARITY)?;

        let start = Instant::now();
        let finished = plan.sleep_unless(|| self.abort.is_hard()).await;
        self.record.lock().idle += start.elapsed();

        if finished {
            Ok(())
        } else {
            Err(ScenarioError::new(
                IterationError::ABORTED,
                "sleep interrupted by hard abort",
            ))
        }
    }

    /// Attach a value to this iteration's scenario output.
    pub fn add_output(&self, key: impl Into<String>, value: Value) {
        self.record.lock().output.data.insert(key.into(), value);
    }

    /// Append a line to this iteration's scenario output errors.
    pub fn add_output_error(&self, message: &str) {
        let errors = &mut self.record.lock().output.errors;
        if !errors.is_empty() {
            errors.push('\n');
        }
        errors.push_str(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;

    fn context_with_args(args: Map<String, Value>) -> IterationContext {
        let shared = Arc::new(SharedContext::default());
        IterationContext::new(
            ContextSnapshot::new(&shared, 2),
            Arc::new(args),
            AbortSignal::new(),
        )
    }

    #[derive(Debug)]
    struct Outer(io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boot failed")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn error_conversion_keeps_type_message_and_chain() {
        let err = ScenarioError::from(Outer(io::Error::other("quota exceeded")));
        assert_eq!(err.kind, "Outer");
        assert_eq!(err.message, "boot failed");
        assert_eq!(err.traceback, "caused by: quota exceeded\n");
    }

    #[test]
    fn question_mark_converts_std_errors() {
        fn parse(input: &str) -> std::result::Result<u32, ScenarioError> {
            Ok(input.parse::<u32>()?)
        }
        let err = parse("nope").unwrap_err();
        assert_eq!(err.kind, "ParseIntError");
    }

    #[test]
    fn reads_typed_arguments() {
        let mut args = Map::new();
        args.insert("flavor".into(), json!("m1.small"));
        args.insert("count".into(), json!(3));
        let ctx = context_with_args(args);

        assert_eq!(ctx.arg::<String>("flavor").unwrap(), "m1.small");
        assert_eq!(ctx.arg::<u32>("count").unwrap(), 3);
        assert_eq!(ctx.arg::<u32>("missing").unwrap_err().kind, "MissingArgument");
        assert_eq!(ctx.arg::<u32>("flavor").unwrap_err().kind, "Error");
    }

    #[tokio::test]
    async fn atomic_actions_are_recorded_in_order() {
        let ctx = context_with_args(Map::new());
        let value = ctx.atomic("nova.boot_server", async { 42 }).await;
        ctx.atomic("nova.delete_server", async {}).await;

        assert_eq!(value, 42);
        let names: Vec<_> = ctx
            .take_record()
            .atomic_actions
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["nova.boot_server", "nova.delete_server"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_between_counts_idle_time() {
        let ctx = context_with_args(Map::new());
        ctx.sleep_between(0.5, 0.5).await.unwrap();
        assert_eq!(ctx.take_record().idle, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn sleep_between_rejects_bad_bounds() {
        let ctx = context_with_args(Map::new());
        assert!(ctx.sleep_between(2.0, 1.0).await.is_err());
        assert!(ctx.sleep_between(-1.0, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn sleep_between_stops_on_hard_abort() {
        let shared = Arc::new(SharedContext::default());
        let abort = AbortSignal::new();
        let ctx = IterationContext::new(
            ContextSnapshot::new(&shared, 0),
            Arc::default(),
            abort.clone(),
        );
        abort.request(false);

        let err = ctx.sleep_between(5.0, 5.0).await.unwrap_err();
        assert_eq!(err.kind, IterationError::ABORTED);
        assert!(ctx.is_aborted());
    }

    #[test]
    fn output_is_collected() {
        let ctx = context_with_args(Map::new());
        ctx.add_output("servers", json!(2));
        ctx.add_output_error("first");
        ctx.add_output_error("second");

        let output = ctx.take_record().output;
        assert_eq!(output.data["servers"], json!(2));
        assert_eq!(output.errors, "first\nsecond");
    }

    #[test]
    fn exposes_snapshot_numbers() {
        let ctx = context_with_args(Map::new());
        assert_eq!(ctx.index(), 2);
        assert_eq!(ctx.iteration(), 3);
        assert!(ctx.user().is_none());
    }
}

//! Runners: strategies that decide how many iterations to run, how long, and
//! how concurrency is spread over workers.
//!
//! Two strategies are built in, selected by the `type` tag of their
//! configuration:
//!
//! - [`ConstantRunner`] (`"constant"`): a fixed number of iterations. The
//!   configured concurrency is split across up to one worker thread per CPU;
//!   each worker runs a [`pool::ConcurrencyPool`] of async units pulling
//!   indices from one shared counter.
//! - [`ConstantForDurationRunner`] (`"constant_for_duration"`): iterations
//!   back-to-back until a wall-clock duration has passed, from a single pool of
//!   `concurrency` slots.
//!
//! Results are streamed to the caller through a [`ResultSender`] as they
//! complete, in completion order. The return value of [`Runner::run`] tells
//! the caller whether the run completed or was aborted; errors are reserved for
//! runs that could not start or lost a worker to the OS.
pub mod constant;
pub mod duration;
pub mod pool;

pub use constant::{ConstantRunner, WorkerPlan};
pub use duration::ConstantForDurationRunner;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    abort::{AbortKind, AbortSignal},
    aggregate::IterationSummary,
    config::RunnerConfig,
    context::SharedContext,
    error::{Result, RunnerError},
    result::IterationResult,
    scenario::{IterationContext, Scenario, ScenarioResult},
};
use pool::PoolReport;

/// Where runners push finished iterations.
pub type ResultSender = mpsc::UnboundedSender<IterationResult>;

/// A load-generation strategy.
pub trait Runner<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    /// Run `scenario` against `context`, sending every iteration's result to
    /// `results`. Resolves once all workers have stopped.
    fn run(
        &self,
        scenario: &Scenario<F, Fut>,
        context: Arc<SharedContext>,
        results: ResultSender,
    ) -> impl Future<Output = Result<RunOutcome>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted(AbortKind),
}

/// Summary of how a run went, returned by [`Runner::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Iterations started.
    pub dispatched: u64,
    /// Results sent to the caller, synthesized ones included.
    pub reported: u64,
    /// Iterations that ran past their timeout.
    pub timed_out: u64,
    /// Iterations that were still running when a duration run ended, and
    /// were cancelled without a result.
    pub cancelled: u64,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub(crate) fn new(abort: &AbortSignal, report: PoolReport, elapsed: Duration) -> Self {
        let status = match abort.kind() {
            Some(kind) => RunStatus::Aborted(kind),
            None => RunStatus::Completed,
        };
        Self {
            status,
            dispatched: report.dispatched,
            reported: report.reported,
            timed_out: report.timed_out,
            cancelled: report.dispatched.saturating_sub(report.reported),
            elapsed,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted(_))
    }
}

/// Everything a run produced, collected in memory.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub results: Vec<IterationResult>,
    pub summary: IterationSummary,
}

/// Enforces one run per runner and closes the abort signal when the run ends.
///
/// If the run future is dropped before completing, workers are told to stop
/// with a hard abort.
pub(crate) struct RunGuard<'a> {
    abort: &'a AbortSignal,
    completed: bool,
}

impl<'a> RunGuard<'a> {
    pub(crate) fn begin(started: &AtomicBool, abort: &'a AbortSignal) -> Result<Self> {
        if started.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyRun);
        }
        Ok(Self {
            abort,
            completed: false,
        })
    }

    pub(crate) fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            self.abort.finish();
        } else {
            self.abort.request(false);
        }
    }
}

/// Runner picked by configuration tag.
#[derive(Debug)]
pub enum ScenarioRunner {
    Constant(ConstantRunner),
    ConstantForDuration(ConstantForDurationRunner),
}

impl ScenarioRunner {
    pub fn from_config(config: RunnerConfig) -> Result<Self> {
        Ok(match config {
            RunnerConfig::Constant(config) => Self::Constant(ConstantRunner::new(config)?),
            RunnerConfig::ConstantForDuration(config) => {
                Self::ConstantForDuration(ConstantForDurationRunner::new(config)?)
            }
        })
    }

    pub fn from_json(value: Value) -> Result<Self> {
        Self::from_config(RunnerConfig::from_json(value)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Constant(_) => ConstantRunner::NAME,
            Self::ConstantForDuration(_) => ConstantForDurationRunner::NAME,
        }
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        match self {
            Self::Constant(runner) => runner.abort_signal(),
            Self::ConstantForDuration(runner) => runner.abort_signal(),
        }
    }

    /// Stop the run. See [`AbortSignal::request`].
    pub fn abort(&self, soft: bool) -> bool {
        self.abort_signal().request(soft)
    }
}

impl<F, Fut> Runner<F, Fut> for ScenarioRunner
where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    async fn run(
        &self,
        scenario: &Scenario<F, Fut>,
        context: Arc<SharedContext>,
        results: ResultSender,
    ) -> Result<RunOutcome> {
        match self {
            Self::Constant(runner) => runner.run(scenario, context, results).await,
            Self::ConstantForDuration(runner) => runner.run(scenario, context, results).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_runner_by_type() {
        let runner = ScenarioRunner::from_json(json!({"type": "constant", "times": 3})).unwrap();
        assert_eq!(runner.name(), "constant");

        let runner = ScenarioRunner::from_json(json!({
            "type": "constant_for_duration",
            "duration": 1.5
        }))
        .unwrap();
        assert_eq!(runner.name(), "constant_for_duration");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = ScenarioRunner::from_json(json!({"type": "rps", "times": 3})).unwrap_err();
        assert!(matches!(err, RunnerError::MalformedConfiguration(_)));
    }

    #[test]
    fn abort_goes_to_the_runner_signal() {
        let runner = ScenarioRunner::from_json(json!({"type": "constant"})).unwrap();
        assert!(runner.abort(true));
        assert!(!runner.abort(true));
        assert_eq!(runner.abort_signal().kind(), Some(AbortKind::Soft));
    }

    #[test]
    fn guard_allows_a_single_run() {
        let started = AtomicBool::new(false);
        let abort = AbortSignal::new();
        RunGuard::begin(&started, &abort).unwrap().complete();
        assert!(matches!(
            RunGuard::begin(&started, &abort),
            Err(RunnerError::AlreadyRun)
        ));
        assert_eq!(abort.state(), crate::abort::AbortState::Finished);
    }

    #[test]
    fn dropped_guard_hard_aborts() {
        let started = AtomicBool::new(false);
        let abort = AbortSignal::new();
        drop(RunGuard::begin(&started, &abort).unwrap());
        assert!(abort.is_hard());
    }

    #[test]
    fn outcome_reflects_abort_kind() {
        let abort = AbortSignal::new();
        let report = PoolReport {
            dispatched: 4,
            reported: 3,
            timed_out: 0,
        };
        let outcome = RunOutcome::new(&abort, report, Duration::ZERO);
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.cancelled, 1);

        abort.request(true);
        let outcome = RunOutcome::new(&abort, report, Duration::ZERO);
        assert_eq!(outcome.status, RunStatus::Aborted(AbortKind::Soft));
        assert!(outcome.is_aborted());
    }
}

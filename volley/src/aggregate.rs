use std::fmt::Debug;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::result::IterationResult;

/// Folds [`IterationResult`]s into a compact, mergeable summary.
///
/// Keep only raw counters and sums here; ratios and means are derived on
/// demand so that merging stays exact. `merge` must be associative and
/// commutative, since partial aggregates can be combined in any order.
pub trait Aggregate
where
    Self: Send + Debug + Sized,
{
    fn new() -> Self;

    /// Incorporate a single result.
    fn consume(&mut self, result: &IterationResult);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);

    /// Calls [`Aggregate::consume`] for each result.
    fn aggregate(&mut self, results: &[IterationResult]) {
        results.iter().for_each(|r| self.consume(r));
    }
}

/// Counts and timing totals over a set of iterations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IterationSummary {
    pub count: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// Seconds, summed over all iterations.
    pub total_duration: f64,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    /// Seconds of [`crate::IterationContext::sleep_between`], summed.
    pub total_idle: f64,
}

impl IterationSummary {
    pub fn successes(&self) -> u64 {
        self.count - self.failures
    }

    /// Share of successful iterations, `None` when nothing ran.
    pub fn success_ratio(&self) -> Option<f64> {
        (self.count > 0).then(|| self.successes() as f64 / self.count as f64)
    }

    pub fn mean_duration(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_duration / self.count as f64)
    }
}

fn fold(a: Option<f64>, b: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, b) => a.or(b),
    }
}

impl Aggregate for IterationSummary {
    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, result: &IterationResult) {
        self.count += 1;
        if !result.is_success() {
            self.failures += 1;
        }
        if result.is_timeout() {
            self.timeouts += 1;
        }
        self.total_duration += result.duration;
        self.total_idle += result.idle_duration;
        self.min_duration = fold(self.min_duration, Some(result.duration), f64::min);
        self.max_duration = fold(self.max_duration, Some(result.duration), f64::max);
    }

    fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.total_duration += other.total_duration;
        self.total_idle += other.total_idle;
        self.min_duration = fold(self.min_duration, other.min_duration, f64::min);
        self.max_duration = fold(self.max_duration, other.max_duration, f64::max);
    }
}

/// What [`aggregator_task`] hands back once every sender is gone.
#[derive(Debug)]
pub struct Collected<A> {
    /// Results in the order they arrived.
    pub results: Vec<IterationResult>,
    pub aggregate: A,
}

/// Tokio task that drains a result channel in batches.
///
/// Waits for one result, then grabs whatever else is already queued (up to
/// `batch_size`) and folds the whole batch at once.
pub async fn aggregator_task<A: Aggregate>(
    mut rx: mpsc::UnboundedReceiver<IterationResult>,
    batch_size: usize,
) -> Collected<A> {
    let mut aggregate = A::new();
    let mut results = Vec::new();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(result) = rx.recv().await {
        batch.push(result);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(result) => batch.push(result),
                Err(_) => break,
            }
        }
        aggregate.aggregate(&batch);
        results.append(&mut batch);
    }

    Collected { results, aggregate }
}

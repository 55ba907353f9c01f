use std::{
    future::Future,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use futures::future::join_all;
use tokio::{sync::mpsc, time::Instant};

use super::{ResultSender, RunGuard, RunOutcome, Runner, pool::PoolReport};
use crate::{
    abort::AbortSignal,
    config::ConstantForDurationConfig,
    context::SharedContext,
    counter::IterationCounter,
    error::Result,
    invoker::ScenarioInvoker,
    result::{IterationResult, unix_now},
    scenario::{IterationContext, Scenario, ScenarioResult},
};

/// Stand-in for durations the clock cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Runs a scenario back-to-back on `concurrency` slots until `duration` has
/// passed.
///
/// Indices are unbounded; the run ends on the deadline, not on a count. When
/// the deadline passes, iterations still in flight are cancelled and produce
/// no result: they are counted in [`RunOutcome::cancelled`]. Every iteration
/// is bounded by `timeout`, past which it is cancelled and reported as a
/// `TimeoutError`.
#[derive(Debug)]
pub struct ConstantForDurationRunner {
    config: ConstantForDurationConfig,
    abort: AbortSignal,
    started: AtomicBool,
}

impl ConstantForDurationRunner {
    pub const NAME: &'static str = "constant_for_duration";

    pub fn new(config: ConstantForDurationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            abort: AbortSignal::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConstantForDurationConfig {
        &self.config
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn abort(&self, soft: bool) -> bool {
        self.abort.request(soft)
    }
}

struct SlotEvent {
    result: IterationResult,
    timed_out: bool,
}

impl<F, Fut> Runner<F, Fut> for ConstantForDurationRunner
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
        let guard = RunGuard::begin(&self.started, &self.abort)?;
        let duration = self.config.duration();
        let timeout = self.config.timeout();
        tracing::debug!(
            "Starting {}: duration {:?}, concurrency {}, timeout {:?}",
            scenario.name,
            duration,
            self.config.concurrency,
            timeout
        );

        let counter = IterationCounter::new();
        let invoker = Arc::new(ScenarioInvoker::new(scenario, context, self.abort.clone()));
        let (slot_tx, mut slot_rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let deadline = start
            .checked_add(duration)
            .unwrap_or_else(|| start + FAR_FUTURE);

        tracing::info!("Spawning {} slots...", self.config.concurrency);
        let slots: Vec<_> = (0..self.config.concurrency)
            .map(|id| {
                tokio::spawn(run_slot(
                    id,
                    Arc::clone(&invoker),
                    counter.clone(),
                    self.abort.clone(),
                    timeout,
                    slot_tx.clone(),
                ))
            })
            .collect();
        drop(slot_tx);

        tracing::info!("Running scenario: {}!", scenario.name);
        let mut report = PoolReport::default();
        let mut expired = false;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    expired = true;
                    break;
                }
                event = slot_rx.recv() => match event {
                    Some(event) => forward(event, &results, &mut report),
                    None => break,
                },
            }
        }

        if expired {
            tracing::debug!("Duration of {duration:?} elapsed, cancelling slots");
            for slot in &slots {
                slot.abort();
            }
        }
        for joined in join_all(slots).await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    tracing::error!("Slot task failed: {err}");
                }
            }
        }
        while let Ok(event) = slot_rx.try_recv() {
            forward(event, &results, &mut report);
        }

        report.dispatched = counter.current();
        let outcome = RunOutcome::new(&self.abort, report, start.elapsed());
        guard.complete();

        tracing::info!("Done running scenario: {}! {outcome:?}", scenario.name);
        Ok(outcome)
    }
}

fn forward(event: SlotEvent, results: &ResultSender, report: &mut PoolReport) {
    let index = event.result.index;
    if event.timed_out {
        report.timed_out += 1;
    }
    report.reported += 1;
    if results.send(event.result).is_err() {
        tracing::debug!("Result receiver is gone, dropping iteration {index}");
    }
}

/// One concurrency slot: run iterations one after another until the run is
/// aborted or the slot is cancelled.
async fn run_slot<F, Fut>(
    id: usize,
    invoker: Arc<ScenarioInvoker<F, Fut>>,
    counter: IterationCounter,
    abort: AbortSignal,
    timeout: Duration,
    events: mpsc::UnboundedSender<SlotEvent>,
) where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    tracing::debug!("Slot {id} started");
    while !abort.is_set() {
        let index = counter.next();
        let task = invoker.task(index);
        let timestamp = unix_now();
        let started = Instant::now();

        let event = tokio::select! {
            biased;
            _ = abort.hard_abort_requested() => SlotEvent {
                result: IterationResult::aborted(index, started.elapsed(), timestamp),
                timed_out: false,
            },
            outcome = tokio::time::timeout(timeout, invoker.invoke(task)) => match outcome {
                Ok(result) => SlotEvent { result, timed_out: false },
                Err(_) => {
                    tracing::warn!("Iteration {index} is timed out. Terminating.");
                    SlotEvent {
                        result: IterationResult::timed_out(index, timeout, timestamp),
                        timed_out: true,
                    }
                }
            },
        };
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::debug!("Slot {id} shutting down");
}

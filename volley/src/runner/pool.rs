//! Per-worker pool of execution units for the fixed-count runner.
//!
//! Each worker thread runs one [`ConcurrencyPool`]. The pool keeps up to
//! `concurrency` iteration tasks alive at once:
//!
//! 1. claim the next index from the shared counter; stop when it reaches
//!    `times` or an abort was requested,
//! 2. spawn a unit task that invokes the scenario and sends its result,
//! 3. once the pool is full, retire finished units (joining them), sleeping
//!    for [`POLL_INTERVAL`] whenever none has finished yet,
//! 4. when there is nothing left to dispatch, join every remaining unit,
//!    cancelling the rest as soon as a hard abort arrives.
//!
//! Units are always joined, on every exit path. A unit that never got to send
//! its own result (cancelled by the watchdog or a hard abort, or crashed) gets
//! a synthesized one at join time, so every dispatched index yields exactly one
//! result.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    task::{JoinError, JoinHandle},
    time::Instant,
};

use super::ResultSender;
use crate::{
    abort::AbortSignal,
    counter::IterationCounter,
    invoker::ScenarioInvoker,
    result::{IterationResult, unix_now},
    scenario::{IterationContext, ScenarioResult},
    watchdog::TimeoutWatchdog,
};

/// How long the pool waits before checking a full pool again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What one pool (or one whole run) did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub dispatched: u64,
    pub reported: u64,
    pub timed_out: u64,
}

impl PoolReport {
    pub fn merge(&mut self, other: Self) {
        self.dispatched += other.dispatched;
        self.reported += other.reported;
        self.timed_out += other.timed_out;
    }
}

struct Unit {
    index: u64,
    started: Instant,
    timestamp: f64,
    handle: JoinHandle<()>,
    /// Set by the watchdog right before it cancels the unit.
    timed_out: Arc<AtomicBool>,
}

enum Drain {
    Joined(Result<(), JoinError>),
    HardAbort,
}

pub struct ConcurrencyPool<F, Fut> {
    pub id: usize,
    pub concurrency: usize,
    pub times: u64,
    pub timeout: Option<Duration>,
    pub invoker: Arc<ScenarioInvoker<F, Fut>>,
    pub counter: IterationCounter,
    pub abort: AbortSignal,
    pub results: ResultSender,
}

impl<F, Fut> ConcurrencyPool<F, Fut>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    /// Drive the pool until the counter passes `times` or the run is aborted.
    /// Must be called inside a tokio runtime with timers enabled.
    pub async fn run(self) -> PoolReport {
        tracing::debug!(
            "Worker {} started: concurrency {}, times {}, timeout {:?}, scenario {}",
            self.id,
            self.concurrency,
            self.times,
            self.timeout,
            self.invoker.name()
        );
        let watchdog = self.timeout.map(|_| TimeoutWatchdog::spawn());
        let mut active: VecDeque<Unit> = VecDeque::with_capacity(self.concurrency);
        let mut report = PoolReport::default();

        while !self.abort.is_set() {
            let index = self.counter.next();
            if index >= self.times {
                break;
            }

            let unit = self.dispatch(index);
            if let (Some(watchdog), Some(timeout)) = (&watchdog, self.timeout) {
                // A deadline past the end of time is never enforced.
                if let Some(deadline) = unit.started.checked_add(timeout) {
                    watchdog.track(
                        index,
                        deadline,
                        unit.handle.abort_handle(),
                        Arc::clone(&unit.timed_out),
                    );
                }
            }
            active.push_back(unit);
            report.dispatched += 1;

            while active.len() >= self.concurrency && !self.abort.is_hard() {
                if self.retire_finished(&mut active, &mut report).await == 0 {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        self.drain(active, &mut report).await;

        if let Some(watchdog) = watchdog {
            let terminated = watchdog.stop().await;
            if terminated > 0 {
                tracing::debug!("Worker {}: watchdog terminated {terminated} units", self.id);
            }
        }
        tracing::debug!("Worker {} shutting down: {report:?}", self.id);
        report
    }

    fn dispatch(&self, index: u64) -> Unit {
        let task = self.invoker.task(index);
        let invoker = Arc::clone(&self.invoker);
        let results = self.results.clone();
        let timestamp = unix_now();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let result = invoker.invoke(task).await;
            if results.send(result).is_err() {
                tracing::debug!("Result receiver is gone, dropping iteration {index}");
            }
        });
        Unit {
            index,
            started,
            timestamp,
            handle,
            timed_out: Arc::default(),
        }
    }

    async fn retire_finished(&self, active: &mut VecDeque<Unit>, report: &mut PoolReport) -> usize {
        let mut retired = 0;
        let mut i = 0;
        while i < active.len() {
            if !active[i].handle.is_finished() {
                i += 1;
                continue;
            }
            if let Some(mut unit) = active.remove(i) {
                let joined = (&mut unit.handle).await;
                self.settle(&unit, joined, report);
                retired += 1;
            }
        }
        retired
    }

    /// Join every remaining unit. A hard abort, whether already requested or
    /// arriving while we wait, cancels whatever is still running.
    async fn drain(&self, mut active: VecDeque<Unit>, report: &mut PoolReport) {
        while let Some(mut unit) = active.pop_front() {
            let next = if self.abort.is_hard() {
                Drain::HardAbort
            } else {
                tokio::select! {
                    biased;
                    joined = &mut unit.handle => Drain::Joined(joined),
                    _ = self.abort.hard_abort_requested() => Drain::HardAbort,
                }
            };
            let joined = match next {
                Drain::Joined(joined) => joined,
                Drain::HardAbort => {
                    unit.handle.abort();
                    for rest in &active {
                        rest.handle.abort();
                    }
                    (&mut unit.handle).await
                }
            };
            self.settle(&unit, joined, report);
        }
    }

    /// Account for a joined unit, sending a stand-in result if the unit never
    /// got to send its own.
    fn settle(&self, unit: &Unit, joined: Result<(), JoinError>, report: &mut PoolReport) {
        let index = unit.index;
        let synthesized = match joined {
            Ok(()) => None,
            Err(err) if err.is_cancelled() && unit.timed_out.load(Ordering::Acquire) => {
                report.timed_out += 1;
                let timeout = self.timeout.unwrap_or_else(|| unit.started.elapsed());
                Some(IterationResult::timed_out(index, timeout, unit.timestamp))
            }
            Err(err) if err.is_cancelled() => Some(IterationResult::aborted(
                index,
                unit.started.elapsed(),
                unit.timestamp,
            )),
            Err(err) => {
                tracing::error!("Worker {}: iteration {index} task failed: {err}", self.id);
                Some(IterationResult::crashed(
                    index,
                    unit.started.elapsed(),
                    unit.timestamp,
                    err.to_string(),
                ))
            }
        };

        if let Some(result) = synthesized {
            if self.results.send(result).is_err() {
                tracing::debug!("Result receiver is gone, dropping iteration {index}");
            }
        }
        report.reported += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::SharedContext, scenario::Scenario};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn pool<F, Fut>(
        action: F,
        concurrency: usize,
        times: u64,
        timeout: Option<Duration>,
    ) -> (
        ConcurrencyPool<F, Fut>,
        mpsc::UnboundedReceiver<IterationResult>,
    )
    where
        F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ScenarioResult> + Send + 'static,
    {
        let abort = AbortSignal::new();
        let scenario = Scenario::builder().name("Pool.test").action(action).build();
        let invoker = ScenarioInvoker::new(&scenario, Arc::new(SharedContext::default()), abort.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = ConcurrencyPool {
            id: 0,
            concurrency,
            times,
            timeout,
            invoker: Arc::new(invoker),
            counter: IterationCounter::new(),
            abort,
            results: tx,
        };
        (pool, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<IterationResult>) -> Vec<IterationResult> {
        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        results
    }

    #[tokio::test]
    async fn runs_every_index_once() {
        let (pool, mut rx) = pool(
            |_ctx: IterationContext| async { ScenarioResult::Ok(()) },
            4,
            25,
            None,
        );
        let report = pool.run().await;

        let mut indices: Vec<_> = drain(&mut rx).into_iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..25).collect::<Vec<_>>());
        assert_eq!(report.dispatched, 25);
        assert_eq!(report.reported, 25);
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let action = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |_ctx: IterationContext| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    ScenarioResult::Ok(())
                }
            }
        };
        let (pool, mut rx) = pool(action, 3, 12, None);
        pool.run().await;

        assert_eq!(drain(&mut rx).len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn zero_times_does_nothing() {
        let (pool, mut rx) = pool(
            |_ctx: IterationContext| async { ScenarioResult::Ok(()) },
            2,
            0,
            None,
        );
        let report = pool.run().await;
        assert_eq!(report, PoolReport::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn overdue_units_get_a_timeout_result() {
        let action = |ctx: IterationContext| async move {
            if ctx.index() == 1 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            ScenarioResult::Ok(())
        };
        let (pool, mut rx) = pool(action, 2, 3, Some(Duration::from_millis(50)));
        let report = pool.run().await;

        let results = drain(&mut rx);
        assert_eq!(results.len(), 3);
        assert_eq!(report.timed_out, 1);
        let slow = results.iter().find(|r| r.index == 1).unwrap();
        assert!(slow.is_timeout());
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 2);
    }

    #[tokio::test]
    async fn hard_abort_cancels_in_flight_units() {
        let (pool, mut rx) = pool(
            |_ctx: IterationContext| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ScenarioResult::Ok(())
            },
            2,
            10,
            None,
        );
        let abort = pool.abort.clone();
        let running = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.request(false);

        let report = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("pool should stop promptly")
            .unwrap();
        let results = drain(&mut rx);
        assert_eq!(report.dispatched, 2);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.as_ref().unwrap().kind == "AbortedError"));
    }

    #[tokio::test]
    async fn hard_abort_while_draining_cancels_remaining_units() {
        // Fewer iterations than slots: the pool goes straight to draining.
        let (pool, mut rx) = pool(
            |_ctx: IterationContext| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ScenarioResult::Ok(())
            },
            4,
            2,
            None,
        );
        let abort = pool.abort.clone();
        let running = tokio::spawn(pool.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.request(false);

        let report = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("pool should stop promptly")
            .unwrap();
        let results = drain(&mut rx);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.reported, 2);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.as_ref().unwrap().kind == "AbortedError"));
    }

    #[tokio::test]
    async fn watchdog_cancellation_stays_a_timeout_after_a_hard_abort() {
        let (pool, mut rx) = pool(
            |_ctx: IterationContext| async { ScenarioResult::Ok(()) },
            1,
            1,
            Some(Duration::from_secs(1)),
        );
        let unit = Unit {
            index: 0,
            started: Instant::now(),
            timestamp: unix_now(),
            handle: tokio::spawn(tokio::time::sleep(Duration::from_secs(30))),
            timed_out: Arc::new(AtomicBool::new(true)),
        };
        unit.handle.abort();
        pool.abort.request(false);

        let mut report = PoolReport::default();
        pool.drain(VecDeque::from([unit]), &mut report).await;

        let results = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_timeout());
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.reported, 1);
    }
}

use std::{
    future::Future,
    sync::{Arc, atomic::AtomicBool},
    thread,
};

use tokio::time::Instant;
use tracing::Instrument;

use super::{
    ResultSender, RunGuard, RunOutcome, Runner,
    pool::{ConcurrencyPool, PoolReport},
};
use crate::{
    abort::AbortSignal,
    config::ConstantConfig,
    context::SharedContext,
    counter::IterationCounter,
    error::{Result, RunnerError},
    invoker::{ScenarioInvoker, panic_message},
    scenario::{IterationContext, Scenario, ScenarioResult},
};

/// How a fixed-count run spreads its concurrency over worker threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    /// CPUs the run may use: the available count, capped by `max_cpu_count`.
    pub max_cpu_used: usize,
    /// Concurrency share of each worker; one entry per worker.
    pub shares: Vec<usize>,
}

impl WorkerPlan {
    /// Start `min(cpus, times, concurrency)` workers and deal `concurrency`
    /// out as evenly as possible, the first `concurrency % workers` workers
    /// getting one extra unit.
    pub fn compute(
        times: u64,
        concurrency: usize,
        max_cpu_count: Option<usize>,
        available_cpus: usize,
    ) -> Self {
        let max_cpu_used = max_cpu_count
            .map_or(available_cpus, |cap| cap.min(available_cpus))
            .max(1);
        let times = usize::try_from(times).unwrap_or(usize::MAX);
        let workers = max_cpu_used.min(times).min(concurrency).max(1);

        let per_worker = concurrency / workers;
        let overhead = concurrency % workers;
        let shares = (0..workers)
            .map(|i| per_worker + usize::from(i < overhead))
            .collect();
        Self {
            max_cpu_used,
            shares,
        }
    }

    pub fn workers(&self) -> usize {
        self.shares.len()
    }
}

/// Runs a scenario a fixed number of times with constant concurrency.
///
/// Every worker is an OS thread with its own single-threaded tokio runtime,
/// so CPU-heavy scenarios spread over cores while I/O-bound ones multiplex
/// within a worker. All workers draw indices from one [`IterationCounter`],
/// so each index in `0..times` runs exactly once.
#[derive(Debug)]
pub struct ConstantRunner {
    config: ConstantConfig,
    abort: AbortSignal,
    started: AtomicBool,
}

impl ConstantRunner {
    pub const NAME: &'static str = "constant";

    pub fn new(config: ConstantConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            abort: AbortSignal::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConstantConfig {
        &self.config
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn abort(&self, soft: bool) -> bool {
        self.abort.request(soft)
    }
}

impl<F, Fut> Runner<F, Fut> for ConstantRunner
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
        let times = self.config.times;
        let timeout = self.config.timeout();
        let plan = WorkerPlan::compute(
            times,
            self.config.concurrency,
            self.config.max_cpu_count,
            num_cpus::get(),
        );
        tracing::debug!(
            "Starting {}: times {}, concurrency {}, timeout {:?}, max cpu used {}, workers {}, shares {:?}",
            scenario.name,
            times,
            self.config.concurrency,
            timeout,
            plan.max_cpu_used,
            plan.workers(),
            plan.shares
        );

        let counter = IterationCounter::new();
        let invoker = Arc::new(ScenarioInvoker::new(scenario, context, self.abort.clone()));
        let start = Instant::now();

        tracing::info!("Spawning {} workers...", plan.workers());
        let mut workers = Vec::with_capacity(plan.workers());
        for (id, &concurrency) in plan.shares.iter().enumerate() {
            let pool = ConcurrencyPool {
                id,
                concurrency,
                times,
                timeout,
                invoker: Arc::clone(&invoker),
                counter: counter.clone(),
                abort: self.abort.clone(),
                results: results.clone(),
            };
            match spawn_worker(pool) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    tracing::error!("Could not start worker {id}: {err}");
                    self.abort.request(false);
                    if let Err(join_err) = join_workers(workers).await {
                        tracing::error!("Could not wind down started workers: {join_err}");
                    }
                    return Err(err);
                }
            }
        }
        drop(results);

        tracing::info!("Running scenario: {}!", scenario.name);
        let report = join_workers(workers).await?;
        let outcome = RunOutcome::new(&self.abort, report, start.elapsed());
        guard.complete();

        tracing::info!("Done running scenario: {}! {outcome:?}", scenario.name);
        Ok(outcome)
    }
}

type Worker = thread::JoinHandle<Result<PoolReport>>;

fn spawn_worker<F, Fut>(pool: ConcurrencyPool<F, Fut>) -> Result<Worker>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    let id = pool.id;
    thread::Builder::new()
        .name(format!("volley-worker-{id}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|source| RunnerError::ResourceExhausted {
                    what: "worker runtime",
                    source,
                })?;
            Ok(runtime.block_on(pool.run().instrument(tracing::info_span!("worker", id))))
        })
        .map_err(|source| RunnerError::ResourceExhausted {
            what: "worker thread",
            source,
        })
}

/// Wait for every worker thread without blocking the caller's runtime.
async fn join_workers(workers: Vec<Worker>) -> Result<PoolReport> {
    let joined = tokio::task::spawn_blocking(move || {
        workers
            .into_iter()
            .map(|worker| worker.join())
            .collect::<Vec<_>>()
    })
    .await?;

    let mut total = PoolReport::default();
    let mut failure = None;
    for (id, joined) in joined.into_iter().enumerate() {
        match joined {
            Ok(Ok(report)) => total.merge(report),
            Ok(Err(err)) => {
                tracing::error!("Worker {id} failed: {err}");
                failure.get_or_insert(err);
            }
            Err(panic) => {
                let err = RunnerError::WorkerPanicked {
                    id,
                    message: panic_message(&*panic),
                };
                tracing::error!("{err}");
                failure.get_or_insert(err);
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(total),
    }
}

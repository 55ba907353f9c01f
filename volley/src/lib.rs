//! Volley: the scenario runner core of a cloud benchmarking engine.
//!
//! A task engine hands Volley a scenario (an async action representing one unit
//! of load, e.g. "boot a server, then delete it"), a runner configuration and a
//! pre-built [`SharedContext`] of users and tenants. Volley runs the scenario
//! over and over with the requested concurrency, bounds every iteration by a
//! timeout and streams one [`IterationResult`] per iteration back to the
//! caller, which evaluates SLAs and persists them.
//!
//! # Architecture
//!
//! - [`Scenario`]: a named async action plus its arguments.
//! - [`Runner`]: the load strategy. [`ConstantRunner`] runs a fixed number of
//!   iterations spread over one worker thread per CPU;
//!   [`ConstantForDurationRunner`] runs iterations back-to-back until a
//!   deadline. [`ScenarioRunner`] picks one from a JSON [`RunnerConfig`].
//! - [`ScenarioInvoker`]: runs a single iteration, times it and turns failures
//!   and panics into data.
//! - [`IterationCounter`], [`AbortSignal`] and [`TimeoutWatchdog`]: the shared
//!   state every worker sees.
//! - [`Aggregate`]: folds results into a summary while they stream in.
//!
//! Failed iterations never fail the run. [`RunnerError`] is reserved for runs
//! that cannot start (bad configuration, the OS refusing a thread) and the
//! returned [`RunOutcome`] tells a completed run from an aborted one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use volley::{IterationContext, Scenario, ScenarioResult, ScenarioRunner, SharedContext};
//!
//! #[tokio::main]
//! async fn main() -> volley::Result<()> {
//!     let runner = ScenarioRunner::from_json(json!({
//!         "type": "constant",
//!         "times": 100,
//!         "concurrency": 10,
//!         "timeout": 30
//!     }))?;
//!
//!     let scenario = Scenario::builder()
//!         .name("Dummy.dummy")
//!         .action(|ctx: IterationContext| async move {
//!             ctx.atomic("dummy.sleep", async {
//!                 ctx.sleep_between(0.1, 0.5).await
//!             })
//!             .await?;
//!             ScenarioResult::Ok(())
//!         })
//!         .build();
//!
//!     let report = scenario
//!         .run_with(&runner, Arc::new(SharedContext::default()))
//!         .await?;
//!     println!("{:?}", report.summary);
//!     Ok(())
//! }
//! ```

pub mod abort;
/// Result collection and summaries
pub mod aggregate;
pub mod config;
/// Per-run shared state and per-iteration snapshots of it
pub mod context;
pub mod counter;
pub mod error;
pub mod invoker;
pub mod result;
/// Load strategies
pub mod runner;
/// Scenario definition and the per-iteration context handed to it
pub mod scenario;
pub mod sleep;
pub mod watchdog;

pub use abort::{AbortKind, AbortSignal, AbortState};
pub use aggregate::{Aggregate, IterationSummary};
pub use config::{ConstantConfig, ConstantForDurationConfig, RunnerConfig};
pub use context::{ContextSnapshot, Credential, SharedContext, Tenant, User, UserChoice};
pub use counter::IterationCounter;
pub use error::{Result, RunnerError};
pub use invoker::{IterationTask, ScenarioInvoker};
pub use result::{AtomicAction, IterationError, IterationResult, ScenarioOutput};
pub use runner::{
    ConstantForDurationRunner, ConstantRunner, RunOutcome, RunReport, RunStatus, Runner,
    ScenarioRunner, WorkerPlan,
};
pub use scenario::{IterationContext, Scenario, ScenarioError, ScenarioResult};
pub use sleep::{SleepPlan, interruptible_sleep};
pub use watchdog::TimeoutWatchdog;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scenario::ScenarioError;

/// Why an iteration failed: `(type, message, traceback)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl IterationError {
    pub const TIMEOUT: &'static str = "TimeoutError";
    pub const ABORTED: &'static str = "AbortedError";
    pub const PANIC: &'static str = "Panic";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }
}

impl From<ScenarioError> for IterationError {
    fn from(err: ScenarioError) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
            traceback: err.traceback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicAction {
    pub name: String,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutput {
    pub data: Map<String, Value>,
    pub errors: String,
}

/// Everything recorded about one finished iteration.
///
/// Durations and the timestamp are in seconds so the record serializes the
/// same way the task engine stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub index: u64,
    pub duration: f64,
    pub idle_duration: f64,
    pub error: Option<IterationError>,
    pub atomic_actions: Vec<AtomicAction>,
    pub scenario_output: ScenarioOutput,
    /// Unix time the iteration started at.
    pub timestamp: f64,
}

impl IterationResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_timeout(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind == IterationError::TIMEOUT)
    }

    /// Result standing in for an iteration that ran past its deadline.
    pub fn timed_out(index: u64, timeout: Duration, timestamp: f64) -> Self {
        Self::synthesized(
            index,
            timeout.as_secs_f64(),
            timestamp,
            IterationError::new(
                IterationError::TIMEOUT,
                format!("Timeout of {} seconds exceeded", timeout.as_secs_f64()),
            ),
        )
    }

    /// Result standing in for an iteration cancelled by a hard abort.
    pub fn aborted(index: u64, duration: Duration, timestamp: f64) -> Self {
        Self::synthesized(
            index,
            duration.as_secs_f64(),
            timestamp,
            IterationError::new(
                IterationError::ABORTED,
                "Iteration cancelled by hard abort",
            ),
        )
    }

    /// Result standing in for an iteration whose task died without reporting.
    pub fn crashed(index: u64, duration: Duration, timestamp: f64, message: String) -> Self {
        Self::synthesized(
            index,
            duration.as_secs_f64(),
            timestamp,
            IterationError::new(IterationError::PANIC, message),
        )
    }

    fn synthesized(index: u64, duration: f64, timestamp: f64, error: IterationError) -> Self {
        Self {
            index,
            duration,
            idle_duration: 0.0,
            error: Some(error),
            atomic_actions: Vec::new(),
            scenario_output: ScenarioOutput::default(),
            timestamp,
        }
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

//! Runner configuration as the task engine passes it.
//!
//! ```json
//! {"type": "constant", "times": 100, "concurrency": 10, "timeout": 30}
//! {"type": "constant_for_duration", "duration": 60.0, "concurrency": 4}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::error::{Result, RunnerError};

/// Default per-iteration timeout of the fixed-duration runner, in seconds.
pub const DEFAULT_DURATION_TIMEOUT: f64 = 600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerConfig {
    Constant(ConstantConfig),
    ConstantForDuration(ConstantForDurationConfig),
}

impl RunnerConfig {
    /// Parse and validate.
    pub fn from_json(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Constant(config) => config.validate(),
            Self::ConstantForDuration(config) => config.validate(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Constant(_) => "constant",
            Self::ConstantForDuration(_) => "constant_for_duration",
        }
    }
}

fn default_one_u64() -> u64 {
    1
}

fn default_one() -> usize {
    1
}

fn default_duration_timeout() -> f64 {
    DEFAULT_DURATION_TIMEOUT
}

fn invalid(message: String) -> RunnerError {
    RunnerError::Configuration(message)
}

/// Reject second counts a [`Duration`] cannot hold.
fn representable(name: &str, secs: f64) -> Result<()> {
    Duration::try_from_secs_f64(secs)
        .map(drop)
        .map_err(|err| invalid(format!("{name} of {secs} seconds is out of range: {err}")))
}

/// Validated values always convert; anything else saturates.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Run `times` iterations, `concurrency` at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct ConstantConfig {
    #[serde(default = "default_one_u64")]
    #[builder(default = 1)]
    pub times: u64,
    #[serde(default = "default_one")]
    #[builder(default = 1)]
    pub concurrency: usize,
    /// Per-iteration timeout in seconds. Absent or `0` disables it.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub timeout: Option<f64>,
    /// Upper bound on worker threads; defaults to the CPU count.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub max_cpu_count: Option<usize>,
}

impl ConstantConfig {
    pub fn validate(&self) -> Result<()> {
        if self.times < 1 {
            return Err(invalid(format!("times must be >= 1, got {}", self.times)));
        }
        if self.concurrency < 1 {
            return Err(invalid(format!(
                "concurrency must be >= 1, got {}",
                self.concurrency
            )));
        }
        if let Some(timeout) = self.timeout {
            if !(timeout == 0.0 || (timeout.is_finite() && timeout >= 1.0)) {
                return Err(invalid(format!(
                    "timeout must be 0 or a number >= 1, got {timeout}"
                )));
            }
            representable("timeout", timeout)?;
        }
        if self.max_cpu_count == Some(0) {
            return Err(invalid("max_cpu_count must be >= 1, got 0".to_owned()));
        }
        Ok(())
    }

    /// The per-iteration deadline, `None` when timeouts are off.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| *secs > 0.0)
            .map(seconds)
    }
}

impl Default for ConstantConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Run iterations back-to-back for `duration` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(deny_unknown_fields)]
pub struct ConstantForDurationConfig {
    pub duration: f64,
    #[serde(default = "default_one")]
    #[builder(default = 1)]
    pub concurrency: usize,
    /// Per-iteration timeout in seconds.
    #[serde(default = "default_duration_timeout")]
    #[builder(default = DEFAULT_DURATION_TIMEOUT)]
    pub timeout: f64,
}

impl ConstantForDurationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(invalid(format!(
                "duration must be a number >= 0, got {}",
                self.duration
            )));
        }
        representable("duration", self.duration)?;
        if self.concurrency < 1 {
            return Err(invalid(format!(
                "concurrency must be >= 1, got {}",
                self.concurrency
            )));
        }
        if !self.timeout.is_finite() || self.timeout < 1.0 {
            return Err(invalid(format!(
                "timeout must be a number >= 1, got {}",
                self.timeout
            )));
        }
        representable("timeout", self.timeout)?;
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        seconds(self.duration)
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout)
    }
}

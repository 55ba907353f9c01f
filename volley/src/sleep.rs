//! Sleeping in small steps.
//!
//! A single long `sleep` gives nobody a chance to stop the sleeper until it
//! wakes up. Splitting the wait into `granularity`-sized steps means a hard
//! abort (or a cancelled task) is noticed within one step.

use std::time::Duration;

use crate::error::{Result, RunnerError};

/// Step size used when the caller doesn't pick one.
pub const DEFAULT_GRANULARITY: f64 = 0.1;

/// `steps` sleeps of `granularity` followed by one sleep of `remainder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub granularity: Duration,
    pub steps: u64,
    pub remainder: Duration,
}

impl SleepPlan {
    pub fn new(total_secs: f64, granularity_secs: f64) -> Result<Self> {
        if !granularity_secs.is_finite() || granularity_secs <= 0.0 {
            return Err(RunnerError::InvalidArgument(format!(
                "sleep granularity should be > 0, got {granularity_secs}"
            )));
        }
        if !total_secs.is_finite() || total_secs < 0.0 {
            return Err(RunnerError::InvalidArgument(format!(
                "sleep time should be >= 0, got {total_secs}"
            )));
        }

        let granularity = Duration::try_from_secs_f64(granularity_secs)
            .map_err(|e| RunnerError::InvalidArgument(format!("sleep granularity: {e}")))?;
        let total = Duration::try_from_secs_f64(total_secs)
            .map_err(|e| RunnerError::InvalidArgument(format!("sleep time: {e}")))?;
        if granularity.is_zero() {
            return Err(RunnerError::InvalidArgument(format!(
                "sleep granularity {granularity_secs} is below clock resolution"
            )));
        }

        let steps = total.as_nanos() / granularity.as_nanos();
        let remainder = total.as_nanos() % granularity.as_nanos();
        Ok(Self {
            granularity,
            steps: steps as u64,
            remainder: Duration::from_nanos(remainder as u64),
        })
    }

    pub fn total(&self) -> Duration {
        self.granularity.mul_f64(self.steps as f64) + self.remainder
    }

    /// Sleep according to the plan, checking `stop` before every step.
    ///
    /// Returns `false` if `stop` cut the sleep short.
    pub async fn sleep_unless<S>(&self, stop: S) -> bool
    where
        S: Fn() -> bool,
    {
        for _ in 0..self.steps {
            if stop() {
                return false;
            }
            tokio::time::sleep(self.granularity).await;
        }
        if !self.remainder.is_zero() {
            if stop() {
                return false;
            }
            tokio::time::sleep(self.remainder).await;
        }
        true
    }
}

/// Sleep `total_secs` seconds in steps of `granularity_secs`.
pub async fn interruptible_sleep(total_secs: f64, granularity_secs: f64) -> Result<()> {
    SleepPlan::new(total_secs, granularity_secs)?
        .sleep_unless(|| false)
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[test]
    fn splits_into_steps_and_remainder() {
        let plan = SleepPlan::new(2.35, 0.1).unwrap();
        assert_eq!(plan.steps, 23);
        assert_eq!(plan.granularity, Duration::from_millis(100));
        assert_eq!(plan.remainder, Duration::from_millis(50));
        assert_eq!(plan.total(), Duration::from_millis(2350));
    }

    #[test]
    fn exact_multiple_has_no_remainder() {
        let plan = SleepPlan::new(1.0, 0.25).unwrap();
        assert_eq!(plan.steps, 4);
        assert!(plan.remainder.is_zero());
    }

    #[test]
    fn zero_sleep_is_empty() {
        let plan = SleepPlan::new(0.0, 0.1).unwrap();
        assert_eq!(plan.steps, 0);
        assert!(plan.remainder.is_zero());
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(
            SleepPlan::new(1.0, 0.0),
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(matches!(
            SleepPlan::new(1.0, -0.1),
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(matches!(
            SleepPlan::new(-1.0, 0.1),
            Err(RunnerError::InvalidArgument(_))
        ));
        assert!(matches!(
            SleepPlan::new(f64::NAN, 0.1),
            Err(RunnerError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_the_whole_plan() {
        let start = Instant::now();
        interruptible_sleep(2.35, 0.1).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(2350));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_the_sleep_short() {
        let checks = AtomicUsize::new(0);
        let plan = SleepPlan::new(1.0, 0.1).unwrap();
        let start = Instant::now();
        let finished = plan
            .sleep_unless(|| checks.fetch_add(1, Ordering::SeqCst) >= 3)
            .await;

        assert!(!finished);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}

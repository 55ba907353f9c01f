use std::{any::Any, future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::{
    abort::AbortSignal,
    context::{ContextSnapshot, SharedContext},
    result::{IterationError, IterationResult, unix_now},
    scenario::{IterationContext, Scenario, ScenarioResult},
};

/// One iteration, ready to run. Consumed by [`ScenarioInvoker::invoke`].
#[derive(Debug)]
pub struct IterationTask {
    pub index: u64,
    pub scenario: Arc<str>,
    pub snapshot: ContextSnapshot,
    pub args: Arc<Map<String, Value>>,
}

/// Runs single iterations of one scenario against one shared context.
///
/// Shared by every execution unit of a run behind an `Arc`.
pub struct ScenarioInvoker<F, Fut> {
    name: Arc<str>,
    action: F,
    args: Arc<Map<String, Value>>,
    context: Arc<SharedContext>,
    abort: AbortSignal,
    future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> ScenarioInvoker<F, Fut>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send + 'static,
{
    pub fn new(scenario: &Scenario<F, Fut>, context: Arc<SharedContext>, abort: AbortSignal) -> Self {
        Self {
            name: Arc::from(scenario.name.as_str()),
            action: scenario.action.clone(),
            args: Arc::clone(&scenario.args),
            context,
            abort,
            future: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self, index: u64) -> IterationTask {
        IterationTask {
            index,
            scenario: Arc::clone(&self.name),
            snapshot: ContextSnapshot::new(&self.context, index),
            args: Arc::clone(&self.args),
        }
    }

    /// Run the scenario once. Never fails: errors and panics raised by the
    /// scenario end up in [`IterationResult::error`].
    pub async fn invoke(&self, task: IterationTask) -> IterationResult {
        let IterationTask {
            index,
            scenario,
            snapshot,
            args,
        } = task;
        tracing::debug!("{scenario} | ITER: {} START", index + 1);

        let ctx = IterationContext::new(snapshot, args, self.abort.clone());
        let timestamp = unix_now();
        let start = Instant::now();
        let outcome = AssertUnwindSafe((self.action)(ctx.clone()))
            .catch_unwind()
            .await;
        let duration = start.elapsed();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(IterationError::from(err)),
            Err(panic) => Some(IterationError::new(
                IterationError::PANIC,
                panic_message(panic.as_ref()),
            )),
        };
        match &error {
            None => tracing::debug!("{scenario} | ITER: {} END: OK", index + 1),
            Some(err) => tracing::debug!(
                "{scenario} | ITER: {} END: Error {}: {}",
                index + 1,
                err.kind,
                err.message
            ),
        }

        let record = ctx.take_record();
        IterationResult {
            index,
            duration: duration.as_secs_f64(),
            idle_duration: record.idle.as_secs_f64(),
            error,
            atomic_actions: record.atomic_actions,
            scenario_output: record.output,
            timestamp,
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::ScenarioError;
    use serde_json::json;
    use std::time::Duration;

    fn invoker<F, Fut>(action: F) -> ScenarioInvoker<F, Fut>
    where
        F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ScenarioResult> + Send + 'static,
    {
        let scenario = Scenario::builder().name("Dummy.dummy").action(action).build();
        ScenarioInvoker::new(&scenario, Arc::default(), AbortSignal::new())
    }

    #[tokio::test]
    async fn successful_iteration() {
        let invoker = invoker(|ctx: IterationContext| async move {
            ctx.atomic("dummy.action", tokio::time::sleep(Duration::from_millis(5)))
                .await;
            ctx.add_output("index", json!(ctx.index()));
            ScenarioResult::Ok(())
        });
        let result = invoker.invoke(invoker.task(4)).await;

        assert_eq!(result.index, 4);
        assert!(result.is_success());
        assert!(result.duration >= 0.005);
        assert_eq!(result.atomic_actions.len(), 1);
        assert_eq!(result.scenario_output.data["index"], json!(4));
        assert!(result.timestamp > 0.0);
    }

    #[tokio::test]
    async fn scenario_error_is_captured() {
        let invoker = invoker(|_ctx: IterationContext| async move {
            ScenarioResult::Err(ScenarioError::new("ValueError", "boom"))
        });
        let result = invoker.invoke(invoker.task(0)).await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, "ValueError");
        assert_eq!(error.message, "boom");
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let invoker = invoker(|ctx: IterationContext| async move {
            if ctx.index() == 1 {
                panic!("exploded on {}", ctx.index());
            }
            ScenarioResult::Ok(())
        });

        let ok = invoker.invoke(invoker.task(0)).await;
        let panicked = invoker.invoke(invoker.task(1)).await;

        assert!(ok.is_success());
        let error = panicked.error.unwrap();
        assert_eq!(error.kind, IterationError::PANIC);
        assert_eq!(error.message, "exploded on 1");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_comes_from_the_scenario() {
        let invoker = invoker(|ctx: IterationContext| async move {
            ctx.sleep_between(0.3, 0.3).await?;
            ScenarioResult::Ok(())
        });
        let result = invoker.invoke(invoker.task(0)).await;

        assert!(result.is_success());
        assert!((result.idle_duration - 0.3).abs() < 2e-3);
        assert!(result.duration >= result.idle_duration);
    }

    #[test]
    fn task_carries_snapshot_and_name() {
        let invoker = invoker(|_ctx: IterationContext| async { ScenarioResult::Ok(()) });
        let task = invoker.task(9);
        assert_eq!(task.index, 9);
        assert_eq!(task.snapshot.index(), 9);
        assert_eq!(&*task.scenario, "Dummy.dummy");
    }
}

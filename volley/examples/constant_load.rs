use std::{sync::Arc, time::Duration};

use serde_json::json;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use volley::{
    IterationContext, Scenario, ScenarioError, ScenarioResult, ScenarioRunner, SharedContext,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG=volley=debug to watch workers and iterations
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Stands in for a real cloud call: boot then delete a "server".
    let scenario = Scenario::builder()
        .name("Dummy.boot_and_delete")
        .action(|ctx: IterationContext| async move {
            ctx.atomic("nova.boot_server", tokio::time::sleep(Duration::from_millis(50)))
                .await;
            ctx.sleep_between(0.0, 0.1).await?;
            ctx.atomic("nova.delete_server", tokio::time::sleep(Duration::from_millis(20)))
                .await;
            if ctx.index() % 7 == 6 {
                return Err(ScenarioError::new("ServerDeleteFailed", "server still ACTIVE"));
            }
            ScenarioResult::Ok(())
        })
        .build();

    let configs = [
        json!({"type": "constant", "times": 40, "concurrency": 8, "timeout": 5}),
        json!({"type": "constant_for_duration", "duration": 2.0, "concurrency": 4}),
    ];
    for config in configs {
        let runner = ScenarioRunner::from_json(config)?;
        let report = scenario
            .run_with(&runner, Arc::new(SharedContext::default()))
            .await?;

        let summary = &report.summary;
        println!(
            "{:<22} {:>4} iterations, {:>3} failed, mean {:.3}s, took {:.2?}",
            runner.name(),
            summary.count,
            summary.failures,
            summary.mean_duration().unwrap_or_default(),
            report.outcome.elapsed
        );
    }
    Ok(())
}

// Poller
// Capacity-bounded workers that request stages and hand them to the runner

use crate::coordinator::models::Filter;
use crate::coordinator::Client;
use crate::error::ServiceError;
use crate::runner::Runner;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Delay before a worker polls again after a transport error
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Poller {
    client: Arc<dyn Client>,
    filter: Filter,
    runner: Arc<Runner>,
}

impl Poller {
    pub fn new(runner: Arc<Runner>, filter: Filter) -> Self {
        Self {
            client: runner.client().clone(),
            filter,
            runner,
        }
    }

    /// Run `capacity` workers until `ctx` is cancelled. Stages already
    /// running when it is cancelled are torn down before this returns.
    pub async fn poll(&self, ctx: &CancellationToken, capacity: usize) {
        let mut workers = JoinSet::new();
        for worker in 0..capacity.max(1) {
            let poller = self.clone();
            let ctx = ctx.clone();
            workers.spawn(async move { poller.work(&ctx, worker).await });
        }
        while workers.join_next().await.is_some() {}
        tracing::info!("poller stopped");
    }

    async fn work(&self, ctx: &CancellationToken, worker: usize) {
        tracing::debug!(worker, "worker started");
        while !ctx.is_cancelled() {
            if let Err(err) = self.poll_once(ctx).await {
                tracing::warn!(worker, error = %err, "cannot request stage");
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }

    async fn poll_once(&self, ctx: &CancellationToken) -> Result<(), ServiceError> {
        let stage = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            stage = self.client.request(&self.filter) => stage?,
        };
        let Some(stage) = stage else {
            return Ok(());
        };
        tracing::debug!(stage.id = stage.id, stage.name = %stage.name, "received stage");

        if let Err(errors) = self.runner.run(ctx, stage).await {
            tracing::warn!(error = %errors, "stage finished with errors");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, SequentialIds};
    use crate::coordinator::fake::FakeClient;
    use crate::coordinator::models::{Config, Context, Stage, Status};
    use crate::engine::fake::FakeEngine;

    const CONFIG: &str = "kind: pipeline\ntype: kubernetes\nname: default\nclone:\n  disable: true\nsteps:\n- name: build\n  image: alpine\n  commands: [echo hi]\n";

    #[tokio::test(start_paused = true)]
    async fn test_poll_runs_queued_stage() {
        let client = Arc::new(
            FakeClient::new()
                .with_stage(Stage {
                    id: 1,
                    name: "default".to_string(),
                    ..Default::default()
                })
                .with_context(Context {
                    config: Config {
                        data: CONFIG.to_string(),
                    },
                    ..Default::default()
                }),
        );
        let engine = Arc::new(FakeEngine::new());
        let compiler = Compiler::new().with_ids(Arc::new(SequentialIds::default()));
        let runner = Arc::new(Runner::new(client.clone(), compiler, engine.clone()));
        let poller = Poller::new(runner, Filter::default());
        let ctx = CancellationToken::new();

        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { poller.poll(&ctx, 2).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        ctx.cancel();
        task.await.unwrap();

        assert_eq!(engine.launched(), vec!["build"]);
        assert_eq!(client.stage_updates().last().unwrap().status, Status::Passing);
    }
}

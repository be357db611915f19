// Reporters
// Publish stage and step transitions to the coordinator or a local console

use crate::coordinator::models::Status;
use crate::coordinator::Client;
use crate::error::ServiceError;
use crate::execution::events::{elapsed, EventSender, ExecutionEvent, ProgressSender};
use crate::execution::state::StateInner;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Receives the stage state whenever it changes. Callers hold the state
/// lock for the duration of the call.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_stage(&self, state: &mut StateInner) -> Result<(), ServiceError>;

    async fn report_step(&self, state: &mut StateInner, name: &str) -> Result<(), ServiceError>;
}

/// Pushes updates to the coordinator and copies back assigned ids
pub struct RemoteReporter {
    client: Arc<dyn Client>,
}

impl RemoteReporter {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }
}

fn report_error(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::Report(err.to_string())
}

#[async_trait]
impl Reporter for RemoteReporter {
    async fn report_stage(&self, state: &mut StateInner) -> Result<(), ServiceError> {
        let mut stage = state.stage.clone();
        self.client.update(&mut stage).await.map_err(report_error)?;

        state.stage.version = stage.version;
        state.stage.updated = stage.updated;
        for updated in stage.steps {
            if let Some(step) = state.find_mut(&updated.name) {
                step.id = updated.id;
                step.step_id = updated.step_id;
                step.version = updated.version;
            }
        }
        Ok(())
    }

    async fn report_step(&self, state: &mut StateInner, name: &str) -> Result<(), ServiceError> {
        let Some(step) = state.find_mut(name) else {
            return Ok(());
        };
        let mut copy = step.clone();
        self.client.update_step(&mut copy).await.map_err(report_error)?;
        step.version = copy.version;
        Ok(())
    }
}

/// Turns transitions into progress events for the local console. Each
/// status is emitted at most once per step.
pub struct ProgressReporter {
    tx: ProgressSender,
    seen: Mutex<HashMap<String, Status>>,
}

impl ProgressReporter {
    pub fn new(tx: ProgressSender) -> Self {
        Self {
            tx,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `status` is new for `key`
    async fn changed(&self, key: &str, status: Status) -> bool {
        let mut seen = self.seen.lock().await;
        seen.insert(key.to_string(), status) != Some(status)
    }
}

#[async_trait]
impl Reporter for ProgressReporter {
    async fn report_stage(&self, state: &mut StateInner) -> Result<(), ServiceError> {
        let stage = &state.stage;
        // Step names cannot start with a colon, so this key never collides.
        if !self.changed(":stage", stage.status).await {
            return Ok(());
        }
        if stage.status == Status::Running {
            self.tx
                .send_event(ExecutionEvent::stage_started(&stage.name, stage.steps.len()));
        } else if stage.status.is_done() {
            for step in &stage.steps {
                if step.status == Status::Skipped && self.changed(&step.name, step.status).await {
                    self.tx.send_event(ExecutionEvent::step_skipped(&step.name, "skipped"));
                }
            }
            if !stage.error.is_empty() {
                self.tx
                    .send_event(ExecutionEvent::execution_error(&stage.error, None));
            }
            self.tx.send_event(ExecutionEvent::stage_completed(
                &stage.name,
                stage.status,
                elapsed(stage.started, stage.stopped),
            ));
        }
        Ok(())
    }

    async fn report_step(&self, state: &mut StateInner, name: &str) -> Result<(), ServiceError> {
        let Some(step) = state.find(name) else {
            return Ok(());
        };
        if !self.changed(&step.name, step.status).await {
            return Ok(());
        }
        let event = match step.status {
            Status::Running => ExecutionEvent::step_started(&step.name, step.number, &step.image),
            Status::Skipped => ExecutionEvent::step_skipped(&step.name, "run policy"),
            status if status.is_done() => {
                if !step.error.is_empty() {
                    self.tx.send_event(ExecutionEvent::execution_error(
                        &step.error,
                        Some(step.name.clone()),
                    ));
                }
                ExecutionEvent::step_completed(
                    &step.name,
                    status,
                    step.exit_code,
                    elapsed(step.started, step.stopped),
                )
            }
            _ => return Ok(()),
        };
        self.tx.send_event(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::fake::FakeClient;
    use crate::coordinator::models::{Stage, Step};
    use crate::execution::events::progress_channel;

    fn state() -> StateInner {
        StateInner {
            stage: Stage {
                id: 1,
                name: "default".to_string(),
                steps: vec![
                    Step {
                        name: "build".to_string(),
                        number: 1,
                        ..Default::default()
                    },
                    Step {
                        name: "test".to_string(),
                        number: 2,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_remote_reporter_copies_ids() {
        let client = Arc::new(FakeClient::new());
        let reporter = RemoteReporter::new(client.clone());
        let mut state = state();

        state.start_stage();
        reporter.report_stage(&mut state).await.unwrap();
        assert_eq!(state.stage.version, 1);
        assert_eq!(state.find("build").unwrap().id, 1);
        assert_eq!(state.find("test").unwrap().id, 2);

        state.start("build");
        reporter.report_step(&mut state, "build").await.unwrap();
        assert_eq!(state.find("build").unwrap().version, 1);

        let steps = client.step_updates();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, Status::Running);
        assert_eq!(steps[0].id, 1);
    }

    #[tokio::test]
    async fn test_progress_reporter_dedups() {
        let (tx, mut rx) = progress_channel();
        let reporter = ProgressReporter::new(tx);
        let mut state = state();

        state.start_stage();
        reporter.report_stage(&mut state).await.unwrap();
        reporter.report_stage(&mut state).await.unwrap();
        state.start("build");
        reporter.report_step(&mut state, "build").await.unwrap();
        reporter.report_step(&mut state, "build").await.unwrap();
        state.finish("build", 0);
        reporter.report_step(&mut state, "build").await.unwrap();
        state.finish_all();
        reporter.report_stage(&mut state).await.unwrap();
        drop(reporter);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], ExecutionEvent::StageStarted { total_steps: 2, .. }));
        assert!(matches!(events[1], ExecutionEvent::StepStarted { step_number: 1, .. }));
        assert!(matches!(
            events[2],
            ExecutionEvent::StepCompleted { status: Status::Passing, exit_code: 0, .. }
        ));
        assert!(matches!(&events[3], ExecutionEvent::StepSkipped { step_name, .. } if step_name == "test"));
        assert!(matches!(
            events[4],
            ExecutionEvent::StageCompleted { status: Status::Passing, .. }
        ));
    }
}

// Streamers
// Hand out a log writer per step, remote or local

use crate::coordinator::models::Step;
use crate::coordinator::{Client, LiveLog};
use crate::engine::LogWriter;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};

use async_trait::async_trait;
use std::sync::Arc;

/// Opens the output stream of a step
pub trait Streamer: Send + Sync {
    fn stream(&self, step: &Step) -> Box<dyn LogWriter>;
}

/// Streams to the coordinator's live log endpoint
pub struct RemoteStreamer {
    client: Arc<dyn Client>,
}

impl RemoteStreamer {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }
}

impl Streamer for RemoteStreamer {
    fn stream(&self, step: &Step) -> Box<dyn LogWriter> {
        Box::new(LiveLog::new(self.client.clone(), step.id))
    }
}

/// Emits step output as progress events
pub struct ProgressStreamer {
    tx: ProgressSender,
}

impl ProgressStreamer {
    pub fn new(tx: ProgressSender) -> Self {
        Self { tx }
    }
}

impl Streamer for ProgressStreamer {
    fn stream(&self, step: &Step) -> Box<dyn LogWriter> {
        Box::new(ProgressWriter {
            tx: self.tx.clone(),
            step_name: step.name.clone(),
        })
    }
}

struct ProgressWriter {
    tx: ProgressSender,
    step_name: String,
}

#[async_trait]
impl LogWriter for ProgressWriter {
    async fn write_line(&mut self, line: &str) {
        self.tx
            .send_event(ExecutionEvent::step_output(&self.step_name, line));
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;

    #[tokio::test]
    async fn test_progress_streamer() {
        let (tx, mut rx) = progress_channel();
        let streamer = ProgressStreamer::new(tx);
        let step = Step {
            name: "build".to_string(),
            ..Default::default()
        };

        let mut writer = streamer.stream(&step);
        writer.write_line("go build ./...").await;
        writer.close().await;

        match rx.recv().await.unwrap() {
            ExecutionEvent::StepOutput { step_name, output } => {
                assert_eq!(step_name, "build");
                assert_eq!(output, "go build ./...");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

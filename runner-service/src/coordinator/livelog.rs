// Live Log
// Streams step output to the coordinator in timed batches

use crate::coordinator::models::Line;
use crate::coordinator::Client;
use crate::engine::LogWriter;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between two batch uploads
pub const BATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Cap on the retained history of a single step
pub const HISTORY_LIMIT: usize = 5 * 1024 * 1024;

pub struct LiveLog {
    client: Arc<dyn Client>,
    step_id: i64,
    started: Instant,
    last_flush: Instant,
    pending: Vec<Line>,
    history: Vec<Line>,
    size: usize,
    truncated: bool,
}

impl LiveLog {
    pub fn new(client: Arc<dyn Client>, step_id: i64) -> Self {
        let now = Instant::now();
        Self {
            client,
            step_id,
            started: now,
            last_flush: now,
            pending: Vec::new(),
            history: Vec::new(),
            size: 0,
            truncated: false,
        }
    }

    async fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.pending);
        if let Err(err) = self.client.batch(self.step_id, &lines).await {
            tracing::debug!(step.id = self.step_id, error = %err, "cannot stream logs");
        }
    }
}

#[async_trait]
impl LogWriter for LiveLog {
    async fn write_line(&mut self, line: &str) {
        if self.size + line.len() > HISTORY_LIMIT {
            if !self.truncated {
                self.truncated = true;
                tracing::warn!(step.id = self.step_id, "log limit exceeded, truncating output");
            }
            return;
        }
        self.size += line.len();

        let entry = Line {
            number: self.history.len() as i64,
            message: line.to_string(),
            timestamp: self.started.elapsed().as_secs() as i64,
        };
        self.history.push(entry.clone());
        self.pending.push(entry);

        if self.last_flush.elapsed() >= BATCH_INTERVAL {
            self.flush().await;
        }
    }

    async fn close(&mut self) {
        self.flush().await;
        if let Err(err) = self.client.upload(self.step_id, &self.history).await {
            tracing::warn!(step.id = self.step_id, error = %err, "cannot upload logs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::fake::FakeClient;

    #[tokio::test(start_paused = true)]
    async fn test_batches_and_upload() {
        let client = Arc::new(FakeClient::new());
        let mut log = LiveLog::new(client.clone(), 7);

        log.write_line("one").await;
        log.write_line("two").await;
        assert!(client.batched(7).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        log.write_line("three").await;

        let batched = client.batched(7);
        assert_eq!(batched.len(), 3);
        assert_eq!(batched[2].number, 2);
        assert_eq!(batched[2].timestamp, 2);

        log.write_line("four").await;
        log.close().await;

        let uploaded = client.uploaded(7);
        let messages: Vec<_> = uploaded.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three", "four"]);
        assert_eq!(client.batched(7).len(), 4);
    }

    #[tokio::test]
    async fn test_history_limit() {
        let client = Arc::new(FakeClient::new());
        let mut log = LiveLog::new(client.clone(), 1);

        let big = "x".repeat(HISTORY_LIMIT - 1);
        log.write_line(&big).await;
        log.write_line("overflow").await;
        log.close().await;

        assert_eq!(client.uploaded(1).len(), 1);
    }
}

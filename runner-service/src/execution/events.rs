// Execution Events
// Progress reporting and event types for local stage execution

use crate::coordinator::models::Status;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a stage runs
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Stage execution started
    StageStarted {
        stage_name: String,
        total_steps: usize,
    },

    /// Stage execution completed
    StageCompleted {
        stage_name: String,
        status: Status,
        duration: Duration,
    },

    /// Step execution started
    StepStarted {
        step_name: String,
        step_number: i64,
        image: String,
    },

    /// One line of step output
    StepOutput { step_name: String, output: String },

    /// Step execution completed
    StepCompleted {
        step_name: String,
        status: Status,
        exit_code: i32,
        duration: Duration,
    },

    /// Step was skipped by its run policy or an early exit
    StepSkipped { step_name: String, reason: String },

    /// Execution error occurred
    Error {
        message: String,
        step_name: Option<String>,
    },
}

impl ExecutionEvent {
    /// Create a stage started event
    pub fn stage_started(name: impl Into<String>, total_steps: usize) -> Self {
        Self::StageStarted {
            stage_name: name.into(),
            total_steps,
        }
    }

    /// Create a stage completed event
    pub fn stage_completed(name: impl Into<String>, status: Status, duration: Duration) -> Self {
        Self::StageCompleted {
            stage_name: name.into(),
            status,
            duration,
        }
    }

    /// Create a step started event
    pub fn step_started(name: impl Into<String>, step_number: i64, image: impl Into<String>) -> Self {
        Self::StepStarted {
            step_name: name.into(),
            step_number,
            image: image.into(),
        }
    }

    /// Create a step output event
    pub fn step_output(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self::StepOutput {
            step_name: name.into(),
            output: output.into(),
        }
    }

    /// Create a step completed event
    pub fn step_completed(
        name: impl Into<String>,
        status: Status,
        exit_code: i32,
        duration: Duration,
    ) -> Self {
        Self::StepCompleted {
            step_name: name.into(),
            status,
            exit_code,
            duration,
        }
    }

    /// Create a step skipped event
    pub fn step_skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepSkipped {
            step_name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an execution error event
    pub fn execution_error(message: impl Into<String>, step_name: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            step_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

/// Seconds between two unix timestamps as a duration
pub(crate) fn elapsed(started: i64, stopped: i64) -> Duration {
    Duration::from_secs(stopped.saturating_sub(started).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::stage_started("default", 2));
        tx.send_event(ExecutionEvent::step_started("build", 1, "golang:1.22"));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::StageStarted { .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::StepStarted { .. }));
    }

    #[test]
    fn test_event_construction() {
        let event = ExecutionEvent::step_completed(
            "test",
            Status::Failing,
            2,
            Duration::from_secs(30),
        );

        if let ExecutionEvent::StepCompleted {
            step_name,
            status,
            exit_code,
            duration,
        } = event
        {
            assert_eq!(step_name, "test");
            assert_eq!(status, Status::Failing);
            assert_eq!(exit_code, 2);
            assert_eq!(duration, Duration::from_secs(30));
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_elapsed() {
        assert_eq!(elapsed(100, 130), Duration::from_secs(30));
        assert_eq!(elapsed(130, 100), Duration::ZERO);
    }
}

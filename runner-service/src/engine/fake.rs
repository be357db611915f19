// Fake Engine
// In-memory engine with scripted exit codes and delays for execer tests

use crate::engine::watcher::WatcherError;
use crate::engine::{Engine, LogWriter, StepOutcome};
use crate::error::ServiceError;
use crate::ir::{Spec, Step};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_DELAY: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct FakeEngine {
    exit_codes: HashMap<String, i32>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, String>,
    setup_error: Option<String>,
    launched: Mutex<Vec<String>>,
    envs: Mutex<HashMap<String, BTreeMap<String, String>>>,
    spans: Mutex<HashMap<String, (Instant, Instant)>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub destroyed: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(mut self, step: &str, code: i32) -> Self {
        self.exit_codes.insert(step.to_string(), code);
        self
    }

    pub fn with_delay(mut self, step: &str, delay: Duration) -> Self {
        self.delays.insert(step.to_string(), delay);
        self
    }

    /// Fail the step as the pod watcher would
    pub fn with_failure(mut self, step: &str, reason: &str) -> Self {
        self.failures.insert(step.to_string(), reason.to_string());
        self
    }

    pub fn with_setup_error(mut self, message: &str) -> Self {
        self.setup_error = Some(message.to_string());
        self
    }

    /// Step names in launch order
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    /// Start and stop time of a finished step
    pub fn span(&self, step: &str) -> Option<(Instant, Instant)> {
        self.spans.lock().unwrap().get(step).copied()
    }

    pub fn envs(&self, step: &str) -> BTreeMap<String, String> {
        self.envs.lock().unwrap().get(step).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn setup(&self, _ctx: &CancellationToken, _spec: &Spec) -> Result<(), ServiceError> {
        match &self.setup_error {
            Some(message) => Err(ServiceError::Setup(message.clone())),
            None => Ok(()),
        }
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        _spec: &Spec,
        step: &Step,
        output: &mut dyn LogWriter,
    ) -> Result<StepOutcome, ServiceError> {
        if ctx.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        self.launched.lock().unwrap().push(step.name.clone());
        self.envs
            .lock()
            .unwrap()
            .insert(step.name.clone(), step.envs.clone());

        let started = Instant::now();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        output.write_line(&format!("running {}", step.name)).await;
        if let Some(echo) = step.envs.get("ECHO") {
            output.write_line(echo).await;
        }

        let delay = self.delays.get(&step.name).copied().unwrap_or(DEFAULT_DELAY);
        let cancelled = tokio::select! {
            _ = ctx.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.spans
            .lock()
            .unwrap()
            .insert(step.name.clone(), (started, Instant::now()));
        if cancelled {
            return Err(ServiceError::Cancelled);
        }

        if let Some(reason) = self.failures.get(&step.name) {
            return Err(WatcherError::Failed {
                container: step.id.clone(),
                reason: reason.clone(),
            }
            .into());
        }
        Ok(StepOutcome::new(
            self.exit_codes.get(&step.name).copied().unwrap_or(0),
        ))
    }

    async fn destroy(&self, _spec: &Spec) -> Result<(), ServiceError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

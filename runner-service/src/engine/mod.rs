// Engine Module
// Capability trait over the container runtime plus the kubernetes implementation

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod kube_client;
pub mod kubernetes;
pub mod launcher;
pub mod pod;
pub mod watcher;

pub use client::{OrchestratorError, PodClient, PodEvent};
pub use kube_client::KubeClient;
pub use kubernetes::{EngineConfig, KubernetesEngine};
pub use launcher::{LaunchError, Launcher};
pub use watcher::{PodWatcher, WatcherError};

use crate::error::ServiceError;
use crate::ir::{Spec, Step};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Result of running one step to completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: i32,
}

impl StepOutcome {
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

/// Destination for step output
#[async_trait]
pub trait LogWriter: Send {
    async fn write_line(&mut self, line: &str);

    /// Flush anything buffered; called once when the step finishes
    async fn close(&mut self);
}

/// Runs the steps of a compiled spec
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create everything the stage needs before any step runs
    async fn setup(&self, ctx: &CancellationToken, spec: &Spec) -> Result<(), ServiceError>;

    /// Run one step, copying its output into `output`
    async fn run(
        &self,
        ctx: &CancellationToken,
        spec: &Spec,
        step: &Step,
        output: &mut dyn LogWriter,
    ) -> Result<StepOutcome, ServiceError>;

    /// Tear down everything `setup` created
    async fn destroy(&self, spec: &Spec) -> Result<(), ServiceError>;
}

// Launcher
// Coalesces per-step image swaps into debounced pod updates

use crate::engine::client::{OrchestratorError, PodClient};

use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Quiet period after the last request before a batch is flushed
pub const DEBOUNCE: Duration = Duration::from_millis(400);

const MAX_ATTEMPTS: u32 = 15;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_JITTER: f64 = 0.5;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("failed to update pod: {0}")]
    Update(OrchestratorError),

    #[error("container {0} not found in pod")]
    ContainerNotFound(String),

    #[error("launcher stopped")]
    Stopped,

    #[error("launch cancelled")]
    Cancelled,
}

/// Receives the outcome of one launch request
pub type LaunchResult = oneshot::Receiver<Result<(), LaunchError>>;

struct LaunchRequest {
    container: String,
    image: String,
    annotations: BTreeMap<String, String>,
    done: oneshot::Sender<Result<(), LaunchError>>,
}

/// Swaps container images of a single pod
#[derive(Clone)]
pub struct Launcher {
    tx: mpsc::UnboundedSender<LaunchRequest>,
}

struct Batcher {
    client: Arc<dyn PodClient>,
    namespace: String,
    pod: String,
    update_lock: Arc<Mutex<()>>,
}

impl Launcher {
    /// Start the batching loop; it runs until `stop` is cancelled
    pub fn start(
        client: Arc<dyn PodClient>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        update_lock: Arc<Mutex<()>>,
        stop: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let batcher = Batcher {
            client,
            namespace: namespace.into(),
            pod: pod.into(),
            update_lock,
        };
        tokio::spawn(batcher.run(rx, stop));
        Self { tx }
    }

    /// Request that `container` switch to `image`. The returned channel
    /// resolves once the batch holding this request has been written.
    pub fn launch(
        &self,
        container: &str,
        image: &str,
        annotations: BTreeMap<String, String>,
    ) -> LaunchResult {
        let (done, rx) = oneshot::channel();
        let request = LaunchRequest {
            container: container.to_string(),
            image: image.to_string(),
            annotations,
            done,
        };
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            let _ = request.done.send(Err(LaunchError::Stopped));
        }
        rx
    }
}

impl Batcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<LaunchRequest>, stop: CancellationToken) {
        let mut pending: Vec<LaunchRequest> = Vec::new();
        let mut deadline = Instant::now();

        loop {
            let has_pending = !pending.is_empty();
            let timer = sleep_until(deadline);
            tokio::pin!(timer);

            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    rx.close();
                    while let Ok(request) = rx.try_recv() {
                        pending.push(request);
                    }
                    for request in pending.drain(..) {
                        let _ = request.done.send(Err(LaunchError::Stopped));
                    }
                    break;
                }
                request = rx.recv() => match request {
                    Some(request) => {
                        pending.push(request);
                        deadline = Instant::now() + DEBOUNCE;
                    }
                    None => {
                        if has_pending {
                            self.flush(std::mem::take(&mut pending)).await;
                        }
                        break;
                    }
                },
                _ = &mut timer, if has_pending => {
                    self.flush(std::mem::take(&mut pending)).await;
                }
            }
        }

        tracing::debug!(pod = %self.pod, "launcher stopped");
    }

    async fn flush(&self, batch: Vec<LaunchRequest>) {
        let _guard = self.update_lock.lock().await;

        let mut attempt = 1;
        let result = loop {
            match self.apply(&batch).await {
                Err(OrchestratorError::Conflict(message)) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(pod = %self.pod, attempt, %message, "pod update conflict, retrying");
                    attempt += 1;
                    sleep(backoff()).await;
                }
                other => break other,
            }
        };

        match result {
            Ok(found) => {
                tracing::debug!(pod = %self.pod, containers = found.len(), "launched containers");
                for request in batch {
                    let outcome = if found.contains(&request.container) {
                        Ok(())
                    } else {
                        Err(LaunchError::ContainerNotFound(request.container.clone()))
                    };
                    let _ = request.done.send(outcome);
                }
            }
            Err(err) => {
                tracing::warn!(pod = %self.pod, error = %err, "failed to launch containers");
                for request in batch {
                    let _ = request.done.send(Err(LaunchError::Update(err.clone())));
                }
            }
        }
    }

    /// Read, modify and write the pod once; returns the containers found
    async fn apply(&self, batch: &[LaunchRequest]) -> Result<HashSet<String>, OrchestratorError> {
        let mut pod = self.client.get_pod(&self.namespace, &self.pod).await?;

        let mut found = HashSet::new();
        if let Some(spec) = pod.spec.as_mut() {
            for container in spec.containers.iter_mut() {
                // Last request for a container wins.
                if let Some(request) = batch.iter().rev().find(|r| r.container == container.name) {
                    container.image = Some(request.image.clone());
                    found.insert(container.name.clone());
                }
            }
        }
        if found.is_empty() {
            return Ok(found);
        }

        let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for request in batch.iter().filter(|r| found.contains(&r.container)) {
            annotations.extend(request.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        self.client.update_pod(&self.namespace, &pod).await?;
        Ok(found)
    }
}

fn backoff() -> Duration {
    let jitter = rand::thread_rng().gen::<f64>() * RETRY_JITTER;
    RETRY_BASE.mul_f64(1.0 + jitter)
}

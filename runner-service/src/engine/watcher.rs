// Pod Watcher
// Tracks container state for one pod and resolves state-change waiters

use crate::engine::client::{PodClient, PodEvent};
use crate::image;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Consecutive failures to open the watch stream before giving up
const MAX_WATCH_FAILURES: u32 = 5;

const WATCH_RETRY: Duration = Duration::from_secs(1);

/// Waiting reasons that never recover for a launched image
const FATAL_WAITING_REASONS: &[&str] = &["InvalidImageName", "ErrImageNeverPull"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("container {container} failed: {reason}")]
    Failed { container: String, reason: String },

    #[error("container {container} was restarted unexpectedly")]
    Aborted { container: String },

    #[error("container {container} interrupted by another container: {source}")]
    OtherContainer {
        container: String,
        source: Box<WatcherError>,
    },

    #[error("pod terminated")]
    PodTerminated,

    #[error("unknown container {0}")]
    UnknownContainer(String),

    #[error("pod watch failed: {0}")]
    Watch(String),

    #[error("wait cancelled")]
    Cancelled,
}

/// Container states, totally ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerState {
    #[default]
    Waiting,
    Running,
    Terminated,
}

/// Observed status of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub image: String,
    pub state: ContainerState,
    /// Waiting or termination reason
    pub state_info: String,
    pub exit_code: i32,
}

/// Extract container snapshots from a pod status
pub fn snapshot(pod: &Pod) -> Vec<ContainerSnapshot> {
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return Vec::new();
    };

    statuses
        .iter()
        .map(|status| {
            let mut out = ContainerSnapshot {
                id: status.name.clone(),
                image: status.image.clone(),
                state: ContainerState::Waiting,
                state_info: String::new(),
                exit_code: 0,
            };
            if let Some(state) = &status.state {
                if let Some(terminated) = &state.terminated {
                    out.state = ContainerState::Terminated;
                    out.exit_code = terminated.exit_code;
                    out.state_info = terminated
                        .reason
                        .clone()
                        .or_else(|| terminated.message.clone())
                        .unwrap_or_default();
                } else if state.running.is_some() {
                    out.state = ContainerState::Running;
                } else if let Some(waiting) = &state.waiting {
                    out.state_info = waiting.reason.clone().unwrap_or_default();
                }
            }
            out
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Start,
    Terminated,
}

struct Registration {
    id: String,
    placeholder: String,
}

struct Waiter {
    id: String,
    target: Target,
    tx: oneshot::Sender<Result<i32, WatcherError>>,
}

enum Update {
    Containers(Vec<ContainerSnapshot>),
    Deleted,
    Failed(WatcherError),
}

#[derive(Debug)]
struct ContainerEntry {
    placeholder: String,
    image: String,
    state: ContainerState,
    state_info: String,
    exit_code: i32,
    past_placeholder: bool,
    err: Option<WatcherError>,
}

/// Handle to the watcher tasks of one pod
#[derive(Clone)]
pub struct PodWatcher {
    pod: String,
    reg_tx: mpsc::UnboundedSender<Registration>,
    client_tx: mpsc::UnboundedSender<Waiter>,
    terminated: watch::Receiver<Option<Result<(), WatcherError>>>,
    stop: CancellationToken,
}

impl PodWatcher {
    /// Start the watch reader, the periodic snapshot and the event loop
    pub fn start(
        client: Arc<dyn PodClient>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        label_selector: impl Into<String>,
        period: Duration,
        stop: CancellationToken,
    ) -> Self {
        let namespace = namespace.into();
        let pod = pod.into();

        let (reg_tx, reg_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated) = watch::channel(None);

        tokio::spawn(watch_pod(
            client.clone(),
            namespace.clone(),
            label_selector.into(),
            status_tx.clone(),
            stop.clone(),
        ));
        tokio::spawn(poll_pod(
            client,
            namespace,
            pod.clone(),
            period,
            status_tx,
            stop.clone(),
        ));

        let event_loop = EventLoop {
            pod: pod.clone(),
            containers: HashMap::new(),
            latest: HashMap::new(),
            waiters: Vec::new(),
            terminated: None,
            terminated_tx,
        };
        tokio::spawn(event_loop.run(reg_rx, status_rx, client_rx, stop.clone()));

        Self {
            pod,
            reg_tx,
            client_tx,
            terminated,
            stop,
        }
    }

    /// Register a container before waiting on it; repeated calls are ignored
    pub fn add_container(&self, id: &str, placeholder: &str) {
        let _ = self.reg_tx.send(Registration {
            id: id.to_string(),
            placeholder: placeholder.to_string(),
        });
    }

    /// Resolves once the container runs its launched image
    pub async fn wait_start(&self, ctx: &CancellationToken, id: &str) -> Result<(), WatcherError> {
        self.wait(ctx, id, Target::Start).await.map(|_| ())
    }

    /// Resolves with the exit code once the launched container terminates
    pub async fn wait_terminated(&self, ctx: &CancellationToken, id: &str) -> Result<i32, WatcherError> {
        self.wait(ctx, id, Target::Terminated).await
    }

    async fn wait(&self, ctx: &CancellationToken, id: &str, target: Target) -> Result<i32, WatcherError> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            id: id.to_string(),
            target,
            tx,
        };
        if self.client_tx.send(waiter).is_err() {
            return Err(WatcherError::PodTerminated);
        }

        tokio::select! {
            _ = ctx.cancelled() => Err(WatcherError::Cancelled),
            result = rx => result.unwrap_or(Err(WatcherError::PodTerminated)),
        }
    }

    /// Resolves once the pod is gone
    pub async fn wait_pod_deleted(&self, ctx: &CancellationToken) -> Result<(), WatcherError> {
        let mut rx = self.terminated.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(WatcherError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WatcherError::PodTerminated);
                    }
                }
            }
        }
    }

    /// Stop every watcher task; remaining waiters see `PodTerminated`
    pub fn shutdown(&self) {
        tracing::debug!(pod = %self.pod, "stopping pod watcher");
        self.stop.cancel();
    }
}

async fn watch_pod(
    client: Arc<dyn PodClient>,
    namespace: String,
    selector: String,
    tx: mpsc::UnboundedSender<Update>,
    stop: CancellationToken,
) {
    let mut failures = 0;
    loop {
        let opened = tokio::select! {
            _ = stop.cancelled() => return,
            opened = client.watch_pods(&namespace, &selector) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => {
                failures = 0;
                stream
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(%selector, failures, error = %err, "failed to open pod watch");
                if failures >= MAX_WATCH_FAILURES {
                    let _ = tx.send(Update::Failed(WatcherError::Watch(err.to_string())));
                    return;
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sleep(WATCH_RETRY) => continue,
                }
            }
        };

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(PodEvent::Applied(pod))) => {
                    if tx.send(Update::Containers(snapshot(&pod))).is_err() {
                        return;
                    }
                }
                Some(Ok(PodEvent::Deleted(_))) => {
                    let _ = tx.send(Update::Deleted);
                    return;
                }
                Some(Err(err)) => {
                    tracing::debug!(%selector, error = %err, "pod watch interrupted");
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = sleep(WATCH_RETRY) => {}
                    }
                    break;
                }
                None => break,
            }
        }
    }
}

async fn poll_pod(
    client: Arc<dyn PodClient>,
    namespace: String,
    pod: String,
    period: Duration,
    tx: mpsc::UnboundedSender<Update>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match client.get_pod(&namespace, &pod).await {
            Ok(current) => {
                if tx.send(Update::Containers(snapshot(&current))).is_err() {
                    return;
                }
            }
            Err(err) if err.is_not_found() => {
                let _ = tx.send(Update::Deleted);
                return;
            }
            Err(err) => {
                tracing::warn!(%pod, error = %err, "failed to read pod");
            }
        }
    }
}

/// Owns the container map; all mutation happens here
struct EventLoop {
    pod: String,
    containers: HashMap<String, ContainerEntry>,
    /// Last status seen per container, applied on late registration
    latest: HashMap<String, ContainerSnapshot>,
    waiters: Vec<Waiter>,
    terminated: Option<WatcherError>,
    terminated_tx: watch::Sender<Option<Result<(), WatcherError>>>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut reg_rx: mpsc::UnboundedReceiver<Registration>,
        mut status_rx: mpsc::UnboundedReceiver<Update>,
        mut client_rx: mpsc::UnboundedReceiver<Waiter>,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,
                Some(registration) = reg_rx.recv() => self.register(registration),
                Some(update) = status_rx.recv() => self.update(update),
                Some(waiter) = client_rx.recv() => self.add_waiter(waiter),
                else => break,
            }
        }

        self.finish(WatcherError::PodTerminated, Err(WatcherError::PodTerminated));
        tracing::debug!(pod = %self.pod, "pod watcher stopped");
    }

    fn register(&mut self, registration: Registration) {
        if self.containers.contains_key(&registration.id) {
            return;
        }
        self.containers.insert(
            registration.id.clone(),
            ContainerEntry {
                image: registration.placeholder.clone(),
                placeholder: registration.placeholder,
                state: ContainerState::Waiting,
                state_info: String::new(),
                exit_code: 0,
                past_placeholder: false,
                err: None,
            },
        );
        if let Some(last) = self.latest.get(&registration.id).cloned() {
            self.process(last);
            self.resolve_waiters();
        }
    }

    fn update(&mut self, update: Update) {
        match update {
            Update::Containers(snapshots) => {
                if self.terminated.is_some() {
                    return;
                }
                for snapshot in snapshots {
                    self.latest.insert(snapshot.id.clone(), snapshot.clone());
                    self.process(snapshot);
                }
                self.resolve_waiters();
            }
            Update::Deleted => {
                tracing::debug!(pod = %self.pod, "pod deleted");
                self.finish(WatcherError::PodTerminated, Ok(()));
            }
            Update::Failed(err) => {
                tracing::error!(pod = %self.pod, error = %err, "pod watcher failed");
                self.finish(err.clone(), Err(err));
            }
        }
    }

    fn process(&mut self, snapshot: ContainerSnapshot) {
        let Some(entry) = self.containers.get_mut(&snapshot.id) else {
            return;
        };
        if entry.err.is_some() {
            return;
        }
        if entry.image == snapshot.image
            && entry.state == snapshot.state
            && entry.state_info == snapshot.state_info
        {
            return;
        }

        let on_placeholder = image::matches_tag(&snapshot.image, &entry.placeholder);
        let failure = if on_placeholder && entry.past_placeholder {
            Some(WatcherError::Aborted {
                container: snapshot.id.clone(),
            })
        } else if on_placeholder && snapshot.state == ContainerState::Terminated {
            Some(WatcherError::Failed {
                container: snapshot.id.clone(),
                reason: reason_or(&snapshot.state_info, "terminated before launch"),
            })
        } else if !on_placeholder
            && snapshot.state == ContainerState::Waiting
            && FATAL_WAITING_REASONS.contains(&snapshot.state_info.as_str())
        {
            Some(WatcherError::Failed {
                container: snapshot.id.clone(),
                reason: snapshot.state_info.clone(),
            })
        } else {
            None
        };

        if let Some(err) = failure {
            entry.err = Some(err.clone());
            tracing::warn!(pod = %self.pod, container = %snapshot.id, error = %err, "container failed");
            self.fail(&snapshot.id, err);
            return;
        }

        if !on_placeholder && !entry.past_placeholder {
            entry.past_placeholder = true;
            entry.state = snapshot.state;
        } else if snapshot.state > entry.state {
            entry.state = snapshot.state;
        }
        if snapshot.state == ContainerState::Terminated {
            entry.exit_code = snapshot.exit_code;
        }
        entry.image = snapshot.image;
        entry.state_info = snapshot.state_info;
    }

    /// Deliver a container failure: the owner's waiters get it as-is,
    /// everyone else gets it wrapped, and the waiter list is cleared
    fn fail(&mut self, id: &str, err: WatcherError) {
        for waiter in self.waiters.drain(..) {
            let delivered = if waiter.id == id {
                err.clone()
            } else {
                WatcherError::OtherContainer {
                    container: waiter.id.clone(),
                    source: Box::new(err.clone()),
                }
            };
            let _ = waiter.tx.send(Err(delivered));
        }
    }

    fn add_waiter(&mut self, waiter: Waiter) {
        match self.check(&waiter) {
            Some(result) => {
                let _ = waiter.tx.send(result);
            }
            None => self.waiters.push(waiter),
        }
    }

    fn resolve_waiters(&mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            match self.check(&waiter) {
                Some(result) => {
                    let _ = waiter.tx.send(result);
                }
                None => self.waiters.push(waiter),
            }
        }
    }

    fn check(&self, waiter: &Waiter) -> Option<Result<i32, WatcherError>> {
        let Some(entry) = self.containers.get(&waiter.id) else {
            return Some(Err(self
                .terminated
                .clone()
                .unwrap_or_else(|| WatcherError::UnknownContainer(waiter.id.clone()))));
        };
        if let Some(err) = &entry.err {
            return Some(Err(err.clone()));
        }
        if entry.past_placeholder {
            match waiter.target {
                Target::Start if entry.state >= ContainerState::Running => return Some(Ok(0)),
                Target::Terminated if entry.state == ContainerState::Terminated => {
                    return Some(Ok(entry.exit_code))
                }
                _ => {}
            }
        }
        self.terminated.clone().map(Err)
    }

    fn finish(&mut self, err: WatcherError, outcome: Result<(), WatcherError>) {
        if self.terminated.is_some() {
            return;
        }
        self.resolve_waiters();
        self.terminated = Some(err);
        self.resolve_waiters();
        self.terminated_tx.send_replace(Some(outcome));
    }
}

fn reason_or(reason: &str, fallback: &str) -> String {
    if reason.is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

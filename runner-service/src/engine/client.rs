// Orchestrator Client
// Capability trait over the pod, secret and namespace APIs

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use thiserror::Error;

/// Errors raised by the orchestrator API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("orchestrator api error: {0}")]
    Api(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("orchestrator config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// One event of a pod watch stream
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// Added or modified; carries the current object
    Applied(Pod),
    Deleted(Pod),
}

pub type PodEventStream = BoxStream<'static, Result<PodEvent, OrchestratorError>>;
pub type LogStream = BoxStream<'static, Result<String, OrchestratorError>>;

/// The subset of the orchestrator API used by the engine
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), OrchestratorError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestratorError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), OrchestratorError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, OrchestratorError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, OrchestratorError>;

    /// Replace the pod; fails with `Conflict` on a stale resource version
    async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, OrchestratorError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<PodEventStream, OrchestratorError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError>;
}

#[cfg(test)]
pub mod fake {
    //! In-memory orchestrator used by engine, launcher and watcher tests

    use super::*;

    use futures::StreamExt;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, PodStatus,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Simplified container state used to script pod status
    #[derive(Debug, Clone)]
    pub enum FakeState {
        Waiting(&'static str),
        Running,
        Terminated(i32, &'static str),
    }

    #[derive(Default)]
    struct Inner {
        namespaces: HashSet<String>,
        secrets: HashSet<(String, String)>,
        pods: HashMap<(String, String), Pod>,
        logs: HashMap<String, Vec<String>>,
        log_errors: HashMap<String, String>,
        watchers: Vec<mpsc::UnboundedSender<Result<PodEvent, OrchestratorError>>>,
        version: u64,
    }

    #[derive(Default)]
    pub struct FakePodClient {
        inner: Mutex<Inner>,
        /// Number of upcoming updates that fail with a conflict
        pub conflicts: AtomicUsize,
        pub update_calls: AtomicUsize,
        pub get_calls: AtomicUsize,
    }

    impl FakePodClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_conflicts(self, count: usize) -> Self {
            self.conflicts.store(count, Ordering::SeqCst);
            self
        }

        pub fn with_logs(self, container: &str, lines: &[&str]) -> Self {
            self.inner
                .lock()
                .unwrap()
                .logs
                .insert(container.to_string(), lines.iter().map(|l| l.to_string()).collect());
            self
        }

        /// Fail opening the log stream of a container
        pub fn with_log_error(self, container: &str, message: &str) -> Self {
            self.inner
                .lock()
                .unwrap()
                .log_errors
                .insert(container.to_string(), message.to_string());
            self
        }

        pub fn has_namespace(&self, name: &str) -> bool {
            self.inner.lock().unwrap().namespaces.contains(name)
        }

        pub fn has_secret(&self, namespace: &str, name: &str) -> bool {
            self.inner
                .lock()
                .unwrap()
                .secrets
                .contains(&(namespace.to_string(), name.to_string()))
        }

        pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
            self.inner
                .lock()
                .unwrap()
                .pods
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Insert a pod directly, bypassing create
        pub fn insert_pod(&self, namespace: &str, pod: Pod) {
            let name = pod.metadata.name.clone().unwrap_or_default();
            self.inner
                .lock()
                .unwrap()
                .pods
                .insert((namespace.to_string(), name), pod);
        }

        /// Image currently assigned to a container in the pod spec
        pub fn container_image(&self, namespace: &str, pod: &str, container: &str) -> Option<String> {
            self.pod(namespace, pod)?
                .spec?
                .containers
                .into_iter()
                .find(|c| c.name == container)?
                .image
        }

        /// Overwrite the status of the named containers and emit a watch event
        pub fn set_status(&self, namespace: &str, pod: &str, statuses: &[(&str, &str, FakeState)]) {
            let mut inner = self.inner.lock().unwrap();
            let key = (namespace.to_string(), pod.to_string());
            let Some(stored) = inner.pods.get_mut(&key) else {
                return;
            };
            let status = stored.status.get_or_insert_with(PodStatus::default);
            let list = status.container_statuses.get_or_insert_with(Vec::new);
            for (name, image, state) in statuses {
                list.retain(|s| s.name != *name);
                list.push(container_status(name, image, state));
            }
            let event = PodEvent::Applied(stored.clone());
            inner.watchers.retain(|w| w.send(Ok(event.clone())).is_ok());
        }

        /// Close every open watch stream
        pub fn drop_watchers(&self) {
            self.inner.lock().unwrap().watchers.clear();
        }
    }

    fn container_status(name: &str, image: &str, state: &FakeState) -> ContainerStatus {
        let state = match state {
            FakeState::Waiting(reason) => ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            FakeState::Running => ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            },
            FakeState::Terminated(code, reason) => ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: *code,
                    reason: Some(reason.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        ContainerStatus {
            name: name.to_string(),
            image: image.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    fn name_of(meta: &Option<String>) -> String {
        meta.clone().unwrap_or_default()
    }

    #[async_trait]
    impl PodClient for FakePodClient {
        async fn create_namespace(&self, namespace: &Namespace) -> Result<(), OrchestratorError> {
            let name = name_of(&namespace.metadata.name);
            if !self.inner.lock().unwrap().namespaces.insert(name.clone()) {
                return Err(OrchestratorError::AlreadyExists(name));
            }
            Ok(())
        }

        async fn delete_namespace(&self, name: &str) -> Result<(), OrchestratorError> {
            let mut inner = self.inner.lock().unwrap();
            if !inner.namespaces.remove(name) {
                return Err(OrchestratorError::NotFound(name.to_string()));
            }
            inner.secrets.retain(|(ns, _)| ns != name);
            Ok(())
        }

        async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), OrchestratorError> {
            let name = name_of(&secret.metadata.name);
            if !self
                .inner
                .lock()
                .unwrap()
                .secrets
                .insert((namespace.to_string(), name.clone()))
            {
                return Err(OrchestratorError::AlreadyExists(name));
            }
            Ok(())
        }

        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
            if !self
                .inner
                .lock()
                .unwrap()
                .secrets
                .remove(&(namespace.to_string(), name.to_string()))
            {
                return Err(OrchestratorError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, OrchestratorError> {
            let mut inner = self.inner.lock().unwrap();
            let key = (namespace.to_string(), name_of(&pod.metadata.name));
            if inner.pods.contains_key(&key) {
                return Err(OrchestratorError::AlreadyExists(key.1));
            }
            inner.version += 1;
            let mut stored = pod.clone();
            stored.metadata.resource_version = Some(inner.version.to_string());
            inner.pods.insert(key, stored.clone());
            Ok(stored)
        }

        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, OrchestratorError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.pod(namespace, name)
                .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
        }

        async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, OrchestratorError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            let conflict = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if conflict {
                return Err(OrchestratorError::Conflict("object has been modified".to_string()));
            }

            let mut inner = self.inner.lock().unwrap();
            let key = (namespace.to_string(), name_of(&pod.metadata.name));
            let Some(stored) = inner.pods.get(&key) else {
                return Err(OrchestratorError::NotFound(key.1));
            };
            if stored.metadata.resource_version != pod.metadata.resource_version {
                return Err(OrchestratorError::Conflict("stale resource version".to_string()));
            }
            let status = stored.status.clone();
            inner.version += 1;
            let mut updated = pod.clone();
            updated.status = status;
            updated.metadata.resource_version = Some(inner.version.to_string());
            inner.pods.insert(key, updated.clone());
            Ok(updated)
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
            let mut inner = self.inner.lock().unwrap();
            let Some(pod) = inner.pods.remove(&(namespace.to_string(), name.to_string())) else {
                return Err(OrchestratorError::NotFound(name.to_string()));
            };
            let event = PodEvent::Deleted(pod);
            inner.watchers.retain(|w| w.send(Ok(event.clone())).is_ok());
            Ok(())
        }

        async fn watch_pods(
            &self,
            _namespace: &str,
            _label_selector: &str,
        ) -> Result<PodEventStream, OrchestratorError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner.lock().unwrap().watchers.push(tx);
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }

        async fn pod_logs(
            &self,
            _namespace: &str,
            _name: &str,
            container: &str,
            _follow: bool,
        ) -> Result<LogStream, OrchestratorError> {
            let inner = self.inner.lock().unwrap();
            if let Some(message) = inner.log_errors.get(container) {
                return Err(OrchestratorError::NotFound(message.clone()));
            }
            let lines = inner.logs.get(container).cloned().unwrap_or_default();
            Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
        }
    }
}

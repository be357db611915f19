// Kubernetes Client
// PodClient implementation backed by the kube crate

use crate::engine::client::{LogStream, OrchestratorError, PodClient, PodEvent, PodEventStream};

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::{Api, DeleteParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Server-side watch timeout; the stream ends and is reopened after this
const WATCH_TIMEOUT_SECS: u32 = 290;

const STREAM_BUFFER: usize = 64;

/// Orchestrator client talking to a real cluster
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the default kubeconfig
    pub async fn try_default() -> Result<Self, OrchestratorError> {
        let client = Client::try_default()
            .await
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// Connect using an explicit kubeconfig file
    pub async fn from_kubeconfig(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let kubeconfig = Kubeconfig::read_from(path.as_ref())
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        let client = Client::try_from(config).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_error(err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            OrchestratorError::AlreadyExists(resp.message)
        }
        kube::Error::Api(resp) if resp.code == 409 => OrchestratorError::Conflict(resp.message),
        kube::Error::Api(resp) if resp.code == 404 => OrchestratorError::NotFound(resp.message),
        kube::Error::Api(resp) => {
            OrchestratorError::Api(format!("{} ({} {})", resp.message, resp.code, resp.reason))
        }
        other => OrchestratorError::Api(other.to_string()),
    }
}

#[async_trait]
impl PodClient for KubeClient {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), OrchestratorError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), OrchestratorError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), OrchestratorError> {
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, OrchestratorError> {
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(map_error)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, OrchestratorError> {
        self.pods(namespace).get(name).await.map_err(map_error)
    }

    async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, OrchestratorError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods(namespace)
            .replace(&name, &PostParams::default(), pod)
            .await
            .map_err(map_error)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<PodEventStream, OrchestratorError> {
        let api = self.pods(namespace);
        let params = WatchParams::default()
            .labels(label_selector)
            .timeout(WATCH_TIMEOUT_SECS);
        let stream = api.watch(&params, "0").await.map_err(map_error)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(event) = stream.next().await {
                let event = match event {
                    Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                        Ok(PodEvent::Applied(pod))
                    }
                    Ok(WatchEvent::Deleted(pod)) => Ok(PodEvent::Deleted(pod)),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(resp)) => Err(OrchestratorError::Stream(resp.message)),
                    Err(err) => Err(OrchestratorError::Stream(err.to_string())),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        follow: bool,
    ) -> Result<LogStream, OrchestratorError> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow,
            ..Default::default()
        };
        let reader = self
            .pods(namespace)
            .log_stream(name, &params)
            .await
            .map_err(map_error)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut lines = Box::pin(reader.lines());
            while let Some(line) = lines.next().await {
                let line = line.map_err(|e| OrchestratorError::Stream(e.to_string()));
                let failed = line.is_err();
                if tx.send(line).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

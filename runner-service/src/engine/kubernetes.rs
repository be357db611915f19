// Kubernetes Engine
// Runs a spec as a single pod whose containers are launched just in time

use crate::engine::client::{OrchestratorError, PodClient};
use crate::engine::launcher::{LaunchError, Launcher};
use crate::engine::watcher::PodWatcher;
use crate::engine::{pod, Engine, LogWriter, StepOutcome};
use crate::error::ServiceError;
use crate::ir::{Spec, Step};

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the watcher's reconciling pod read
    pub snapshot_period: Duration,
    /// How long destroy waits for the pod to disappear
    pub delete_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_period: Duration::from_secs(20),
            delete_timeout: Duration::from_secs(60),
        }
    }
}

/// Watcher and launcher bound to one running pod
struct PodRuntime {
    watcher: PodWatcher,
    launcher: Launcher,
    stop: CancellationToken,
}

/// Engine backed by the kubernetes pod API
pub struct KubernetesEngine {
    client: Arc<dyn PodClient>,
    config: EngineConfig,
    pods: Mutex<HashMap<String, Arc<PodRuntime>>>,
}

impl KubernetesEngine {
    pub fn new(client: Arc<dyn PodClient>) -> Self {
        Self {
            client,
            config: EngineConfig::default(),
            pods: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    async fn runtime(&self, spec: &Spec) -> Result<Arc<PodRuntime>, ServiceError> {
        self.pods
            .lock()
            .await
            .get(&spec.pod_spec.name)
            .cloned()
            .ok_or_else(|| ServiceError::Setup(format!("pod {} is not set up", spec.pod_spec.name)))
    }

    async fn create_objects(&self, spec: &Spec) -> Result<(), OrchestratorError> {
        let namespace = &spec.pod_spec.namespace;
        let encode = |e: serde_json::Error| OrchestratorError::Config(e.to_string());

        if spec.owns_namespace {
            let object = pod::namespace(spec).map_err(encode)?;
            ignore_exists(self.client.create_namespace(&object).await)?;
        }
        if !spec.secrets.is_empty() {
            let object = pod::secret(spec).map_err(encode)?;
            ignore_exists(self.client.create_secret(namespace, &object).await)?;
        }
        if let Some(object) = pod::pull_secret(spec).map_err(encode)? {
            ignore_exists(self.client.create_secret(namespace, &object).await)?;
        }

        let object = pod::pod(spec).map_err(encode)?;
        ignore_exists(self.client.create_pod(namespace, &object).await.map(|_| ()))
    }

    async fn copy_logs(
        &self,
        ctx: &CancellationToken,
        spec: &Spec,
        step: &Step,
        output: &mut dyn LogWriter,
    ) -> Result<(), ServiceError> {
        let opened = tokio::select! {
            _ = ctx.cancelled() => return Err(ServiceError::Cancelled),
            opened = self.client.pod_logs(&spec.pod_spec.namespace, &spec.pod_spec.name, &step.id, true) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(step = %step.name, error = %err, "failed to open log stream");
                output
                    .write_line(&format!("cannot stream logs for step {}: {}", step.name, err))
                    .await;
                return Ok(());
            }
        };

        loop {
            let line = tokio::select! {
                _ = ctx.cancelled() => return Err(ServiceError::Cancelled),
                line = stream.next() => line,
            };
            match line {
                Some(Ok(line)) => output.write_line(&line).await,
                Some(Err(err)) => {
                    tracing::warn!(step = %step.name, error = %err, "log stream interrupted");
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }
}

fn ignore_exists(result: Result<(), OrchestratorError>) -> Result<(), OrchestratorError> {
    match result {
        Err(err) if err.is_already_exists() => Ok(()),
        other => other,
    }
}

fn ignore_missing(result: Result<(), OrchestratorError>) -> Result<(), OrchestratorError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Engine for KubernetesEngine {
    async fn setup(&self, ctx: &CancellationToken, spec: &Spec) -> Result<(), ServiceError> {
        if ctx.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let name = &spec.pod_spec.name;
        if self.pods.lock().await.contains_key(name) {
            return Ok(());
        }

        tracing::debug!(pod = %name, namespace = %spec.pod_spec.namespace, "creating pod");
        self.create_objects(spec)
            .await
            .map_err(|e| ServiceError::Setup(e.to_string()))?;

        let stop = CancellationToken::new();
        let watcher = PodWatcher::start(
            self.client.clone(),
            spec.pod_spec.namespace.clone(),
            name.clone(),
            pod::label_selector(spec),
            self.config.snapshot_period,
            stop.child_token(),
        );
        for step in &spec.steps {
            watcher.add_container(&step.id, &step.placeholder);
        }
        let launcher = Launcher::start(
            self.client.clone(),
            spec.pod_spec.namespace.clone(),
            name.clone(),
            Arc::new(Mutex::new(())),
            stop.child_token(),
        );

        self.pods.lock().await.insert(
            name.clone(),
            Arc::new(PodRuntime {
                watcher,
                launcher,
                stop,
            }),
        );
        Ok(())
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        spec: &Spec,
        step: &Step,
        output: &mut dyn LogWriter,
    ) -> Result<StepOutcome, ServiceError> {
        if ctx.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let runtime = self.runtime(spec).await?;

        let annotations = BTreeMap::from([(pod::step_annotation(&step.id), "running".to_string())]);
        let launched = runtime.launcher.launch(&step.id, &step.image, annotations);
        let result = tokio::select! {
            _ = ctx.cancelled() => Err(LaunchError::Cancelled),
            result = launched => result.unwrap_or(Err(LaunchError::Stopped)),
        };
        result?;
        tracing::debug!(step = %step.name, image = %step.image, "container launched");

        runtime.watcher.wait_start(ctx, &step.id).await?;
        self.copy_logs(ctx, spec, step, output).await?;
        let exit_code = runtime.watcher.wait_terminated(ctx, &step.id).await?;

        tracing::debug!(step = %step.name, exit_code, "container terminated");
        Ok(StepOutcome::new(exit_code))
    }

    async fn destroy(&self, spec: &Spec) -> Result<(), ServiceError> {
        let namespace = &spec.pod_spec.namespace;
        let name = &spec.pod_spec.name;
        let runtime = self.pods.lock().await.remove(name);
        let mut first_error: Option<OrchestratorError> = None;
        let mut record = |result: Result<(), OrchestratorError>| {
            if let Err(err) = ignore_missing(result) {
                tracing::warn!(pod = %name, error = %err, "cleanup failed");
                first_error.get_or_insert(err);
            }
        };

        record(self.client.delete_pod(namespace, name).await);

        if let Some(runtime) = runtime {
            let waited = tokio::time::timeout(
                self.config.delete_timeout,
                runtime.watcher.wait_pod_deleted(&CancellationToken::new()),
            )
            .await;
            match waited {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(pod = %name, error = %err, "pod watcher ended"),
                Err(_) => tracing::warn!(pod = %name, "timed out waiting for pod deletion"),
            }
            runtime.watcher.shutdown();
            runtime.stop.cancel();
        }

        if !spec.secrets.is_empty() {
            record(self.client.delete_secret(namespace, &spec.secret_object_name()).await);
        }
        if let Some(pull) = &spec.pull_secret {
            record(self.client.delete_secret(namespace, &pull.name).await);
        }
        if spec.owns_namespace {
            record(self.client.delete_namespace(namespace).await);
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client::fake::{FakePodClient, FakeState};
    use crate::ir::{PodSpec, Secret};

    const PLACEHOLDER: &str = "docker.io/drone/placeholder:1";

    fn spec() -> Spec {
        let mut spec = Spec {
            pod_spec: PodSpec {
                name: "drone-pod".to_string(),
                namespace: "drone-ns".to_string(),
                ..Default::default()
            },
            owns_namespace: true,
            ..Default::default()
        };
        spec.secrets.insert(
            "token".to_string(),
            Secret {
                name: "token".to_string(),
                data: "s3cr3t".to_string(),
                mask: true,
            },
        );
        spec.steps.push(Step {
            id: "a".to_string(),
            name: "build".to_string(),
            image: "docker.io/library/alpine:3".to_string(),
            placeholder: PLACEHOLDER.to_string(),
            ..Default::default()
        });
        spec
    }

    #[derive(Default)]
    struct Lines(Vec<String>);

    #[async_trait]
    impl LogWriter for Lines {
        async fn write_line(&mut self, line: &str) {
            self.0.push(line.to_string());
        }

        async fn close(&mut self) {}
    }

    fn engine(client: &Arc<FakePodClient>) -> KubernetesEngine {
        KubernetesEngine::new(client.clone()).with_config(EngineConfig {
            snapshot_period: Duration::from_secs(1),
            delete_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_and_destroy_leave_nothing_behind() {
        let client = Arc::new(FakePodClient::new());
        let engine = engine(&client);
        let spec = spec();
        let ctx = CancellationToken::new();

        engine.setup(&ctx, &spec).await.unwrap();
        engine.setup(&ctx, &spec).await.unwrap();
        assert!(client.has_namespace("drone-ns"));
        assert!(client.has_secret("drone-ns", "drone-pod"));
        assert_eq!(
            client.container_image("drone-ns", "drone-pod", "a").as_deref(),
            Some(PLACEHOLDER)
        );

        engine.destroy(&spec).await.unwrap();
        engine.destroy(&spec).await.unwrap();
        assert!(client.pod("drone-ns", "drone-pod").is_none());
        assert!(!client.has_secret("drone-ns", "drone-pod"));
        assert!(!client.has_namespace("drone-ns"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_step() {
        let client = Arc::new(FakePodClient::new().with_logs("a", &["hello", "world"]));
        let engine = Arc::new(engine(&client));
        let spec = Arc::new(spec());
        let ctx = CancellationToken::new();
        engine.setup(&ctx, &spec).await.unwrap();

        let run = {
            let (engine, spec, ctx) = (engine.clone(), spec.clone(), ctx.clone());
            tokio::spawn(async move {
                let mut lines = Lines::default();
                let outcome = engine.run(&ctx, &spec, &spec.steps[0], &mut lines).await;
                (outcome, lines.0)
            })
        };

        // wait for the launcher to swap the image, then play the kubelet
        while client.container_image("drone-ns", "drone-pod", "a").as_deref() == Some(PLACEHOLDER) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let annotations = client.pod("drone-ns", "drone-pod").unwrap().metadata.annotations.unwrap();
        assert_eq!(annotations["io.drone.step.a"], "running");

        client.set_status("drone-ns", "drone-pod", &[("a", "alpine:3", FakeState::Running)]);
        client.set_status("drone-ns", "drone-pod", &[("a", "alpine:3", FakeState::Terminated(3, "Error"))]);

        let (outcome, lines) = run.await.unwrap();
        assert_eq!(outcome.unwrap(), StepOutcome::new(3));
        assert_eq!(lines, vec!["hello", "world"]);

        engine.destroy(&spec).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_stream_failure_is_written() {
        let client = Arc::new(FakePodClient::new().with_log_error("a", "container not found"));
        let engine = Arc::new(engine(&client));
        let spec = Arc::new(spec());
        let ctx = CancellationToken::new();
        engine.setup(&ctx, &spec).await.unwrap();

        let run = {
            let (engine, spec, ctx) = (engine.clone(), spec.clone(), ctx.clone());
            tokio::spawn(async move {
                let mut lines = Lines::default();
                let outcome = engine.run(&ctx, &spec, &spec.steps[0], &mut lines).await;
                (outcome, lines.0)
            })
        };

        while client.container_image("drone-ns", "drone-pod", "a").as_deref() == Some(PLACEHOLDER) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        client.set_status("drone-ns", "drone-pod", &[("a", "alpine:3", FakeState::Running)]);
        client.set_status("drone-ns", "drone-pod", &[("a", "alpine:3", FakeState::Terminated(0, "Completed"))]);

        let (outcome, lines) = run.await.unwrap();
        assert_eq!(outcome.unwrap(), StepOutcome::new(0));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("cannot stream logs for step build"));
        assert!(lines[0].contains("container not found"));

        engine.destroy(&spec).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_skips_launch() {
        let client = Arc::new(FakePodClient::new());
        let engine = engine(&client);
        let spec = spec();
        let ctx = CancellationToken::new();
        engine.setup(&ctx, &spec).await.unwrap();

        ctx.cancel();
        let mut lines = Lines::default();
        let result = engine.run(&ctx, &spec, &spec.steps[0], &mut lines).await;

        assert!(matches!(result, Err(ServiceError::Cancelled)));
        assert_eq!(client.update_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        engine.destroy(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_without_setup() {
        let client = Arc::new(FakePodClient::new());
        let engine = engine(&client);
        let spec = spec();
        let mut lines = Lines::default();

        let result = engine
            .run(&CancellationToken::new(), &spec, &spec.steps[0], &mut lines)
            .await;
        assert!(matches!(result, Err(ServiceError::Setup(_))));
    }
}

// Runner Front-End
// Accepts stages from the coordinator, compiles them and drives the execer

pub mod poller;

pub use poller::Poller;

use crate::compiler::{environ, CompileArgs, Compiler};
use crate::coordinator::models::{Build, Context, Repo, Stage};
use crate::coordinator::{Client, ClientError};
use crate::engine::Engine;
use crate::error::{MultiError, ServiceError};
use crate::execution::{Execer, RemoteReporter, RemoteStreamer, Reporter, State};
use crate::ir::Spec;
use crate::manifest::{envsubst, lint, Manifest};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Restrictions on which stages this runner executes
#[derive(Debug, Clone, Default)]
pub struct Limits {
    /// Glob patterns matched against the repository slug
    pub repos: Vec<String>,
    /// Build events accepted
    pub events: Vec<String>,
    /// Only run stages of trusted repositories
    pub trusted: bool,
}

impl Limits {
    pub fn check(&self, repo: &Repo, build: &Build) -> Result<(), ServiceError> {
        if !self.repos.is_empty() {
            let allowed = self.repos.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(&repo.slug))
                    .unwrap_or(false)
            });
            if !allowed {
                return Err(ServiceError::AccessDenied(format!(
                    "repository {} is not allowed",
                    repo.slug
                )));
            }
        }
        if !self.events.is_empty() && !self.events.iter().any(|e| e == &build.event) {
            return Err(ServiceError::AccessDenied(format!(
                "event {} is not allowed",
                build.event
            )));
        }
        if self.trusted && !repo.trusted {
            return Err(ServiceError::AccessDenied(format!(
                "repository {} is not trusted",
                repo.slug
            )));
        }
        Ok(())
    }
}

/// Runs stages dispatched by the coordinator
pub struct Runner {
    client: Arc<dyn Client>,
    compiler: Compiler,
    engine: Arc<dyn Engine>,
    machine: String,
    environ: BTreeMap<String, String>,
    limits: Limits,
    max_procs: usize,
}

impl Runner {
    pub fn new(client: Arc<dyn Client>, compiler: Compiler, engine: Arc<dyn Engine>) -> Self {
        Self {
            client,
            compiler,
            engine,
            machine: String::new(),
            environ: BTreeMap::new(),
            limits: Limits::default(),
            max_procs: 0,
        }
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = machine.into();
        self
    }

    /// Extra variables available to `${NAME}` substitution
    pub fn with_environ(mut self, environ: BTreeMap<String, String>) -> Self {
        self.environ = environ;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs;
        self
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Accept, compile and execute one stage
    pub async fn run(&self, ctx: &CancellationToken, mut stage: Stage) -> Result<(), MultiError> {
        stage.machine = self.machine.clone();
        match self.client.accept(&mut stage).await {
            Ok(()) => {}
            Err(ClientError::OptimisticLock) => {
                tracing::debug!(stage.id = stage.id, "stage accepted by another runner");
                return Ok(());
            }
            Err(err) => return Err(ServiceError::from(err).into()),
        }
        tracing::info!(
            stage.id = stage.id,
            stage.name = %stage.name,
            build.id = stage.build_id,
            "accepted stage"
        );

        let detail = self
            .client
            .detail(&stage)
            .await
            .map_err(ServiceError::from)?;
        let state = Arc::new(State::new(
            detail.build.clone(),
            detail.repo.clone(),
            stage.clone(),
            detail.system.clone(),
        ));
        let reporter = RemoteReporter::new(self.client.clone());

        let spec = match self.prepare(&detail, &stage).await {
            Ok(spec) => spec,
            Err(err) => {
                tracing::warn!(stage.id = stage.id, error = %err, "cannot prepare stage");
                let mut errors = MultiError::new();
                let mut s = state.lock().await;
                s.fail_all(&err);
                if let Err(report_err) = reporter.report_stage(&mut s).await {
                    errors.push(report_err);
                }
                errors.push(err);
                return errors.into_result();
            }
        };

        self.execute(ctx, &detail, spec, state).await
    }

    /// Execute an already compiled spec for a stage accepted elsewhere
    pub async fn run_spec(
        &self,
        ctx: &CancellationToken,
        detail: Context,
        spec: Spec,
    ) -> Result<(), MultiError> {
        let state = Arc::new(State::new(
            detail.build.clone(),
            detail.repo.clone(),
            detail.stage.clone(),
            detail.system.clone(),
        ));
        self.execute(ctx, &detail, spec, state).await
    }

    async fn prepare(&self, detail: &Context, stage: &Stage) -> Result<Spec, ServiceError> {
        let vars = environ::combine([
            &self.environ,
            &environ::system(&detail.system),
            &environ::repo(&detail.repo),
            &environ::build(&detail.build),
            &environ::stage(stage),
            &environ::link(&detail.repo, &detail.build, &detail.system),
        ]);
        let data = envsubst(&detail.config.data, |name| vars.get(name).cloned());

        let manifest = Manifest::parse(&data)?;
        let pipeline = manifest.lookup(&stage.name)?;
        self.limits.check(&detail.repo, &detail.build)?;
        lint(pipeline, detail.repo.trusted)?;

        let args = CompileArgs {
            pipeline,
            manifest: &manifest,
            build: &detail.build,
            repo: &detail.repo,
            stage,
            system: &detail.system,
            netrc: detail.netrc.as_ref(),
            secrets: &detail.secrets,
        };
        Ok(self.compiler.compile(&args).await?)
    }

    async fn execute(
        &self,
        ctx: &CancellationToken,
        detail: &Context,
        spec: Spec,
        state: Arc<State>,
    ) -> Result<(), MultiError> {
        let reporter = Arc::new(RemoteReporter::new(self.client.clone()));
        {
            let mut s = state.lock().await;
            s.populate(&spec);
            s.start_stage();
            // Step ids are assigned by this first update.
            reporter.report_stage(&mut s).await?;
        }

        let ctx = ctx.child_token();
        let watch = {
            let client = self.client.clone();
            let ctx = ctx.clone();
            let build_id = detail.build.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    done = client.watch(build_id) => match done {
                        Ok(true) => {
                            tracing::info!(build.id = build_id, "received cancellation");
                            ctx.cancel();
                        }
                        Ok(false) => {}
                        Err(err) => tracing::debug!(build.id = build_id, error = %err, "cancellation watch ended"),
                    },
                }
            })
        };
        let timed_out = Arc::new(AtomicBool::new(false));
        let timeout = (detail.repo.timeout > 0).then(|| {
            let ctx = ctx.clone();
            let timed_out = timed_out.clone();
            let limit = Duration::from_secs(detail.repo.timeout as u64 * 60);
            tokio::spawn(async move {
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        timed_out.store(true, Ordering::SeqCst);
                        ctx.cancel();
                    }
                }
            })
        });

        let streamer = Arc::new(RemoteStreamer::new(self.client.clone()));
        let execer = Execer::new(self.engine.clone(), reporter, streamer).with_max_procs(self.max_procs);
        let result = execer.exec(&ctx, Arc::new(spec), state.clone()).await;

        watch.abort();
        if let Some(timeout) = timeout {
            timeout.abort();
        }

        let stage = state.stage().await;
        tracing::info!(stage.id = stage.id, status = %stage.status, "stage complete");
        if timed_out.load(Ordering::SeqCst) {
            let mut errors = result.err().unwrap_or_default();
            errors.push(ServiceError::DeadlineExceeded);
            return errors.into_result();
        }
        result
    }
}

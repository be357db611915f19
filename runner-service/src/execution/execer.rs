// DAG Execer
// Runs the steps of a compiled spec in dependency order with bounded parallelism

use crate::compiler::environ;
use crate::coordinator::models::Status;
use crate::engine::{Engine, LogWriter};
use crate::error::{MultiError, ServiceError};
use crate::execution::graph::StepGraph;
use crate::execution::replacer::Replacer;
use crate::execution::reporter::Reporter;
use crate::execution::state::{State, StateInner, EXIT_SKIP_ALL};
use crate::execution::streamer::Streamer;
use crate::ir::{RunPolicy, Spec, Step};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Executes one stage: setup, the step graph, teardown and the final report
#[derive(Clone)]
pub struct Execer {
    engine: Arc<dyn Engine>,
    reporter: Arc<dyn Reporter>,
    streamer: Arc<dyn Streamer>,
    /// Cap on concurrently running non-detached steps; zero is unbounded
    max_procs: usize,
}

/// Shared by every step task of one execution
struct Run {
    ctx: CancellationToken,
    /// Cancelled once the graph drains so detached steps stop
    detach_ctx: CancellationToken,
    spec: Arc<Spec>,
    state: Arc<State>,
    semaphore: Option<Arc<Semaphore>>,
    detached: Mutex<JoinSet<()>>,
}

/// Signals dependents when a step task ends, however it ends
struct Done(watch::Sender<bool>);

impl Drop for Done {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl Execer {
    pub fn new(
        engine: Arc<dyn Engine>,
        reporter: Arc<dyn Reporter>,
        streamer: Arc<dyn Streamer>,
    ) -> Self {
        Self {
            engine,
            reporter,
            streamer,
            max_procs: 0,
        }
    }

    pub fn with_max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs;
        self
    }

    /// Run the stage to completion. Teardown always runs once setup was
    /// attempted; every error met along the way is returned together.
    pub async fn exec(
        &self,
        ctx: &CancellationToken,
        spec: Arc<Spec>,
        state: Arc<State>,
    ) -> Result<(), MultiError> {
        let mut errors = MultiError::new();

        if let Err(err) = StepGraph::from_spec(&spec) {
            let err = ServiceError::from(err);
            self.fail_stage(&state, &err, &mut errors).await;
            errors.push(err);
            return errors.into_result();
        }

        if let Err(err) = self.engine.setup(ctx, &spec).await {
            tracing::error!(pod = %spec.pod_spec.name, error = %err, "cannot set up pipeline");
            self.fail_stage(&state, &err, &mut errors).await;
            if let Err(destroy_err) = self.engine.destroy(&spec).await {
                tracing::warn!(error = %destroy_err, "cannot tear down pipeline");
                errors.push(destroy_err);
            }
            errors.push(err);
            return errors.into_result();
        }

        errors.extend(self.run_graph(ctx, &spec, &state).await);

        if let Err(err) = self.engine.destroy(&spec).await {
            tracing::warn!(pod = %spec.pod_spec.name, error = %err, "cannot tear down pipeline");
            errors.push(err);
        }

        let mut s = state.lock().await;
        if ctx.is_cancelled() {
            s.cancel_all();
        }
        s.finish_all();
        tracing::info!(stage = %s.stage.name, status = %s.stage.status, "stage finished");
        if let Err(err) = self.reporter.report_stage(&mut s).await {
            errors.push(err);
        }
        drop(s);

        errors.into_result()
    }

    async fn fail_stage(&self, state: &State, err: &ServiceError, errors: &mut MultiError) {
        let mut s = state.lock().await;
        s.fail_all(err);
        if let Err(report_err) = self.reporter.report_stage(&mut s).await {
            errors.push(report_err);
        }
    }

    async fn run_graph(
        &self,
        ctx: &CancellationToken,
        spec: &Arc<Spec>,
        state: &Arc<State>,
    ) -> MultiError {
        let run = Arc::new(Run {
            ctx: ctx.clone(),
            detach_ctx: ctx.child_token(),
            spec: spec.clone(),
            state: state.clone(),
            semaphore: (self.max_procs > 0).then(|| Arc::new(Semaphore::new(self.max_procs))),
            detached: Mutex::new(JoinSet::new()),
        });

        let mut signals = HashMap::new();
        let mut senders = Vec::new();
        for step in &spec.steps {
            let (tx, rx) = watch::channel(false);
            signals.insert(step.name.clone(), rx);
            senders.push(tx);
        }

        let mut set = JoinSet::new();
        for (step, tx) in spec.steps.iter().zip(senders) {
            let deps: Vec<_> = step
                .depends_on
                .iter()
                .filter_map(|name| signals.get(name).cloned())
                .collect();
            let execer = self.clone();
            let run = run.clone();
            let step = step.clone();
            set.spawn(async move {
                let _done = Done(tx);
                execer.run_step(&run, step, deps).await
            });
        }

        let mut errors = MultiError::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(step_errors) => errors.extend(step_errors),
                Err(err) => {
                    tracing::error!(error = %err, "step task failed");
                    errors.push(ServiceError::Io(std::io::Error::other(err)));
                }
            }
        }

        run.detach_ctx.cancel();
        let mut detached = run.detached.lock().await;
        while detached.join_next().await.is_some() {}

        errors
    }

    /// Skip the step when its run policy rules it out. Returns true when the
    /// step is settled and must not run.
    async fn settle(&self, s: &mut StateInner, step: &Step, errors: &mut MultiError) -> bool {
        // Already skipped by an earlier exit code 78.
        match s.find(&step.name) {
            Some(record) if record.status == Status::Pending => {}
            _ => return true,
        }
        if should_run(step.run_policy, s.failed()) {
            return false;
        }
        tracing::debug!(step.name = %step.name, "skipping step");
        s.skip(&step.name);
        if let Err(err) = self.reporter.report_step(s, &step.name).await {
            errors.push(err);
        }
        true
    }

    async fn run_step(
        &self,
        run: &Run,
        mut step: Step,
        deps: Vec<watch::Receiver<bool>>,
    ) -> MultiError {
        let mut errors = MultiError::new();

        for mut dep in deps {
            // A closed channel means the dependency task is gone; either way it is done.
            let _ = dep.wait_for(|done| *done).await;
        }

        // Steps ruled out by their run policy never wait for a permit.
        {
            let mut s = run.state.lock().await;
            if self.settle(&mut s, &step, &mut errors).await {
                return errors;
            }
        }

        let _permit = match (&run.semaphore, step.detach) {
            (Some(semaphore), false) => tokio::select! {
                _ = run.ctx.cancelled() => return errors,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            },
            _ => None,
        };
        if run.ctx.is_cancelled() {
            return errors;
        }

        let record = {
            let mut s = run.state.lock().await;
            // The outcome of other steps may have changed while waiting.
            if self.settle(&mut s, &step, &mut errors).await {
                return errors;
            }
            let Some(record) = s.find(&step.name).cloned() else {
                return errors;
            };
            let failed = s.failed();

            s.start(&step.name);
            if let Err(err) = self.reporter.report_step(&mut s, &step.name).await {
                errors.push(err);
            }

            let status = if failed { Status::Failing } else { Status::Passing };
            step.envs.extend(environ::step_overlay(
                status.as_str(),
                status.as_str(),
                &step.name,
                record.number,
                &s.failed_steps(),
            ));
            record
        };

        let mut writer = Replacer::new(self.streamer.stream(&record), run.spec.masked_secrets());
        tracing::debug!(step.name = %step.name, image = %step.image, detach = step.detach, "starting step");

        if step.detach {
            let engine = self.engine.clone();
            let spec = run.spec.clone();
            let ctx = run.detach_ctx.clone();
            run.detached.lock().await.spawn(async move {
                let result = engine.run(&ctx, &spec, &step, &mut writer).await;
                writer.close().await;
                match result {
                    Ok(outcome) => {
                        tracing::debug!(step.name = %step.name, exit_code = outcome.exit_code, "detached step exited")
                    }
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        tracing::debug!(step.name = %step.name, error = %err, "detached step failed")
                    }
                }
            });
            return errors;
        }

        let result = self.engine.run(&run.ctx, &run.spec, &step, &mut writer).await;
        writer.close().await;

        let mut s = run.state.lock().await;
        // Cancellation is settled for the whole stage once the graph drains.
        if run.ctx.is_cancelled() {
            return errors;
        }
        match result {
            Ok(outcome) => {
                tracing::debug!(step.name = %step.name, exit_code = outcome.exit_code, "step exited");
                s.finish(&step.name, outcome.exit_code);
                if outcome.exit_code == EXIT_SKIP_ALL {
                    s.skip_all();
                }
            }
            Err(err) if err.is_cancelled() => {
                s.kill(&step.name);
            }
            Err(err) => {
                tracing::warn!(step.name = %step.name, error = %err, "step failed");
                s.fail(&step.name, &err);
                errors.push(err);
            }
        }
        if let Err(err) = self.reporter.report_step(&mut s, &step.name).await {
            errors.push(err);
        }

        errors
    }
}

fn should_run(policy: RunPolicy, failed: bool) -> bool {
    match policy {
        RunPolicy::Never => false,
        RunPolicy::Always => true,
        RunPolicy::OnFailure => failed,
        RunPolicy::Default | RunPolicy::OnSuccess => !failed,
    }
}

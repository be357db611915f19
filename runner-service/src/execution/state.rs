// Stage State
// Lock-guarded build, repo and stage records mutated as the stage runs

use crate::coordinator::models::{Build, Repo, Stage, Status, Step, System};
use crate::error::ServiceError;
use crate::ir::Spec;

use tokio::sync::{Mutex, MutexGuard};

/// Exit code that skips every remaining step without failing the stage
pub const EXIT_SKIP_ALL: i32 = 78;

const EXIT_KILLED: i32 = 137;
const EXIT_ERROR: i32 = 255;

/// Shared state of one running stage. Reporting holds the lock for the
/// duration of the update so the coordinator sees transitions in order.
#[derive(Debug)]
pub struct State {
    inner: Mutex<StateInner>,
}

#[derive(Debug, Clone, Default)]
pub struct StateInner {
    pub build: Build,
    pub repo: Repo,
    pub stage: Stage,
    pub system: System,
}

impl State {
    pub fn new(build: Build, repo: Repo, stage: Stage, system: System) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                build,
                repo,
                stage,
                system,
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().await
    }

    /// Copy of the current stage record
    pub async fn stage(&self) -> Stage {
        self.inner.lock().await.stage.clone()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl StateInner {
    pub fn find(&self, name: &str) -> Option<&Step> {
        self.stage.steps.iter().find(|s| s.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.stage.steps.iter_mut().find(|s| s.name == name)
    }

    /// Replace the stage's steps with pending records for every step in `spec`
    pub fn populate(&mut self, spec: &Spec) {
        let stage_id = self.stage.id;
        self.stage.steps = spec
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| Step {
                step_id: stage_id,
                number: i as i64 + 1,
                name: step.name.clone(),
                status: Status::Pending,
                errignore: step.ignore_err,
                depends_on: step.depends_on.clone(),
                image: step.image.clone(),
                detached: step.detach,
                ..Default::default()
            })
            .collect();
    }

    /// Mark the stage running
    pub fn start_stage(&mut self) {
        self.stage.status = Status::Running;
        if self.stage.started == 0 {
            self.stage.started = now();
        }
    }

    /// Mark a step running
    pub fn start(&mut self, name: &str) {
        if let Some(step) = self.find_mut(name) {
            step.status = Status::Running;
            step.started = now();
        }
    }

    /// Record a step's exit code
    pub fn finish(&mut self, name: &str, exit_code: i32) {
        let Some(step) = self.find_mut(name) else {
            return;
        };
        step.exit_code = exit_code;
        step.stopped = now();
        step.status = match exit_code {
            0 | EXIT_SKIP_ALL => Status::Passing,
            _ => Status::Failing,
        };
        let failed = step.status == Status::Failing && !step.errignore;
        if failed && self.stage.status == Status::Running {
            self.stage.status = Status::Failing;
        }
    }

    /// Record a step that could not run to an exit code
    pub fn fail(&mut self, name: &str, err: &ServiceError) {
        let Some(step) = self.find_mut(name) else {
            return;
        };
        step.status = Status::Error;
        step.error = err.to_string();
        step.exit_code = EXIT_ERROR;
        step.stopped = now();
        if step.started == 0 {
            step.started = step.stopped;
        }
        let failed = !step.errignore;
        if failed && self.stage.status == Status::Running {
            self.stage.status = Status::Failing;
        }
    }

    pub fn skip(&mut self, name: &str) {
        if let Some(step) = self.find_mut(name) {
            if step.status == Status::Pending {
                step.status = Status::Skipped;
                step.started = now();
                step.stopped = step.started;
            }
        }
    }

    /// Skip every step that has not started
    pub fn skip_all(&mut self) {
        let stamp = now();
        for step in self.stage.steps.iter_mut().filter(|s| s.status == Status::Pending) {
            step.status = Status::Skipped;
            step.started = stamp;
            step.stopped = stamp;
        }
    }

    pub fn kill(&mut self, name: &str) {
        if let Some(step) = self.find_mut(name) {
            if step.status == Status::Running {
                step.status = Status::Killed;
                step.exit_code = EXIT_KILLED;
                step.stopped = now();
            }
        }
    }

    /// Running steps become killed, pending steps skipped, the stage killed
    pub fn cancel_all(&mut self) {
        let stamp = now();
        for step in &mut self.stage.steps {
            match step.status {
                Status::Running => {
                    step.status = Status::Killed;
                    step.exit_code = EXIT_KILLED;
                    step.stopped = stamp;
                }
                Status::Pending => {
                    step.status = Status::Skipped;
                    step.started = stamp;
                    step.stopped = stamp;
                }
                _ => {}
            }
        }
        self.stage.status = Status::Killed;
        self.stage.stopped = stamp;
    }

    /// Whole-stage failure before any step ran
    pub fn fail_all(&mut self, err: &ServiceError) {
        let stamp = now();
        let message = err.to_string();
        self.stage.status = Status::Error;
        self.stage.error = message.clone();
        if self.stage.started == 0 {
            self.stage.started = stamp;
        }
        self.stage.stopped = stamp;
        for step in self.stage.steps.iter_mut().filter(|s| !s.status.is_done()) {
            step.status = Status::Error;
            step.error = message.clone();
            step.exit_code = EXIT_ERROR;
            if step.started == 0 {
                step.started = stamp;
            }
            step.stopped = stamp;
        }
    }

    /// Close out the stage once the graph has drained
    pub fn finish_all(&mut self) {
        let stamp = now();
        for step in &mut self.stage.steps {
            match step.status {
                Status::Pending => {
                    step.status = Status::Skipped;
                    step.started = stamp;
                    step.stopped = stamp;
                }
                // detached services still running at teardown
                Status::Running => {
                    step.status = Status::Passing;
                    step.stopped = stamp;
                }
                _ => {}
            }
        }
        if !matches!(self.stage.status, Status::Killed | Status::Error) {
            self.stage.status = if self.failed() {
                Status::Failing
            } else {
                Status::Passing
            };
        }
        self.stage.stopped = stamp;
    }

    /// Whether any step has failed in a way that fails the stage
    pub fn failed(&self) -> bool {
        self.stage.status == Status::Failing
            || self
                .stage
                .steps
                .iter()
                .any(|s| s.status.is_failed() && !s.errignore)
    }

    pub fn cancelled(&self) -> bool {
        self.stage.status == Status::Killed
    }

    /// Names of the steps that failed so far
    pub fn failed_steps(&self) -> Vec<String> {
        self.stage
            .steps
            .iter()
            .filter(|s| matches!(s.status, Status::Failing | Status::Error))
            .map(|s| s.name.clone())
            .collect()
    }
}

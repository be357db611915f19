// Manifest Lint
// Rejects pipelines that are malformed or unsafe to run on the cluster

use crate::execution::graph::{GraphError, StepGraph};
use crate::ir::RESERVED_VOLUMES;
use crate::manifest::models::Pipeline;

use std::collections::HashSet;
use thiserror::Error;

/// Reasons a pipeline fails linting
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LintError {
    #[error("pipeline has no steps")]
    NoSteps,

    #[error("step or service is missing a name")]
    MissingName,

    #[error("duplicate step name '{0}'")]
    DuplicateName(String),

    #[error("step '{0}' is missing an image")]
    MissingImage(String),

    #[error("{0}")]
    Graph(String),

    #[error("volume name '{0}' is reserved")]
    ReservedVolume(String),

    #[error("step '{step}' mounts undeclared volume '{volume}'")]
    UnknownVolume { step: String, volume: String },

    #[error("volume '{0}' declares neither temp nor host")]
    InvalidVolume(String),

    #[error("untrusted repositories cannot mount host volumes")]
    UntrustedHostVolume,

    #[error("untrusted repositories cannot enable privileged mode (step '{0}')")]
    UntrustedPrivileged(String),

    #[error("untrusted repositories cannot configure dns or host aliases")]
    UntrustedNetworking,
}

impl From<GraphError> for LintError {
    fn from(err: GraphError) -> Self {
        Self::Graph(err.message)
    }
}

/// Lint a pipeline. `trusted` relaxes the checks reserved for trusted repositories.
pub fn lint(pipeline: &Pipeline, trusted: bool) -> Result<(), LintError> {
    if pipeline.steps.is_empty() {
        return Err(LintError::NoSteps);
    }

    let mut names = HashSet::new();
    for step in pipeline.all_steps() {
        if step.name.trim().is_empty() {
            return Err(LintError::MissingName);
        }
        if !names.insert(step.name.as_str()) {
            return Err(LintError::DuplicateName(step.name.clone()));
        }
        if step.image.trim().is_empty() {
            return Err(LintError::MissingImage(step.name.clone()));
        }
        if step.privileged && !trusted {
            return Err(LintError::UntrustedPrivileged(step.name.clone()));
        }
        for mount in &step.volumes {
            if RESERVED_VOLUMES.contains(&mount.name.as_str()) {
                return Err(LintError::ReservedVolume(mount.name.clone()));
            }
            if pipeline.volume(&mount.name).is_none() {
                return Err(LintError::UnknownVolume {
                    step: step.name.clone(),
                    volume: mount.name.clone(),
                });
            }
        }
    }

    for volume in &pipeline.volumes {
        if RESERVED_VOLUMES.contains(&volume.name.as_str()) {
            return Err(LintError::ReservedVolume(volume.name.clone()));
        }
        match (&volume.temp, &volume.host) {
            (None, None) => return Err(LintError::InvalidVolume(volume.name.clone())),
            (_, Some(_)) if !trusted => return Err(LintError::UntrustedHostVolume),
            _ => {}
        }
    }

    if !trusted && (pipeline.dns_config.is_some() || !pipeline.host_aliases.is_empty()) {
        return Err(LintError::UntrustedNetworking);
    }

    // The clone step is implicit, so a dependency on it always resolves.
    StepGraph::new(pipeline.all_steps().map(|s| {
        let deps: Vec<String> = s
            .depends_on
            .iter()
            .filter(|d| d.as_str() != crate::ir::CLONE_STEP)
            .cloned()
            .collect();
        (s.name.clone(), deps)
    }))?;

    Ok(())
}

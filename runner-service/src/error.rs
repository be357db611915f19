// Service Errors
// Error kinds shared by the compiler, engine, execer and runner

use crate::coordinator::ClientError;
use crate::engine::launcher::LaunchError;
use crate::engine::watcher::WatcherError;
use crate::engine::OrchestratorError;
use crate::execution::graph::GraphError;
use crate::manifest::{LintError, ManifestError};

use std::fmt;
use thiserror::Error;

/// Top-level error for stage execution
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Unparseable, lint-rejected or otherwise invalid pipeline
    #[error("config error: {0}")]
    Config(String),

    /// The stage was rejected by the runner's match limits
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The orchestrator refused namespace, secret or pod creation
    #[error("setup failed: {0}")]
    Setup(String),

    /// The launcher could not swap a container image
    #[error("launch failed: {0}")]
    Launch(LaunchError),

    /// Kubernetes-level container failure reported by the pod watcher
    #[error(transparent)]
    Watcher(WatcherError),

    /// The stage context was cancelled
    #[error("cancelled")]
    Cancelled,

    /// The stage exceeded the repository timeout
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A state update could not be delivered to the coordinator
    #[error("report failed: {0}")]
    Report(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("coordinator error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ServiceError {
    /// Whether the error is a cooperative cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl From<LaunchError> for ServiceError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::Cancelled => Self::Cancelled,
            other => Self::Launch(other),
        }
    }
}

impl From<WatcherError> for ServiceError {
    fn from(err: WatcherError) -> Self {
        match err {
            WatcherError::Cancelled => Self::Cancelled,
            other => Self::Watcher(other),
        }
    }
}

impl From<ManifestError> for ServiceError {
    fn from(err: ManifestError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<LintError> for ServiceError {
    fn from(err: LintError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<GraphError> for ServiceError {
    fn from(err: GraphError) -> Self {
        Self::Config(err.to_string())
    }
}

/// A collection of errors gathered while a stage ran to completion
#[derive(Debug, Default)]
pub struct MultiError {
    pub errors: Vec<ServiceError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl Into<ServiceError>) {
        self.errors.push(err.into());
    }

    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing was collected
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred: ", n)?;
                for (i, err) in self.errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl From<ServiceError> for MultiError {
    fn from(err: ServiceError) -> Self {
        Self { errors: vec![err] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_display() {
        let mut errors = MultiError::new();
        assert!(errors.is_empty());
        assert_eq!(errors.to_string(), "no errors");

        errors.push(ServiceError::Report("stage update".to_string()));
        assert_eq!(errors.to_string(), "report failed: stage update");

        errors.push(ServiceError::Cancelled);
        assert_eq!(
            errors.to_string(),
            "2 errors occurred: report failed: stage update; cancelled"
        );
        assert!(errors.into_result().is_err());
    }

    #[test]
    fn test_cancel_conversions() {
        assert!(ServiceError::from(WatcherError::Cancelled).is_cancelled());
        assert!(ServiceError::from(LaunchError::Cancelled).is_cancelled());
        assert!(ServiceError::DeadlineExceeded.is_cancelled());
        assert!(!ServiceError::Report("stage update".to_string()).is_cancelled());
    }
}

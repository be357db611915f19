// Coordinator Module
// Data model and client capability for the server that dispatches stages

pub mod http;
pub mod livelog;
pub mod models;

pub use http::HttpClient;
pub use livelog::LiveLog;
pub use models::{Context, Filter, Line, Stage, Status, Step};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Another runner accepted the stage first
    #[error("optimistic lock error")]
    OptimisticLock,

    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    /// Transport failures and server errors are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// RPC surface of the coordination server
#[async_trait]
pub trait Client: Send + Sync {
    async fn ping(&self) -> Result<(), ClientError>;

    /// Long-poll for a stage matching `filter`; `None` when no work is queued
    async fn request(&self, filter: &Filter) -> Result<Option<Stage>, ClientError>;

    /// Claim the stage; the server fills in ids and version
    async fn accept(&self, stage: &mut Stage) -> Result<(), ClientError>;

    async fn detail(&self, stage: &Stage) -> Result<Context, ClientError>;

    /// Push the aggregate stage state, including every step
    async fn update(&self, stage: &mut Stage) -> Result<(), ClientError>;

    async fn update_step(&self, step: &mut Step) -> Result<(), ClientError>;

    /// Blocks until the build is cancelled (`true`) or the watch ends
    async fn watch(&self, build_id: i64) -> Result<bool, ClientError>;

    async fn batch(&self, step_id: i64, lines: &[Line]) -> Result<(), ClientError>;

    async fn upload(&self, step_id: i64, lines: &[Line]) -> Result<(), ClientError>;
}

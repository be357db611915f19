// Runner Service Library
// Stage execution engine for running pipeline stages as kubernetes pods

pub mod compiler;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod execution;
pub mod image;
pub mod ir;
pub mod manifest;
pub mod policy;
pub mod runner;

// Re-export commonly used types
pub use error::{MultiError, ServiceError};

// Re-export manifest types
pub use manifest::{lint, Manifest, ManifestError, Pipeline};

// Re-export compiler types
pub use compiler::{CompileArgs, Compiler, IdGenerator, RandomIds, SequentialIds};

// Re-export engine types
pub use engine::{Engine, KubeClient, KubernetesEngine, LogWriter, PodClient, StepOutcome};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, Execer, ProgressReceiver, ProgressReporter,
    ProgressSender, ProgressStreamer, RemoteReporter, RemoteStreamer, Reporter, State, Streamer,
};

// Re-export coordinator and runner types
pub use coordinator::{Client, ClientError, HttpClient};
pub use runner::{Limits, Poller, Runner};

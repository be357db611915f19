// Execution Module
// Step graph, stage state, DAG execer and the reporting and log plumbing around it

pub mod events;
pub mod execer;
pub mod graph;
pub mod replacer;
pub mod reporter;
pub mod state;
pub mod streamer;

// Re-export key types
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use execer::Execer;
pub use graph::{GraphError, StepGraph, StepNode};
pub use replacer::Replacer;
pub use reporter::{ProgressReporter, RemoteReporter, Reporter};
pub use state::{State, StateInner};
pub use streamer::{ProgressStreamer, RemoteStreamer, Streamer};

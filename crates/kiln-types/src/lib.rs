/// Shared types, traits, and errors for the kiln worker agent.
///
/// This crate is the foundation that all other kiln crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) that define the seams between the
///   executor, the backend clients, and the heartbeat loop
/// - **Job model** (`job`) — lifecycle states, registry entries, metrics
/// - **Worker model** (`worker`) — registration identity and commands
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`) for the agent configuration file
pub mod config;
pub mod errors;
pub mod job;
pub mod traits;
pub mod worker;

// Re-export commonly used types at the crate root for convenience.
pub use errors::KilnError;
pub use job::{
    Job, JobConfig, JobSnapshot, JobStatus, LogPage, TrainingMetrics, TrainingRequest,
};
pub use traits::{CommandSink, StatusReporter};
pub use worker::{current_platform, CommandKind, PendingCommand, WorkerIdentity};

/// Worker coordination types — registration identity and backend commands.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity established by a successful registration with the backend.
///
/// `heartbeat_interval` and `max_concurrency` carry the values negotiated
/// by the backend; they override the agent's local defaults. Write-once:
/// the coordination client stores this after the first successful
/// registration and never replaces it.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    /// Backend-assigned worker id.
    pub worker_id: String,
    pub hostname: String,
    /// One of `linux`, `darwin`, `windows`.
    pub platform: String,
    /// Agent version reported at registration.
    pub version: String,
    /// Declared training capabilities (e.g. `lora`, `qlora`).
    pub capabilities: Vec<String>,
    /// Backend-negotiated heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Backend-negotiated concurrency cap.
    pub max_concurrency: usize,
}

/// A command delivered through the heartbeat response.
///
/// Commands are applied best-effort and idempotently: a command for a job
/// that no longer exists, or one whose effect already holds, is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Backend-side command id, used only for logging.
    pub id: String,
    /// The job this command targets.
    pub job_id: String,
    pub command: CommandKind,
    /// Checkpoint to resume from; only meaningful for `resume`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checkpoint_path: Option<String>,
}

/// The three job controls the backend can request remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Pause,
    Resume,
    Cancel,
}

/// Platform string reported at registration.
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}

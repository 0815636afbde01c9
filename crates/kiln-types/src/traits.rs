/// Trait contracts between the kiln subsystems.
///
/// The executor reports through [`StatusReporter`] without knowing about
/// HTTP, and the heartbeat loop delivers commands through [`CommandSink`]
/// without knowing about the registry. Both traits live here so the crates
/// on either side can depend on them without depending on each other, and
/// so tests can substitute hand-rolled mocks.
use async_trait::async_trait;

use crate::errors::KilnError;
use crate::job::{JobStatus, TrainingMetrics};
use crate::worker::PendingCommand;

/// Outbound reporting boundary for job telemetry.
///
/// Implementations must never block the caller indefinitely: every method
/// is bounded by request timeouts and a finite retry budget. A returned
/// error means the report was dropped after exhausting retries — callers
/// log it and move on, local job state is never affected.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Push a metrics snapshot for a job.
    async fn report_metrics(
        &self,
        job_id: &str,
        job_token: &str,
        metrics: &TrainingMetrics,
    ) -> Result<(), KilnError>;

    /// Report a lifecycle transition, with failure detail for `failed`.
    async fn update_status(
        &self,
        job_id: &str,
        job_token: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), KilnError>;

    /// Ship a batch of log lines.
    async fn send_logs(
        &self,
        job_id: &str,
        job_token: &str,
        lines: &[String],
    ) -> Result<(), KilnError>;
}

/// Command target for the heartbeat loop.
///
/// Implemented by the job executor. `apply_command` is infallible by
/// contract: unknown jobs and already-satisfied commands are logged and
/// discarded so a stale command can never take down the heartbeat loop.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Apply one backend command (pause/resume/cancel) to its target job.
    async fn apply_command(&self, command: PendingCommand);

    /// Number of jobs currently occupying a slot (pending + running).
    fn active_jobs(&self) -> usize;
}

/// Backend HTTP boundary for the kiln worker agent.
///
/// - **Retry** (`retry`): shared bounded retry with exponential backoff and
///   jitter, used by both clients
/// - **Reporting** (`reporting`): per-job metrics, status, and log delivery
/// - **Coordination** (`coordination`): worker registration and the
///   heartbeat loop that delivers backend commands
pub mod coordination;
pub mod reporting;
pub mod retry;

pub use coordination::CoordinationClient;
pub use reporting::ReportingClient;
pub use retry::{retry_with_backoff, RetryPolicy};

//! Graceful trainer shutdown: SIGTERM, bounded grace, SIGKILL.
//!
//! tokio's `Child::kill` is SIGKILL-only, so the polite signal goes through
//! `libc` on Unix. On other platforms the grace period degrades to a plain
//! kill after the timeout.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// Ask the trainer to stop. The trainer contract is to checkpoint and exit
/// cleanly on SIGTERM.
pub(crate) fn send_sigterm(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Terminate the trainer: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns the exit status when one could be collected.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    send_sigterm(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::debug!("wait after SIGTERM failed: {e}");
            None
        }
        Err(_) => {
            tracing::warn!("trainer ignored SIGTERM for {}s, force killing", grace.as_secs());
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

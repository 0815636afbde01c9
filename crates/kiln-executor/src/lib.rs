/// Job execution for the kiln worker agent.
///
/// The [`executor::JobExecutor`] owns the job registry and the lifecycle
/// state machine; each running job gets a detached supervising task that
/// exclusively owns the trainer subprocess, scrapes its stdout event
/// stream, and drives the job to a terminal state.
pub mod executor;

mod process;
mod supervisor;

pub use executor::{ExecutorConfig, JobExecutor};

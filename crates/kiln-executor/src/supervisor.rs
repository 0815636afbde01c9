//! Per-job supervision task.
//!
//! One supervisor per running job, spawned by the executor. It exclusively
//! owns the trainer `Child`, reads the one-JSON-object-per-line event
//! stream from stdout, checks the cooperative pause/cancel flags on a poll
//! tick, enforces the stale-progress timeout, and performs the job's final
//! transition under a single registry lock acquisition so the flag check
//! and the decision cannot interleave with other registry writers.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::time::MissedTickBehavior;

use kiln_types::job::{JobStatus, TrainingMetrics};

use crate::executor::{ExecutorConfig, JobExecutor};
use crate::process;

/// Lines of stderr kept for failure detail.
const STDERR_TAIL_LINES: usize = 10;

/// One event from the trainer's stdout stream.
///
/// Unknown or malformed lines are treated as plain log output.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TrainerEvent {
    Progress {
        step: u64,
        total_steps: u64,
        #[serde(default)]
        epoch: u64,
        #[serde(default)]
        total_epochs: u64,
    },
    Metrics {
        step: u64,
        #[serde(default)]
        epoch: u64,
        loss: f64,
        #[serde(default)]
        learning_rate: Option<f64>,
        #[serde(default)]
        grad_norm: Option<f64>,
        #[serde(default)]
        samples_per_second: Option<f64>,
        #[serde(default)]
        eval_loss: Option<f64>,
    },
    Checkpoint {
        path: String,
    },
    Log {
        #[serde(default)]
        level: String,
        message: String,
    },
}

/// Outbound shipping cadence state.
struct ShipState {
    pending_lines: Vec<String>,
    last_log_ship: Instant,
    last_metrics_push: Option<Instant>,
}

/// Supervise one trainer subprocess until the job reaches a terminal or
/// paused state. Consumes the `Child` — nothing else may touch it.
pub(crate) async fn supervise(
    executor: Arc<JobExecutor>,
    job_id: String,
    job_token: String,
    mut child: Child,
) {
    let config = executor.config().clone();

    let Some(stdout) = child.stdout.take() else {
        // Spawn always pipes stdout; losing it means we cannot supervise.
        let _ = process::terminate(&mut child, config.kill_grace).await;
        finalize(
            &executor,
            &job_id,
            &job_token,
            &config,
            None,
            false,
            false,
            String::new(),
            &mut Vec::new(),
        );
        return;
    };

    let stderr_tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_task = child.stderr.take().map(|stderr| {
        let tail = Arc::clone(&stderr_tail);
        let executor = Arc::clone(&executor);
        let job_id = job_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                executor.append_log(&job_id, format!("stderr: {line}"));
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() >= STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        })
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_progress = Instant::now();
    let mut sigterm_sent: Option<Instant> = None;
    let mut force_killed = false;
    let mut stale = false;
    let mut ship = ShipState {
        pending_lines: Vec::new(),
        last_log_ship: Instant::now(),
        last_metrics_push: None,
    };

    let exit_status = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        handle_stdout_line(
                            &executor,
                            &job_id,
                            &job_token,
                            &config,
                            line,
                            &mut last_progress,
                            &mut ship,
                        );
                    }
                    Ok(None) | Err(_) => {
                        // Stream closed; keep polling the flags while the
                        // trainer finishes dying so cancel and pause stay
                        // responsive.
                        break wait_for_exit(
                            &executor,
                            &job_id,
                            &mut child,
                            &config,
                            sigterm_sent,
                            last_progress,
                            &mut stale,
                        )
                        .await;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Ok(Some(status)) = child.try_wait() {
                    break Some(status);
                }

                let Some((cancel_requested, pause_requested, status)) =
                    executor.flag_snapshot(&job_id)
                else {
                    // Job evaporated from the registry; stop the orphan.
                    tracing::warn!(job_id = %job_id, "job missing from registry, stopping trainer");
                    let _ = process::terminate(&mut child, config.kill_grace).await;
                    return;
                };

                if status.is_terminal() {
                    let _ = process::terminate(&mut child, config.kill_grace).await;
                    return;
                }

                if cancel_requested {
                    tracing::info!(job_id = %job_id, "cancel requested, stopping trainer");
                    break process::terminate(&mut child, config.kill_grace).await;
                }

                if pause_requested && sigterm_sent.is_none() {
                    tracing::info!(job_id = %job_id, "pause requested, signaling trainer to checkpoint");
                    process::send_sigterm(&child);
                    sigterm_sent = Some(Instant::now());
                }

                if let Some(sent) = sigterm_sent {
                    if !force_killed && sent.elapsed() >= config.kill_grace {
                        tracing::warn!(job_id = %job_id, "trainer ignored checkpoint signal, force killing");
                        let _ = child.start_kill();
                        force_killed = true;
                    }
                } else if last_progress.elapsed() >= config.stale_progress_timeout {
                    tracing::warn!(
                        job_id = %job_id,
                        timeout_secs = config.stale_progress_timeout.as_secs(),
                        "no training progress within timeout, killing trainer"
                    );
                    stale = true;
                    break process::terminate(&mut child, config.kill_grace).await;
                }

                maybe_ship_logs(&executor, &job_id, &job_token, &config, &mut ship);
            }
        }
    };

    // Let the stderr drain finish now that the process is gone.
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), task).await;
    }

    let stderr_text = {
        let tail = stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join(" | ")
    };

    finalize(
        &executor,
        &job_id,
        &job_token,
        &config,
        exit_status,
        force_killed,
        stale,
        stderr_text,
        &mut ship.pending_lines,
    );
}

/// Collect the exit status after stdout closed.
///
/// A trainer that closes its pipes but keeps running must stay controllable,
/// so this keeps the same per-tick flag discipline as the main loop: cancel
/// terminates immediately, pause signals once and force-kills after the
/// grace window, and the stale-progress bound still applies.
async fn wait_for_exit(
    executor: &Arc<JobExecutor>,
    job_id: &str,
    child: &mut Child,
    config: &ExecutorConfig,
    mut sigterm_sent: Option<Instant>,
    last_progress: Instant,
    stale: &mut bool,
) -> Option<ExitStatus> {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(job_id, "failed to poll trainer exit status: {e}");
                return None;
            }
        }

        let Some((cancel_requested, pause_requested, status)) = executor.flag_snapshot(job_id)
        else {
            return process::terminate(child, config.kill_grace).await;
        };

        if cancel_requested || status.is_terminal() {
            return process::terminate(child, config.kill_grace).await;
        }

        if pause_requested && sigterm_sent.is_none() {
            process::send_sigterm(child);
            sigterm_sent = Some(Instant::now());
        }

        if let Some(sent) = sigterm_sent {
            if sent.elapsed() >= config.kill_grace {
                let _ = child.start_kill();
            }
        } else if last_progress.elapsed() >= config.stale_progress_timeout {
            *stale = true;
            return process::terminate(child, config.kill_grace).await;
        }
    }
}

fn handle_stdout_line(
    executor: &Arc<JobExecutor>,
    job_id: &str,
    job_token: &str,
    config: &ExecutorConfig,
    line: String,
    last_progress: &mut Instant,
    ship: &mut ShipState,
) {
    executor.append_log(job_id, line.clone());
    ship.pending_lines.push(line.clone());
    maybe_ship_logs(executor, job_id, job_token, config, ship);

    let Ok(event) = serde_json::from_str::<TrainerEvent>(&line) else {
        return;
    };

    match event {
        TrainerEvent::Progress {
            step,
            total_steps,
            epoch,
            total_epochs,
        } => {
            *last_progress = Instant::now();
            executor.update_progress(job_id, step, total_steps, epoch, total_epochs);
        }
        TrainerEvent::Metrics {
            step,
            epoch,
            loss,
            learning_rate,
            grad_norm,
            samples_per_second,
            eval_loss,
        } => {
            *last_progress = Instant::now();
            let gpu = executor.gpu_sample();
            let metrics = TrainingMetrics {
                step,
                epoch,
                loss,
                learning_rate,
                grad_norm,
                samples_per_second,
                eval_loss,
                gpu_memory_allocated_gb: Some(gpu.memory_allocated_gb),
                gpu_memory_reserved_gb: Some(gpu.memory_reserved_gb),
                gpu_utilization_percent: Some(gpu.utilization_percent),
                timestamp: Utc::now(),
            };
            executor.store_metrics(job_id, metrics.clone());

            let due = ship
                .last_metrics_push
                .map_or(true, |t| t.elapsed() >= config.metrics_report_interval);
            if due {
                ship.last_metrics_push = Some(Instant::now());
                executor.push_metrics(job_id, job_token, metrics);
            }
        }
        TrainerEvent::Checkpoint { path } => {
            tracing::debug!(job_id, checkpoint = %path, "checkpoint recorded");
            executor.set_checkpoint(job_id, path);
        }
        TrainerEvent::Log { level, message } => {
            tracing::trace!(job_id, trainer_level = %level, "{message}");
        }
    }
}

/// Ship buffered log lines when the batch is full or the interval elapsed.
fn maybe_ship_logs(
    executor: &Arc<JobExecutor>,
    job_id: &str,
    job_token: &str,
    config: &ExecutorConfig,
    ship: &mut ShipState,
) {
    if ship.pending_lines.is_empty() {
        return;
    }
    let full = ship.pending_lines.len() >= config.log_batch_max_lines;
    let due = ship.last_log_ship.elapsed() >= config.log_batch_interval;
    if full || due {
        executor.push_logs(job_id, job_token, std::mem::take(&mut ship.pending_lines));
        ship.last_log_ship = Instant::now();
    }
}

/// Decide and apply the final transition under one registry lock.
///
/// Priority: cancel beats everything, staleness beats pause, pause beats the
/// natural exit reading. A job some other path already finalized is left
/// alone.
#[allow(clippy::too_many_arguments)]
fn finalize(
    executor: &Arc<JobExecutor>,
    job_id: &str,
    job_token: &str,
    config: &ExecutorConfig,
    exit_status: Option<ExitStatus>,
    force_killed: bool,
    stale: bool,
    stderr_text: String,
    pending_lines: &mut Vec<String>,
) {
    let exit_ok = exit_status.map(|s| s.success()).unwrap_or(false);
    let exit_desc = match exit_status {
        Some(status) => match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        },
        None => "unknown exit status".to_string(),
    };

    let decision = executor
        .with_job(job_id, |job| {
            if job.status.is_terminal() {
                return None;
            }
            let (next, error) = if job.cancel_requested {
                (JobStatus::Cancelled, None)
            } else if stale {
                (
                    JobStatus::Failed,
                    Some(format!(
                        "no progress for {}s, trainer killed (stale-progress timeout)",
                        config.stale_progress_timeout.as_secs()
                    )),
                )
            } else if job.pause_requested {
                if exit_ok && !force_killed {
                    (JobStatus::Paused, None)
                } else {
                    (
                        JobStatus::Failed,
                        Some(format!(
                            "trainer did not checkpoint cleanly during pause ({exit_desc})"
                        )),
                    )
                }
            } else if exit_ok {
                (JobStatus::Completed, None)
            } else {
                let detail = if stderr_text.is_empty() {
                    format!("trainer failed ({exit_desc})")
                } else {
                    format!("trainer failed ({exit_desc}): {stderr_text}")
                };
                (JobStatus::Failed, Some(detail))
            };

            job.status = next;
            job.error = error.clone();
            job.pause_requested = false;
            job.cancel_requested = false;
            if next.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            Some((next, error))
        })
        .flatten();

    let Some((status, error)) = decision else {
        return;
    };

    tracing::info!(job_id, status = %status, "supervision finished");

    if !pending_lines.is_empty() {
        executor.push_logs(job_id, job_token, std::mem::take(pending_lines));
    }
    if status == JobStatus::Cancelled {
        executor.clear_gpu_cache();
    }
    executor.push_status(job_id, job_token, status, error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_parses() {
        let event: TrainerEvent = serde_json::from_str(
            r#"{"event":"progress","step":50,"total_steps":1000,"epoch":1,"total_epochs":3}"#,
        )
        .unwrap();
        match event {
            TrainerEvent::Progress {
                step, total_steps, ..
            } => {
                assert_eq!(step, 50);
                assert_eq!(total_steps, 1000);
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn test_metrics_event_optional_fields_default() {
        let event: TrainerEvent =
            serde_json::from_str(r#"{"event":"metrics","step":10,"loss":0.73}"#).unwrap();
        match event {
            TrainerEvent::Metrics {
                step,
                epoch,
                loss,
                learning_rate,
                ..
            } => {
                assert_eq!(step, 10);
                assert_eq!(epoch, 0);
                assert!((loss - 0.73).abs() < 1e-9);
                assert!(learning_rate.is_none());
            }
            other => panic!("expected metrics, got {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_event_parses() {
        let event: TrainerEvent =
            serde_json::from_str(r#"{"event":"checkpoint","path":"/ckpt/step-500"}"#).unwrap();
        match event {
            TrainerEvent::Checkpoint { path } => assert_eq!(path, "/ckpt/step-500"),
            other => panic!("expected checkpoint, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_is_not_an_event() {
        assert!(serde_json::from_str::<TrainerEvent>("epoch 1/3 starting").is_err());
        assert!(serde_json::from_str::<TrainerEvent>(r#"{"event":"reboot"}"#).is_err());
    }
}

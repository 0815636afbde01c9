//! Job executor — registry, lifecycle state machine, and trainer launch.
//!
//! The executor is built explicitly from its dependencies (reporter, GPU
//! monitor, config) and shared as an `Arc`. The registry holds job
//! metadata only; each trainer `Child` is owned by its supervising task.
//! The registry mutex is held for map operations only, never across an
//! await point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use kiln_monitor::{GpuMonitor, GpuSample};
use kiln_types::config::AgentConfig;
use kiln_types::errors::KilnError;
use kiln_types::job::{Job, JobSnapshot, JobStatus, LogPage, TrainingMetrics, TrainingRequest};
use kiln_types::traits::{CommandSink, StatusReporter};
use kiln_types::worker::{CommandKind, PendingCommand};

use crate::supervisor;

/// Executor tuning, derived from the agent config.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Local concurrency cap; the effective cap is the minimum of this and
    /// the backend-negotiated value.
    pub max_concurrent_jobs: usize,
    pub stale_progress_timeout: Duration,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    pub metrics_report_interval: Duration,
    pub log_batch_interval: Duration,
    pub log_batch_max_lines: usize,
    pub trainer_program: String,
    pub trainer_args: Vec<String>,
    pub checkpoint_dir: PathBuf,
    pub gpu_device_index: u32,
    pub gpu_memory_fraction: f64,
    pub mixed_precision: bool,
}

impl ExecutorConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self {
            max_concurrent_jobs: config.worker.max_concurrent_jobs,
            stale_progress_timeout: Duration::from_secs(
                config.supervision.stale_progress_timeout_secs,
            ),
            kill_grace: Duration::from_secs(config.supervision.kill_grace_secs),
            poll_interval: Duration::from_millis(config.supervision.poll_interval_ms),
            metrics_report_interval: Duration::from_secs(
                config.supervision.metrics_report_interval_secs,
            ),
            log_batch_interval: Duration::from_secs(config.supervision.log_batch_interval_secs),
            log_batch_max_lines: config.supervision.log_batch_max_lines,
            trainer_program: config.training.trainer_program.clone(),
            trainer_args: config.training.trainer_args.clone(),
            checkpoint_dir: config.paths.checkpoint_dir.clone(),
            gpu_device_index: config.training.gpu_device_index,
            gpu_memory_fraction: config.training.gpu_memory_fraction,
            mixed_precision: config.training.mixed_precision,
        }
    }
}

/// Owns the job registry and drives the lifecycle state machine.
pub struct JobExecutor {
    registry: Mutex<HashMap<String, Job>>,
    reporter: Arc<dyn StatusReporter>,
    gpu: Arc<GpuMonitor>,
    config: ExecutorConfig,
    /// Backend-negotiated cap; `usize::MAX` until registration applies one.
    negotiated_cap: AtomicUsize,
    /// Self-handle so `&self` methods can hand an `Arc` to spawned
    /// supervisors.
    handle: Weak<JobExecutor>,
}

impl JobExecutor {
    /// Build an executor from its dependencies.
    pub fn new(
        reporter: Arc<dyn StatusReporter>,
        gpu: Arc<GpuMonitor>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: Mutex::new(HashMap::new()),
            reporter,
            gpu,
            config,
            negotiated_cap: AtomicUsize::new(usize::MAX),
            handle: weak.clone(),
        })
    }

    /// Apply the backend-negotiated concurrency cap after registration.
    pub fn set_negotiated_concurrency(&self, cap: usize) {
        self.negotiated_cap.store(cap.max(1), Ordering::SeqCst);
        tracing::info!(
            local = self.config.max_concurrent_jobs,
            negotiated = cap,
            effective = self.effective_cap(),
            "concurrency cap updated"
        );
    }

    /// The cap actually enforced: min(local, negotiated).
    pub fn effective_cap(&self) -> usize {
        self.config
            .max_concurrent_jobs
            .min(self.negotiated_cap.load(Ordering::SeqCst))
    }

    /// Accept a job: capacity check, register as pending, spawn the
    /// trainer, transition to running, detach a supervisor.
    ///
    /// Fails with `Capacity` (registry untouched) when pending + running
    /// jobs are at the effective cap, or `Spawn` (job left `failed`) when
    /// the trainer cannot be started.
    pub async fn start_training(&self, request: TrainingRequest) -> Result<String, KilnError> {
        let job = Job::new(request)?;
        let job_id = job.job_id.clone();

        {
            let mut registry = self.registry();
            if registry.contains_key(&job_id) {
                return Err(KilnError::InvalidTransition(format!(
                    "job '{job_id}' already exists"
                )));
            }
            let active = count_active(&registry);
            let cap = self.effective_cap();
            if active >= cap {
                return Err(KilnError::Capacity(format!(
                    "{active} jobs active, cap is {cap}"
                )));
            }
            tracing::info!(job_id = %job_id, model = %job.config.model, "job accepted");
            registry.insert(job_id.clone(), job);
        }

        self.launch(&job_id, None).await?;
        Ok(job_id)
    }

    /// Request a cooperative pause.
    ///
    /// Sets the pause flag for the supervisor to act on; the transition to
    /// `paused` happens only after the trainer has checkpointed and exited.
    /// Pausing an already-paused job is a no-op.
    pub fn pause_training(&self, job_id: &str) -> Result<(), KilnError> {
        let mut registry = self.registry();
        let job = registry
            .get_mut(job_id)
            .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Running => {
                job.pause_requested = true;
                tracing::info!(job_id, "pause requested");
                Ok(())
            }
            JobStatus::Paused => Ok(()),
            other => Err(KilnError::InvalidTransition(format!(
                "cannot pause job '{job_id}' in state '{other}'"
            ))),
        }
    }

    /// Resume a paused job, re-spawning the trainer from a checkpoint.
    ///
    /// `checkpoint_override` wins over the job's recorded checkpoint.
    /// Resuming a running job is a no-op.
    pub async fn resume_training(
        &self,
        job_id: &str,
        checkpoint_override: Option<String>,
    ) -> Result<(), KilnError> {
        let resume_from = {
            let mut registry = self.registry();
            let cap = self.effective_cap();
            let active = count_active(&registry);
            let job = registry
                .get_mut(job_id)
                .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))?;
            match job.status {
                JobStatus::Running => return Ok(()),
                JobStatus::Paused => {
                    if active >= cap {
                        return Err(KilnError::Capacity(format!(
                            "{active} jobs active, cap is {cap}"
                        )));
                    }
                    // Claim the slot under the lock so a concurrent resume
                    // sees `running` and no-ops.
                    job.status = JobStatus::Running;
                    checkpoint_override.or_else(|| job.checkpoint_path.clone())
                }
                other => {
                    return Err(KilnError::InvalidTransition(format!(
                        "cannot resume job '{job_id}' in state '{other}'"
                    )))
                }
            }
        };

        tracing::info!(job_id, checkpoint = ?resume_from, "resuming job");
        self.launch(job_id, resume_from).await
    }

    /// Cancel a job.
    ///
    /// Running jobs are flagged and stopped by their supervisor (SIGTERM,
    /// grace, SIGKILL); pending and paused jobs have no process and are
    /// cancelled directly. A cancelled job stays cancelled; cancelling a
    /// completed or failed job is an invalid transition.
    pub fn cancel_training(&self, job_id: &str) -> Result<(), KilnError> {
        let direct = {
            let mut registry = self.registry();
            let job = registry
                .get_mut(job_id)
                .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))?;
            match job.status {
                JobStatus::Running => {
                    job.cancel_requested = true;
                    tracing::info!(job_id, "cancel requested");
                    None
                }
                JobStatus::Pending | JobStatus::Paused => {
                    job.status = JobStatus::Cancelled;
                    job.pause_requested = false;
                    job.cancel_requested = false;
                    job.completed_at = Some(Utc::now());
                    tracing::info!(job_id, "job cancelled");
                    Some(job.job_token.clone())
                }
                JobStatus::Cancelled => None,
                other => {
                    return Err(KilnError::InvalidTransition(format!(
                        "cannot cancel job '{job_id}' in state '{other}'"
                    )))
                }
            }
        };

        if let Some(job_token) = direct {
            self.gpu.clear_cache();
            self.push_status(job_id, &job_token, JobStatus::Cancelled, None);
        }
        Ok(())
    }

    /// Snapshot a job's state.
    pub fn get_job_status(&self, job_id: &str) -> Result<JobSnapshot, KilnError> {
        let registry = self.registry();
        registry
            .get(job_id)
            .map(Job::snapshot)
            .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))
    }

    /// Page through a job's buffered logs.
    pub fn get_job_logs(
        &self,
        job_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<LogPage, KilnError> {
        let registry = self.registry();
        registry
            .get(job_id)
            .map(|job| job.log_page(offset, limit))
            .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))
    }

    /// Snapshots of all known jobs, newest first.
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        let registry = self.registry();
        let mut jobs: Vec<JobSnapshot> = registry.values().map(Job::snapshot).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    // -- internals shared with the supervisor --

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub(crate) fn gpu_sample(&self) -> GpuSample {
        self.gpu.sample()
    }

    pub(crate) fn clear_gpu_cache(&self) {
        self.gpu.clear_cache();
    }

    /// Run `f` on a job under the registry lock. `None` if the job is gone.
    pub(crate) fn with_job<R>(&self, job_id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut registry = self.registry();
        registry.get_mut(job_id).map(f)
    }

    /// Read both cooperative flags and the status in one lock acquisition.
    pub(crate) fn flag_snapshot(&self, job_id: &str) -> Option<(bool, bool, JobStatus)> {
        let registry = self.registry();
        registry
            .get(job_id)
            .map(|job| (job.cancel_requested, job.pause_requested, job.status))
    }

    pub(crate) fn append_log(&self, job_id: &str, line: String) {
        let mut registry = self.registry();
        if let Some(job) = registry.get_mut(job_id) {
            job.push_log(line);
        }
    }

    /// Advance the progress counters. Counters are monotonically
    /// non-decreasing while running, so a trainer emitting a lower value
    /// (replayed line, restart mid-stream) never winds them back.
    pub(crate) fn update_progress(
        &self,
        job_id: &str,
        step: u64,
        total_steps: u64,
        epoch: u64,
        total_epochs: u64,
    ) {
        let mut registry = self.registry();
        if let Some(job) = registry.get_mut(job_id) {
            job.current_step = job.current_step.max(step);
            job.total_steps = job.total_steps.max(total_steps);
            job.current_epoch = job.current_epoch.max(epoch);
            job.total_epochs = job.total_epochs.max(total_epochs);
        }
    }

    pub(crate) fn store_metrics(&self, job_id: &str, metrics: TrainingMetrics) {
        let mut registry = self.registry();
        if let Some(job) = registry.get_mut(job_id) {
            job.current_step = job.current_step.max(metrics.step);
            job.latest_metrics = Some(metrics);
        }
    }

    pub(crate) fn set_checkpoint(&self, job_id: &str, path: String) {
        let mut registry = self.registry();
        if let Some(job) = registry.get_mut(job_id) {
            job.checkpoint_path = Some(path);
        }
    }

    /// Fire-and-forget status push. A failed push is logged and dropped —
    /// the local state machine is the source of truth.
    pub(crate) fn push_status(
        &self,
        job_id: &str,
        job_token: &str,
        status: JobStatus,
        error: Option<String>,
    ) {
        let reporter = Arc::clone(&self.reporter);
        let job_id = job_id.to_string();
        let job_token = job_token.to_string();
        tokio::spawn(async move {
            if let Err(e) = reporter
                .update_status(&job_id, &job_token, status, error.as_deref())
                .await
            {
                tracing::warn!(job_id = %job_id, status = %status, "status push failed: {e}");
            }
        });
    }

    /// Fire-and-forget metrics push.
    pub(crate) fn push_metrics(&self, job_id: &str, job_token: &str, metrics: TrainingMetrics) {
        let reporter = Arc::clone(&self.reporter);
        let job_id = job_id.to_string();
        let job_token = job_token.to_string();
        tokio::spawn(async move {
            if let Err(e) = reporter.report_metrics(&job_id, &job_token, &metrics).await {
                tracing::warn!(job_id = %job_id, "metrics push failed: {e}");
            }
        });
    }

    /// Fire-and-forget log batch push.
    pub(crate) fn push_logs(&self, job_id: &str, job_token: &str, lines: Vec<String>) {
        let reporter = Arc::clone(&self.reporter);
        let job_id = job_id.to_string();
        let job_token = job_token.to_string();
        tokio::spawn(async move {
            if let Err(e) = reporter.send_logs(&job_id, &job_token, &lines).await {
                tracing::warn!(job_id = %job_id, "log push failed: {e}");
            }
        });
    }

    /// Spawn the trainer and hand it to a fresh supervisor.
    ///
    /// On spawn failure the job is marked failed with the spawn error.
    async fn launch(&self, job_id: &str, resume_from: Option<String>) -> Result<(), KilnError> {
        let (config_json, job_token, user_id) = {
            let registry = self.registry();
            let job = registry
                .get(job_id)
                .ok_or_else(|| KilnError::JobNotFound(job_id.to_string()))?;
            (
                serde_json::to_string(job.config.as_value())?,
                job.job_token.clone(),
                job.user_id.clone(),
            )
        };

        match self
            .spawn_trainer(job_id, &user_id, &config_json, resume_from.as_deref())
            .await
        {
            Ok(child) => {
                {
                    let mut registry = self.registry();
                    if let Some(job) = registry.get_mut(job_id) {
                        job.status = JobStatus::Running;
                        job.started_at = Some(Utc::now());
                        job.pause_requested = false;
                        job.cancel_requested = false;
                        job.error = None;
                    }
                }
                tracing::info!(job_id, resumed = resume_from.is_some(), "trainer started");
                self.push_status(job_id, &job_token, JobStatus::Running, None);

                let executor = self
                    .handle
                    .upgrade()
                    .ok_or_else(|| KilnError::Internal("executor dropped".to_string()))?;
                tokio::spawn(supervisor::supervise(
                    executor,
                    job_id.to_string(),
                    job_token,
                    child,
                ));
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                {
                    let mut registry = self.registry();
                    if let Some(job) = registry.get_mut(job_id) {
                        job.status = JobStatus::Failed;
                        job.error = Some(detail.clone());
                        job.completed_at = Some(Utc::now());
                    }
                }
                tracing::error!(job_id, "trainer spawn failed: {detail}");
                self.push_status(job_id, &job_token, JobStatus::Failed, Some(detail));
                Err(e)
            }
        }
    }

    async fn spawn_trainer(
        &self,
        job_id: &str,
        user_id: &str,
        config_json: &str,
        resume_from: Option<&str>,
    ) -> Result<Child, KilnError> {
        let mut command = Command::new(&self.config.trainer_program);
        command
            .args(&self.config.trainer_args)
            .env("KILN_JOB_ID", job_id)
            .env("KILN_USER_ID", user_id)
            .env("KILN_CHECKPOINT_DIR", &self.config.checkpoint_dir)
            .env(
                "KILN_GPU_MEMORY_FRACTION",
                self.config.gpu_memory_fraction.to_string(),
            )
            .env(
                "KILN_MIXED_PRECISION",
                if self.config.mixed_precision { "1" } else { "0" },
            )
            .env(
                "CUDA_VISIBLE_DEVICES",
                self.config.gpu_device_index.to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = resume_from {
            command.arg("--resume-from").arg(path);
        }

        let mut child = command.spawn().map_err(|e| {
            KilnError::Spawn(format!(
                "failed to spawn '{}': {e}",
                self.config.trainer_program
            ))
        })?;

        // The trainer reads its config from stdin. A trainer that exits
        // before reading shows up as a broken pipe here and as an exit
        // status at the supervisor; only the latter is a failure.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = format!("{config_json}\n");
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::debug!(job_id, "trainer did not accept config on stdin: {e}");
            }
        }

        Ok(child)
    }
}

fn count_active(registry: &HashMap<String, Job>) -> usize {
    registry
        .values()
        .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Running))
        .count()
}

#[async_trait]
impl CommandSink for JobExecutor {
    async fn apply_command(&self, command: PendingCommand) {
        let result = match command.command {
            CommandKind::Pause => self.pause_training(&command.job_id),
            CommandKind::Resume => {
                self.resume_training(&command.job_id, command.checkpoint_path.clone())
                    .await
            }
            CommandKind::Cancel => self.cancel_training(&command.job_id),
        };
        match result {
            Ok(()) => {}
            Err(KilnError::JobNotFound(id)) => {
                tracing::warn!(command_id = %command.id, "command for unknown job '{id}' discarded");
            }
            Err(KilnError::InvalidTransition(msg)) => {
                tracing::debug!(command_id = %command.id, "command not applicable: {msg}");
            }
            Err(e) => {
                tracing::warn!(command_id = %command.id, "command failed: {e}");
            }
        }
    }

    fn active_jobs(&self) -> usize {
        count_active(&self.registry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    const COMPLETE_SCRIPT: &str = r#"
echo '{"event":"progress","step":1,"total_steps":10,"epoch":1,"total_epochs":1}'
exit 0
"#;

    const LONG_SCRIPT: &str = r#"
trap 'exit 0' TERM
echo '{"event":"progress","step":1,"total_steps":100}'
while :; do sleep 0.05; done
"#;

    const PAUSE_RESUME_SCRIPT: &str = r#"
if [ $# -gt 0 ]; then
  [ "$1" = "/ckpt/step-5" ] && exit 0
  exit 1
fi
trap "echo '{\"event\":\"checkpoint\",\"path\":\"/ckpt/step-5\"}'; exit 0" TERM
echo '{"event":"progress","step":5,"total_steps":10,"epoch":1,"total_epochs":2}'
while :; do sleep 0.05; done
"#;

    const STUBBORN_SCRIPT: &str = r#"
trap '' TERM
while :; do sleep 0.05; done
"#;

    const SILENT_SCRIPT: &str = r#"
while :; do sleep 0.05; done
"#;

    const METRICS_SCRIPT: &str = r#"
echo '{"event":"metrics","step":10,"epoch":1,"loss":0.5,"learning_rate":0.0002}'
echo '{"event":"checkpoint","path":"/ckpt/step-10"}'
sleep 0.2
exit 0
"#;

    const FAIL_SCRIPT: &str = r#"
echo "cuda out of memory" >&2
exit 3
"#;

    const DETACHED_SCRIPT: &str = r#"
exec 1>&- 2>&-
trap 'exit 0' TERM
while :; do sleep 0.05; done
"#;

    const ENV_SCRIPT: &str = r#"
echo "trainer env $KILN_JOB_ID $KILN_USER_ID"
exit 0
"#;

    const OUT_OF_ORDER_SCRIPT: &str = r#"
echo '{"event":"progress","step":7,"total_steps":10,"epoch":2,"total_epochs":3}'
echo '{"event":"progress","step":3,"total_steps":10,"epoch":1,"total_epochs":3}'
exit 0
"#;

    #[derive(Default)]
    struct MockReporter {
        statuses: Mutex<Vec<(String, JobStatus, Option<String>)>>,
        metrics: Mutex<Vec<(String, TrainingMetrics)>>,
        logs: Mutex<Vec<(String, Vec<String>)>>,
        fail: AtomicBool,
    }

    impl MockReporter {
        fn statuses_for(&self, job_id: &str) -> Vec<JobStatus> {
            self.statuses
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _, _)| id == job_id)
                .map(|(_, status, _)| *status)
                .collect()
        }
    }

    #[async_trait]
    impl StatusReporter for MockReporter {
        async fn report_metrics(
            &self,
            job_id: &str,
            _job_token: &str,
            metrics: &TrainingMetrics,
        ) -> Result<(), KilnError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KilnError::Backend("unreachable".to_string()));
            }
            self.metrics
                .lock()
                .unwrap()
                .push((job_id.to_string(), metrics.clone()));
            Ok(())
        }

        async fn update_status(
            &self,
            job_id: &str,
            _job_token: &str,
            status: JobStatus,
            error: Option<&str>,
        ) -> Result<(), KilnError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KilnError::Backend("unreachable".to_string()));
            }
            self.statuses.lock().unwrap().push((
                job_id.to_string(),
                status,
                error.map(str::to_string),
            ));
            Ok(())
        }

        async fn send_logs(
            &self,
            job_id: &str,
            _job_token: &str,
            lines: &[String],
        ) -> Result<(), KilnError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KilnError::Backend("unreachable".to_string()));
            }
            self.logs
                .lock()
                .unwrap()
                .push((job_id.to_string(), lines.to_vec()));
            Ok(())
        }
    }

    fn test_config(script: &str, cap: usize) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_jobs: cap,
            stale_progress_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(25),
            metrics_report_interval: Duration::from_millis(10),
            log_batch_interval: Duration::from_millis(50),
            log_batch_max_lines: 100,
            trainer_program: "/bin/sh".to_string(),
            trainer_args: vec!["-c".to_string(), script.to_string()],
            checkpoint_dir: std::env::temp_dir(),
            gpu_device_index: 0,
            gpu_memory_fraction: 0.9,
            mixed_precision: true,
        }
    }

    fn test_executor(script: &str, cap: usize) -> (Arc<JobExecutor>, Arc<MockReporter>) {
        let reporter = Arc::new(MockReporter::default());
        let executor = JobExecutor::new(
            Arc::clone(&reporter) as Arc<dyn StatusReporter>,
            Arc::new(GpuMonitor::new(0)),
            test_config(script, cap),
        );
        (executor, reporter)
    }

    fn request(tag: &str) -> TrainingRequest {
        TrainingRequest {
            config: serde_json::json!({
                "model": "meta-llama/Llama-3.1-8B",
                "dataset_path": "/data/train.jsonl"
            }),
            execution_id: Some(format!("job-{tag}")),
            user_id: "user-1".to_string(),
            name: format!("run-{tag}"),
            job_token: format!("tok-{tag}"),
            dataset_path: None,
        }
    }

    async fn wait_for_status(executor: &Arc<JobExecutor>, job_id: &str, want: JobStatus) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = executor.get_job_status(job_id).unwrap().status;
            if status == want {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "job '{job_id}' stuck in '{status}', wanted '{want}'"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_job_completes_and_reports() {
        let (executor, reporter) = test_executor(COMPLETE_SCRIPT, 2);
        let job_id = executor.start_training(request("a")).await.unwrap();

        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        let snapshot = executor.get_job_status(&job_id).unwrap();
        assert_eq!(snapshot.current_step, 1);
        assert_eq!(snapshot.total_steps, 10);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.completed_at.is_some());
        assert!(snapshot.error.is_none());

        wait_until(
            || {
                let statuses = reporter.statuses_for(&job_id);
                statuses.contains(&JobStatus::Running) && statuses.contains(&JobStatus::Completed)
            },
            "running and completed status pushes",
        )
        .await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr_detail() {
        let (executor, _reporter) = test_executor(FAIL_SCRIPT, 2);
        let job_id = executor.start_training(request("b")).await.unwrap();

        wait_for_status(&executor, &job_id, JobStatus::Failed).await;

        let error = executor.get_job_status(&job_id).unwrap().error.unwrap();
        assert!(error.contains("exit code 3"), "unexpected: {error}");
        assert!(error.contains("cuda out of memory"), "unexpected: {error}");
    }

    #[tokio::test]
    async fn test_capacity_rejects_excess_jobs() {
        let (executor, _reporter) = test_executor(LONG_SCRIPT, 1);
        let first = executor.start_training(request("c1")).await.unwrap();
        wait_for_status(&executor, &first, JobStatus::Running).await;

        let err = executor.start_training(request("c2")).await.unwrap_err();
        match err {
            KilnError::Capacity(msg) => assert!(msg.contains("cap is 1"), "unexpected: {msg}"),
            other => panic!("expected Capacity error, got: {other:?}"),
        }
        // The running job is untouched and the rejected one never existed.
        assert_eq!(
            executor.get_job_status(&first).unwrap().status,
            JobStatus::Running
        );
        assert!(executor.get_job_status("job-c2").is_err());

        executor.cancel_training(&first).unwrap();
        wait_for_status(&executor, &first, JobStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn test_negotiated_cap_tightens_local_cap() {
        let (executor, _reporter) = test_executor(LONG_SCRIPT, 4);
        executor.set_negotiated_concurrency(1);
        assert_eq!(executor.effective_cap(), 1);

        let first = executor.start_training(request("d1")).await.unwrap();
        wait_for_status(&executor, &first, JobStatus::Running).await;
        assert!(matches!(
            executor.start_training(request("d2")).await,
            Err(KilnError::Capacity(_))
        ));

        executor.cancel_training(&first).unwrap();
        wait_for_status(&executor, &first, JobStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn test_pause_checkpoints_then_resume_forwards_checkpoint() {
        let (executor, _reporter) = test_executor(PAUSE_RESUME_SCRIPT, 2);
        let job_id = executor.start_training(request("e")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        // Let the trainer reach its loop before signaling.
        tokio::time::sleep(Duration::from_millis(150)).await;

        executor.pause_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Paused).await;

        let snapshot = executor.get_job_status(&job_id).unwrap();
        assert_eq!(snapshot.checkpoint_path.as_deref(), Some("/ckpt/step-5"));
        assert_eq!(snapshot.current_step, 5);

        // The trainer exits 0 only if it received --resume-from /ckpt/step-5.
        executor.resume_training(&job_id, None).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let (executor, _reporter) = test_executor(PAUSE_RESUME_SCRIPT, 2);
        let job_id = executor.start_training(request("f")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        executor.pause_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Paused).await;
        // Second pause on a paused job succeeds without side effects.
        executor.pause_training(&job_id).unwrap();
        assert_eq!(
            executor.get_job_status(&job_id).unwrap().status,
            JobStatus::Paused
        );

        executor.cancel_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn test_pause_invalid_from_terminal_and_unknown() {
        let (executor, _reporter) = test_executor(COMPLETE_SCRIPT, 2);
        let job_id = executor.start_training(request("g")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        assert!(matches!(
            executor.pause_training(&job_id),
            Err(KilnError::InvalidTransition(_))
        ));
        assert!(matches!(
            executor.pause_training("no-such-job"),
            Err(KilnError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let (executor, reporter) = test_executor(LONG_SCRIPT, 2);
        let job_id = executor.start_training(request("h")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        executor.cancel_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Cancelled).await;

        wait_until(
            || reporter.statuses_for(&job_id).contains(&JobStatus::Cancelled),
            "cancelled status push",
        )
        .await;
    }

    #[tokio::test]
    async fn test_cancel_force_kills_stubborn_trainer() {
        let mut config = test_config(STUBBORN_SCRIPT, 2);
        config.kill_grace = Duration::from_millis(150);
        let reporter = Arc::new(MockReporter::default());
        let executor = JobExecutor::new(
            Arc::clone(&reporter) as Arc<dyn StatusReporter>,
            Arc::new(GpuMonitor::new(0)),
            config,
        );

        let job_id = executor.start_training(request("i")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        executor.cancel_training(&job_id).unwrap();
        // Cancelled regardless of how the trainer died.
        wait_for_status(&executor, &job_id, JobStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn test_cancel_paused_job_is_direct() {
        let (executor, reporter) = test_executor(PAUSE_RESUME_SCRIPT, 2);
        let job_id = executor.start_training(request("j")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        executor.pause_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Paused).await;

        executor.cancel_training(&job_id).unwrap();
        // No subprocess to stop; the transition is immediate.
        assert_eq!(
            executor.get_job_status(&job_id).unwrap().status,
            JobStatus::Cancelled
        );
        wait_until(
            || reporter.statuses_for(&job_id).contains(&JobStatus::Cancelled),
            "cancelled status push",
        )
        .await;
    }

    #[tokio::test]
    async fn test_cancel_idempotent_but_invalid_after_completion() {
        let (executor, _reporter) = test_executor(COMPLETE_SCRIPT, 2);
        let job_id = executor.start_training(request("k")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        assert!(matches!(
            executor.cancel_training(&job_id),
            Err(KilnError::InvalidTransition(_))
        ));

        let (executor2, _reporter2) = test_executor(LONG_SCRIPT, 2);
        let job_id2 = executor2.start_training(request("k2")).await.unwrap();
        wait_for_status(&executor2, &job_id2, JobStatus::Running).await;
        executor2.cancel_training(&job_id2).unwrap();
        wait_for_status(&executor2, &job_id2, JobStatus::Cancelled).await;
        // Cancelling a cancelled job is a no-op.
        executor2.cancel_training(&job_id2).unwrap();
    }

    #[tokio::test]
    async fn test_stale_progress_kills_and_fails() {
        let mut config = test_config(SILENT_SCRIPT, 2);
        config.stale_progress_timeout = Duration::from_millis(250);
        config.kill_grace = Duration::from_millis(200);
        let reporter = Arc::new(MockReporter::default());
        let executor = JobExecutor::new(
            Arc::clone(&reporter) as Arc<dyn StatusReporter>,
            Arc::new(GpuMonitor::new(0)),
            config,
        );

        let job_id = executor.start_training(request("l")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Failed).await;

        let error = executor.get_job_status(&job_id).unwrap().error.unwrap();
        assert!(
            error.contains("stale-progress timeout"),
            "expected a timeout failure, got: {error}"
        );
    }

    #[tokio::test]
    async fn test_metrics_enriched_with_gpu_and_reported() {
        let (executor, reporter) = test_executor(METRICS_SCRIPT, 2);
        let job_id = executor.start_training(request("m")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        let snapshot = executor.get_job_status(&job_id).unwrap();
        let metrics = snapshot.latest_metrics.unwrap();
        assert_eq!(metrics.step, 10);
        assert!((metrics.loss - 0.5).abs() < 1e-9);
        // GPU fields are always present, zero-valued without a GPU.
        assert!(metrics.gpu_memory_allocated_gb.is_some());
        assert!(metrics.gpu_utilization_percent.is_some());
        assert_eq!(snapshot.checkpoint_path.as_deref(), Some("/ckpt/step-10"));

        wait_until(
            || !reporter.metrics.lock().unwrap().is_empty(),
            "a metrics push",
        )
        .await;
    }

    #[tokio::test]
    async fn test_logs_buffered_paginated_and_shipped() {
        let (executor, reporter) = test_executor(METRICS_SCRIPT, 2);
        let job_id = executor.start_training(request("n")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        let page = executor.get_job_logs(&job_id, 0, 10).unwrap();
        assert!(page.total >= 2);
        assert!(page.lines[0].contains("metrics"));

        let second = executor.get_job_logs(&job_id, 1, 1).unwrap();
        assert_eq!(second.lines.len(), 1);

        wait_until(
            || reporter.logs.lock().unwrap().iter().any(|(id, _)| id == &job_id),
            "a shipped log batch",
        )
        .await;
    }

    #[tokio::test]
    async fn test_apply_command_unknown_job_is_discarded() {
        let (executor, _reporter) = test_executor(COMPLETE_SCRIPT, 2);
        executor
            .apply_command(PendingCommand {
                id: "c-1".to_string(),
                job_id: "ghost".to_string(),
                command: CommandKind::Cancel,
                checkpoint_path: None,
            })
            .await;
        // Nothing to assert beyond not panicking and an empty registry.
        assert!(executor.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_apply_command_cancel_after_completion_is_noop() {
        let (executor, _reporter) = test_executor(COMPLETE_SCRIPT, 2);
        let job_id = executor.start_training(request("o")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        executor
            .apply_command(PendingCommand {
                id: "c-2".to_string(),
                job_id: job_id.clone(),
                command: CommandKind::Cancel,
                checkpoint_path: None,
            })
            .await;
        assert_eq!(
            executor.get_job_status(&job_id).unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_apply_command_pause_with_duplicate_delivery() {
        let (executor, _reporter) = test_executor(PAUSE_RESUME_SCRIPT, 2);
        let job_id = executor.start_training(request("p")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let command = PendingCommand {
            id: "c-3".to_string(),
            job_id: job_id.clone(),
            command: CommandKind::Pause,
            checkpoint_path: None,
        };
        executor.apply_command(command.clone()).await;
        executor.apply_command(command).await;

        wait_for_status(&executor, &job_id, JobStatus::Paused).await;
        executor.cancel_training(&job_id).unwrap();
    }

    #[tokio::test]
    async fn test_status_push_failure_does_not_affect_state() {
        let (executor, reporter) = test_executor(COMPLETE_SCRIPT, 2);
        reporter.fail.store(true, Ordering::SeqCst);

        let job_id = executor.start_training(request("q")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;
        assert!(reporter.statuses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_job_failed() {
        let mut config = test_config(COMPLETE_SCRIPT, 2);
        config.trainer_program = "/nonexistent/kiln-trainer".to_string();
        let reporter = Arc::new(MockReporter::default());
        let executor = JobExecutor::new(
            Arc::clone(&reporter) as Arc<dyn StatusReporter>,
            Arc::new(GpuMonitor::new(0)),
            config,
        );

        let err = executor.start_training(request("r")).await.unwrap_err();
        assert!(matches!(err, KilnError::Spawn(_)));

        let snapshot = executor.get_job_status("job-r").unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_resume_rules() {
        let (executor, _reporter) = test_executor(LONG_SCRIPT, 2);
        let job_id = executor.start_training(request("s")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;

        // Resume on a running job is an idempotent no-op.
        executor.resume_training(&job_id, None).await.unwrap();
        assert_eq!(executor.active_jobs(), 1);

        assert!(matches!(
            executor.resume_training("ghost", None).await,
            Err(KilnError::JobNotFound(_))
        ));

        executor.cancel_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Cancelled).await;
        assert!(matches!(
            executor.resume_training(&job_id, None).await,
            Err(KilnError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_job_config_is_rejected_up_front() {
        let (executor, _reporter) = test_executor(COMPLETE_SCRIPT, 2);
        let mut bad = request("t");
        bad.config = serde_json::json!({"dataset_path": "/d"});

        let err = executor.start_training(bad).await.unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
        assert!(executor.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_honored_after_trainer_closes_stdout() {
        let mut config = test_config(DETACHED_SCRIPT, 2);
        config.kill_grace = Duration::from_millis(200);
        let reporter = Arc::new(MockReporter::default());
        let executor = JobExecutor::new(
            Arc::clone(&reporter) as Arc<dyn StatusReporter>,
            Arc::new(GpuMonitor::new(0)),
            config,
        );

        let job_id = executor.start_training(request("w")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        // Give the trainer time to close its pipes while staying alive.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let requested = Instant::now();
        executor.cancel_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Cancelled).await;
        // Responsive within grace plus kill latency, not the stale timeout.
        assert!(
            requested.elapsed() < Duration::from_secs(2),
            "cancel took {:?}",
            requested.elapsed()
        );
    }

    #[tokio::test]
    async fn test_trainer_env_carries_job_and_user_ids() {
        let (executor, _reporter) = test_executor(ENV_SCRIPT, 2);
        let job_id = executor.start_training(request("x")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        let page = executor.get_job_logs(&job_id, 0, 10).unwrap();
        assert!(
            page.lines.iter().any(|l| l == "trainer env job-x user-1"),
            "unexpected logs: {:?}",
            page.lines
        );
    }

    #[tokio::test]
    async fn test_progress_counters_never_regress() {
        let (executor, _reporter) = test_executor(OUT_OF_ORDER_SCRIPT, 2);
        let job_id = executor.start_training(request("y")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Completed).await;

        let snapshot = executor.get_job_status(&job_id).unwrap();
        assert_eq!(snapshot.current_step, 7);
        assert_eq!(snapshot.current_epoch, 2);
        assert_eq!(snapshot.total_steps, 10);
    }

    #[tokio::test]
    async fn test_active_jobs_counts_pending_and_running_only() {
        let (executor, _reporter) = test_executor(PAUSE_RESUME_SCRIPT, 2);
        assert_eq!(executor.active_jobs(), 0);

        let job_id = executor.start_training(request("u")).await.unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Running).await;
        assert_eq!(executor.active_jobs(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;

        executor.pause_training(&job_id).unwrap();
        wait_for_status(&executor, &job_id, JobStatus::Paused).await;
        // A paused job holds no slot.
        assert_eq!(executor.active_jobs(), 0);

        executor.cancel_training(&job_id).unwrap();
    }
}

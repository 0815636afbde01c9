//! kiln-agent: registers with the backend, heartbeats, and runs fine-tuning
//! jobs as supervised trainer subprocesses.
//!
//! Config comes from `kiln.yaml` (first CLI argument or `KILN_CONFIG`
//! override), with environment variables on top. Registration is retried
//! indefinitely; the agent is useless until the backend has assigned it a
//! worker id.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use kiln_backend::{CoordinationClient, ReportingClient};
use kiln_executor::{ExecutorConfig, JobExecutor};
use kiln_monitor::{GpuMonitor, SystemMonitor};
use kiln_types::config::AgentConfig;
use kiln_types::errors::KilnError;
use kiln_types::traits::{CommandSink, StatusReporter};
use kiln_types::worker::WorkerIdentity;

const DEFAULT_CONFIG_PATH: &str = "kiln.yaml";

/// Cap for the registration retry backoff.
const REGISTER_RETRY_MAX: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), KilnError> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KILN_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = AgentConfig::load_or_default(std::path::Path::new(&config_path))?;
    config.validate()?;
    config.ensure_directories()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.backend.url,
        config = %config_path,
        "starting kiln agent"
    );

    let gpu = Arc::new(GpuMonitor::new(config.training.gpu_device_index));
    if let Some(device) = gpu.device_info() {
        tracing::info!(gpu = %device.name, memory_gb = device.memory_total_gb, "GPU detected");
    } else {
        tracing::warn!("no GPU detected, telemetry will report zeros");
    }
    let system = Arc::new(SystemMonitor::new());

    let reporter: Arc<dyn StatusReporter> =
        Arc::new(ReportingClient::new(&config.backend, &config.retry)?);
    let executor = JobExecutor::new(
        reporter,
        Arc::clone(&gpu),
        ExecutorConfig::from_agent_config(&config),
    );
    let coordination = Arc::new(CoordinationClient::new(&config)?);

    let hostname = config
        .worker
        .hostname
        .clone()
        .unwrap_or_else(|| system.hostname());
    let identity = register_until_success(&coordination, &system, &gpu, hostname).await;
    executor.set_negotiated_concurrency(identity.max_concurrency);

    let heartbeat = tokio::spawn(Arc::clone(&coordination).run_heartbeat_loop(
        Arc::clone(&executor) as Arc<dyn CommandSink>,
        Arc::clone(&system),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, cancelling active jobs");
            shutdown(&executor);
        }
        result = heartbeat => {
            // The loop only returns on a registration-state bug.
            tracing::error!("heartbeat loop exited unexpectedly: {result:?}");
        }
    }

    Ok(())
}

/// Register with the backend, retrying forever with capped backoff. The
/// inner call already retries within its budget; this loop covers backend
/// outages that outlast it.
async fn register_until_success(
    coordination: &CoordinationClient,
    system: &SystemMonitor,
    gpu: &GpuMonitor,
    hostname: String,
) -> WorkerIdentity {
    let mut delay = Duration::from_secs(1);

    loop {
        let sample = system.sample();
        let metadata = serde_json::json!({
            "gpu": gpu.device_info().map(|d| d.name),
            "memory_total_gb": sample.memory_total_gb,
            "disk_total_gb": sample.disk_total_gb,
        });

        match coordination.register(&hostname, metadata).await {
            Ok(identity) => return identity,
            Err(e) => {
                tracing::warn!("registration failed, retrying in {}s: {e}", delay.as_secs());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(REGISTER_RETRY_MAX);
            }
        }
    }
}

/// Best-effort cancellation of everything still live before exit.
fn shutdown(executor: &JobExecutor) {
    for job in executor.list_jobs() {
        if !job.status.is_terminal() {
            if let Err(e) = executor.cancel_training(&job.job_id) {
                tracing::warn!(job_id = %job.job_id, "cancel on shutdown failed: {e}");
            }
        }
    }
}

//! Worker coordination client — registration and the heartbeat loop.
//!
//! Registration is the handshake that makes the agent operational: the
//! backend assigns a worker id and negotiates the heartbeat interval and
//! concurrency cap, overriding local defaults. Heartbeats then carry load
//! and host telemetry upstream and bring pending job commands back down.
//!
//! The heartbeat loop is deliberately forgiving: a failed beat is logged
//! and skipped, never retried in place — the next tick is the retry.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;

use kiln_monitor::{SystemMonitor, SystemSample};
use kiln_types::config::AgentConfig;
use kiln_types::errors::KilnError;
use kiln_types::traits::CommandSink;
use kiln_types::worker::{current_platform, PendingCommand, WorkerIdentity};

use crate::retry::{retry_with_backoff, RetryPolicy};

/// HTTP client for the worker fleet endpoints.
pub struct CoordinationClient {
    client: Client,
    base_url: String,
    api_key: String,
    version: String,
    /// Platform string reported at registration; the config may override
    /// auto-detection for containerized deployments.
    platform: String,
    capabilities: Vec<String>,
    policy: RetryPolicy,
    /// Set once by the first successful registration.
    identity: OnceLock<WorkerIdentity>,
}

#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    api_key: &'a str,
    hostname: &'a str,
    platform: &'a str,
    version: &'a str,
    capabilities: &'a [String],
    metadata: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    worker_id: String,
    heartbeat_interval_seconds: u64,
    max_concurrency: usize,
}

#[derive(Debug, Serialize)]
struct HeartbeatBody<'a> {
    status: &'a str,
    current_load: usize,
    metrics: &'a SystemSample,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    pending_commands: Vec<PendingCommand>,
}

impl CoordinationClient {
    /// Build a client from the agent configuration.
    pub fn new(config: &AgentConfig) -> Result<Self, KilnError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.backend.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.backend.connect_timeout_secs))
            .build()
            .map_err(|e| KilnError::Registration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.backend.url.trim_end_matches('/').to_string(),
            api_key: config.backend.api_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: config
                .worker
                .platform
                .clone()
                .unwrap_or_else(|| current_platform().to_string()),
            capabilities: config.worker.capabilities.clone(),
            policy: RetryPolicy::from_config(&config.retry),
            identity: OnceLock::new(),
        })
    }

    /// Build a client against a custom base URL (for testing).
    pub fn with_base_url(
        base_url: String,
        api_key: String,
        capabilities: Vec<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: current_platform().to_string(),
            capabilities,
            policy,
            identity: OnceLock::new(),
        }
    }

    /// The identity from the first successful registration, if any.
    pub fn identity(&self) -> Option<&WorkerIdentity> {
        self.identity.get()
    }

    /// Register this worker with the backend, retrying within the policy
    /// budget.
    ///
    /// The returned identity carries the backend-negotiated heartbeat
    /// interval and concurrency cap; those values, not the local defaults,
    /// govern the agent from here on. The identity is stored write-once.
    pub async fn register(
        &self,
        hostname: &str,
        metadata: serde_json::Value,
    ) -> Result<WorkerIdentity, KilnError> {
        let url = format!("{}/api/workers/register", self.base_url);
        let body = RegisterBody {
            api_key: &self.api_key,
            hostname,
            platform: &self.platform,
            version: &self.version,
            capabilities: &self.capabilities,
            metadata: &metadata,
        };

        let response: RegisterResponse = retry_with_backoff(&self.policy, "register", || {
            let builder = self.client.post(&url).json(&body);
            async move {
                let response = builder.send().await.map_err(|e| {
                    KilnError::Registration(format!("HTTP request failed: {e}"))
                })?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(KilnError::Registration(format!(
                        "backend returned HTTP {status}: {text}"
                    )));
                }
                response.json().await.map_err(|e| {
                    KilnError::Registration(format!("failed to parse response: {e}"))
                })
            }
        })
        .await?;

        let identity = WorkerIdentity {
            worker_id: response.worker_id,
            hostname: hostname.to_string(),
            platform: self.platform.clone(),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
            // A zero interval would wedge the ticker; floor at one second.
            heartbeat_interval: Duration::from_secs(response.heartbeat_interval_seconds.max(1)),
            max_concurrency: response.max_concurrency,
        };

        tracing::info!(
            worker_id = %identity.worker_id,
            heartbeat_interval_secs = identity.heartbeat_interval.as_secs(),
            max_concurrency = identity.max_concurrency,
            "registered with backend"
        );

        let _ = self.identity.set(identity.clone());
        Ok(identity)
    }

    /// Send one heartbeat. Single attempt — the loop's next tick is the
    /// retry.
    pub async fn send_heartbeat(
        &self,
        status: &str,
        current_load: usize,
        metrics: &SystemSample,
    ) -> Result<Vec<PendingCommand>, KilnError> {
        let identity = self
            .identity
            .get()
            .ok_or_else(|| KilnError::Heartbeat("worker is not registered".to_string()))?;

        let url = format!(
            "{}/api/workers/{}/heartbeat",
            self.base_url, identity.worker_id
        );
        let body = HeartbeatBody {
            status,
            current_load,
            metrics,
        };

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| KilnError::Heartbeat(format!("HTTP request failed: {e}")))?;

        let http_status = response.status();
        if !http_status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KilnError::Heartbeat(format!(
                "backend returned HTTP {http_status}: {text}"
            )));
        }

        let parsed: HeartbeatResponse = response
            .json()
            .await
            .map_err(|e| KilnError::Heartbeat(format!("failed to parse response: {e}")))?;
        Ok(parsed.pending_commands)
    }

    /// Run the heartbeat loop forever at the negotiated interval.
    ///
    /// Each beat reports current load and host telemetry, then applies every
    /// delivered command to the sink. All errors are logged and swallowed —
    /// nothing a single beat does can take the loop down.
    pub async fn run_heartbeat_loop(
        self: Arc<Self>,
        sink: Arc<dyn CommandSink>,
        system: Arc<SystemMonitor>,
    ) -> Result<(), KilnError> {
        let interval = self
            .identity
            .get()
            .ok_or_else(|| KilnError::Heartbeat("worker is not registered".to_string()))?
            .heartbeat_interval;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let active_jobs = sink.active_jobs();
            let sample = system.sample();

            match self.send_heartbeat("online", active_jobs, &sample).await {
                Ok(commands) => {
                    for command in commands {
                        tracing::info!(
                            command_id = %command.id,
                            job_id = %command.job_id,
                            command = ?command.command,
                            "applying backend command"
                        );
                        sink.apply_command(command).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("heartbeat failed, retrying at next interval: {e}");
                }
            }
        }
    }
}

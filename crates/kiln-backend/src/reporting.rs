//! Backend reporting client — per-job metrics, status, and logs.
//!
//! Each report authenticates with the job's own token (bearer) rather than
//! the worker fleet key, so a leaked job token cannot act on other jobs.
//! Every call runs through the shared retry helper; an exhausted budget
//! surfaces as `KilnError::Backend` and the caller drops the report —
//! reporting never influences the local state machine.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use kiln_types::config::{BackendConfig, RetryConfig};
use kiln_types::errors::KilnError;
use kiln_types::job::{JobStatus, TrainingMetrics};
use kiln_types::traits::StatusReporter;

use crate::retry::{retry_with_backoff, RetryPolicy};

/// HTTP client for the per-job reporting endpoints.
pub struct ReportingClient {
    client: Client,
    base_url: String,
    policy: RetryPolicy,
}

/// Body of a status transition report.
#[derive(Debug, Serialize)]
struct StatusUpdateBody<'a> {
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Body of a log batch.
#[derive(Debug, Serialize)]
struct LogBatchBody<'a> {
    logs: &'a [String],
}

impl ReportingClient {
    /// Build a client with the configured connect/request timeouts.
    pub fn new(backend: &BackendConfig, retry: &RetryConfig) -> Result<Self, KilnError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(backend.request_timeout_secs))
            .connect_timeout(Duration::from_secs(backend.connect_timeout_secs))
            .build()
            .map_err(|e| KilnError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: backend.url.trim_end_matches('/').to_string(),
            policy: RetryPolicy::from_config(retry),
        })
    }

    /// Build a client against a custom base URL (for testing).
    pub fn with_base_url(base_url: String, policy: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        }
    }

    /// Send one request and map the outcome, without retry.
    async fn dispatch(
        &self,
        builder: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<(), KilnError> {
        let response = builder
            .send()
            .await
            .map_err(|e| KilnError::Backend(format!("{operation}: HTTP request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(KilnError::Backend(format!(
                "{operation}: job token rejected (401)"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Backend(format!(
                "{operation}: backend returned HTTP {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusReporter for ReportingClient {
    async fn report_metrics(
        &self,
        job_id: &str,
        job_token: &str,
        metrics: &TrainingMetrics,
    ) -> Result<(), KilnError> {
        let url = format!("{}/api/training/local/{job_id}/metrics", self.base_url);
        retry_with_backoff(&self.policy, "report_metrics", || {
            let builder = self
                .client
                .put(&url)
                .bearer_auth(job_token)
                .json(metrics);
            self.dispatch(builder, "report_metrics")
        })
        .await
    }

    async fn update_status(
        &self,
        job_id: &str,
        job_token: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), KilnError> {
        let url = format!("{}/api/training/local/{job_id}/status", self.base_url);
        let body = StatusUpdateBody { status, error };
        retry_with_backoff(&self.policy, "update_status", || {
            let builder = self
                .client
                .patch(&url)
                .bearer_auth(job_token)
                .json(&body);
            self.dispatch(builder, "update_status")
        })
        .await
    }

    async fn send_logs(
        &self,
        job_id: &str,
        job_token: &str,
        lines: &[String],
    ) -> Result<(), KilnError> {
        let url = format!("{}/api/training/local/{job_id}/logs", self.base_url);
        let body = LogBatchBody { logs: lines };
        retry_with_backoff(&self.policy, "send_logs", || {
            let builder = self
                .client
                .post(&url)
                .bearer_auth(job_token)
                .json(&body);
            self.dispatch(builder, "send_logs")
        })
        .await
    }
}

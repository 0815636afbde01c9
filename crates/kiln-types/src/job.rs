/// Job model for the executor registry.
///
/// A [`Job`] is pure metadata — the trainer subprocess handle is owned
/// exclusively by the supervising task and never stored here, so registry
/// access stays cheap and lock sections stay short.
use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::KilnError;

/// Maximum log lines buffered per job. Oldest lines are dropped first.
pub const MAX_BUFFERED_LOG_LINES: usize = 2000;

/// Lifecycle state of a training job.
///
/// Valid transitions:
/// ```text
/// pending  -> running | failed | cancelled
/// running  -> paused | completed | failed | cancelled
/// paused   -> running | cancelled | failed
/// ```
/// Terminal states (`completed`, `failed`, `cancelled`) have no outgoing
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this state has no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Running | Cancelled | Failed),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Validated training configuration from the backend.
///
/// The backend sends an opaque JSON config; only `model` and `dataset_path`
/// are required by the agent. The full blob is retained and forwarded to the
/// trainer verbatim.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Base model identifier (required, non-empty).
    pub model: String,
    /// Training dataset path (required, non-empty).
    pub dataset_path: String,
    raw: serde_json::Value,
}

impl JobConfig {
    /// Validate and wrap a raw backend config value.
    ///
    /// Fails with a `Config` error naming the missing field.
    pub fn from_value(value: serde_json::Value) -> Result<Self, KilnError> {
        let model = required_string(&value, "model")?;
        let dataset_path = required_string(&value, "dataset_path")?;
        Ok(Self {
            model,
            dataset_path,
            raw: value,
        })
    }

    /// The full config blob, forwarded to the trainer unchanged.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.raw
    }
}

fn required_string(value: &serde_json::Value, field: &str) -> Result<String, KilnError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            KilnError::Config(format!(
                "job config is missing required field '{field}' (non-empty string)"
            ))
        })
}

/// A point-in-time metrics report from the trainer, enriched with GPU
/// telemetry by the supervisor.
///
/// Optional fields are omitted from serialization entirely so the reporting
/// payload never contains JSON nulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub step: u64,
    pub epoch: u64,
    pub loss: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grad_norm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub samples_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eval_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gpu_memory_allocated_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gpu_memory_reserved_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gpu_utilization_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Job submission from the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingRequest {
    /// Opaque training config; must contain `model` and `dataset_path`.
    pub config: serde_json::Value,
    /// Backend-assigned execution id, used as the job id when present.
    #[serde(default)]
    pub execution_id: Option<String>,
    pub user_id: String,
    pub name: String,
    /// Per-job credential for metric/status/log reporting.
    pub job_token: String,
    /// Overrides `config.dataset_path` when set.
    #[serde(default)]
    pub dataset_path: Option<String>,
}

/// Registry entry for one fine-tuning job.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub user_id: String,
    pub name: String,
    pub status: JobStatus,
    pub config: JobConfig,
    pub job_token: String,
    /// Cooperative pause flag, consumed by the supervising task.
    pub pause_requested: bool,
    /// Cooperative cancel flag, consumed by the supervising task.
    pub cancel_requested: bool,
    pub current_step: u64,
    pub total_steps: u64,
    pub current_epoch: u64,
    pub total_epochs: u64,
    pub latest_metrics: Option<TrainingMetrics>,
    pub checkpoint_path: Option<String>,
    logs: VecDeque<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from a backend request, validating the config.
    ///
    /// The backend's `execution_id` becomes the job id; a UUID is generated
    /// only when the request omits it.
    pub fn new(request: TrainingRequest) -> Result<Self, KilnError> {
        let mut config = JobConfig::from_value(request.config)?;
        if let Some(dataset_path) = request.dataset_path {
            config.dataset_path = dataset_path;
        }
        let job_id = request
            .execution_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            job_id,
            user_id: request.user_id,
            name: request.name,
            status: JobStatus::Pending,
            config,
            job_token: request.job_token,
            pause_requested: false,
            cancel_requested: false,
            current_step: 0,
            total_steps: 0,
            current_epoch: 0,
            total_epochs: 0,
            latest_metrics: None,
            checkpoint_path: None,
            logs: VecDeque::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        })
    }

    /// Append a log line, dropping the oldest line at the buffer cap.
    pub fn push_log(&mut self, line: String) {
        if self.logs.len() >= MAX_BUFFERED_LOG_LINES {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    /// Total buffered log lines.
    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    /// A page of buffered log lines.
    pub fn log_page(&self, offset: usize, limit: usize) -> LogPage {
        let lines = self
            .logs
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        LogPage {
            lines,
            total: self.logs.len(),
        }
    }

    /// Immutable view for status queries and listings.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            name: self.name.clone(),
            status: self.status,
            current_step: self.current_step,
            total_steps: self.total_steps,
            current_epoch: self.current_epoch,
            total_epochs: self.total_epochs,
            latest_metrics: self.latest_metrics.clone(),
            checkpoint_path: self.checkpoint_path.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Point-in-time view of a job, safe to hand out across the API boundary.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub current_step: u64,
    pub total_steps: u64,
    pub current_epoch: u64,
    pub total_epochs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_metrics: Option<TrainingMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One page of a job's buffered logs.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub lines: Vec<String>,
    /// Total lines currently buffered (not the page size).
    pub total: usize,
}

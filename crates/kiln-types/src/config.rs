/// Agent configuration, parsed from `kiln.yaml`.
///
/// Every field has a default so a minimal config file (or none at all) is
/// enough to start the agent on a development machine. Environment
/// variables override the file for the handful of values that differ per
/// deployment. `validate()` runs once at startup and fails fast with a
/// precise message rather than letting a bad value surface mid-job.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::KilnError;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub training: TrainingConfig,
    pub supervision: SupervisionConfig,
    pub paths: PathsConfig,
    /// Log filter directive for the tracing subscriber (e.g. `info`,
    /// `kiln_executor=debug`).
    pub log_level: String,
}

/// Backend endpoint and HTTP timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `https://api.example.com`.
    pub url: String,
    /// Worker fleet API key, sent at registration and on every heartbeat.
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Retry budget shared by the reporting and coordination clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Local worker defaults; the backend may negotiate these down at
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Heartbeat cadence used until the backend negotiates one.
    pub heartbeat_interval_secs: u64,
    /// Local concurrency cap; the effective cap is the minimum of this and
    /// the backend-negotiated value.
    pub max_concurrent_jobs: usize,
    /// Capabilities declared at registration.
    pub capabilities: Vec<String>,
    /// Hostname reported at registration instead of the auto-detected one.
    /// Useful in containers where the detected name is meaningless.
    pub hostname: Option<String>,
    /// Platform reported at registration instead of the auto-detected one.
    pub platform: Option<String>,
}

/// Trainer subprocess invocation and GPU knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Program used to launch the trainer.
    pub trainer_program: String,
    /// Arguments passed before any per-job arguments.
    pub trainer_args: Vec<String>,
    pub gpu_device_index: u32,
    /// Fraction of GPU memory the trainer may claim, in `(0, 1]`.
    pub gpu_memory_fraction: f64,
    pub mixed_precision: bool,
    pub checkpoint_interval_steps: u64,
}

/// Supervision timing: staleness, termination grace, reporting cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// A running job with no progress event for this long is killed and
    /// marked failed.
    pub stale_progress_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when stopping a trainer.
    pub kill_grace_secs: u64,
    /// Supervisor flag-check cadence.
    pub poll_interval_ms: u64,
    /// Minimum spacing between metric reports per job.
    pub metrics_report_interval_secs: u64,
    /// Log lines are shipped at this interval, or sooner at the line cap.
    pub log_batch_interval_secs: u64,
    pub log_batch_max_lines: usize,
}

/// Working directories created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub model_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            api_key: String::new(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            max_concurrent_jobs: 2,
            capabilities: vec![
                "lora".to_string(),
                "qlora".to_string(),
                "full_finetune".to_string(),
            ],
            hostname: None,
            platform: None,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            trainer_program: "python3".to_string(),
            trainer_args: vec!["-m".to_string(), "kiln_trainer".to_string()],
            gpu_device_index: 0,
            gpu_memory_fraction: 0.9,
            mixed_precision: true,
            checkpoint_interval_steps: 500,
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            stale_progress_timeout_secs: 1800,
            kill_grace_secs: 30,
            poll_interval_ms: 500,
            metrics_report_interval_secs: 10,
            log_batch_interval_secs: 5,
            log_batch_max_lines: 100,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("data/models"),
            dataset_dir: PathBuf::from("data/datasets"),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            log_dir: PathBuf::from("data/logs"),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, KilnError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KilnError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config: AgentConfig = serde_yaml::from_str(&content)
            .map_err(|e| KilnError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a file if it exists, otherwise start from defaults.
    /// Environment overrides apply either way.
    pub fn load_or_default(path: &Path) -> Result<Self, KilnError> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = AgentConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply `KILN_*` environment variable overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("KILN_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Ok(key) = std::env::var("KILN_API_KEY") {
            self.backend.api_key = key;
        }
        if let Some(n) = env_parse::<usize>("KILN_MAX_CONCURRENT_JOBS") {
            self.worker.max_concurrent_jobs = n;
        }
        if let Some(secs) = env_parse::<u64>("KILN_HEARTBEAT_INTERVAL_SECS") {
            self.worker.heartbeat_interval_secs = secs;
        }
        if let Ok(level) = std::env::var("KILN_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Validate the configuration for internal consistency.
    ///
    /// Checks:
    /// - backend URL is present and parses as http(s)
    /// - API key is present
    /// - concurrency cap and retry attempts are positive
    /// - GPU memory fraction is within `(0, 1]`
    /// - retry base delay does not exceed the cap
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.backend.url.is_empty() {
            return Err(KilnError::Config("backend.url must not be empty".to_string()));
        }
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            return Err(KilnError::Config(format!(
                "backend.url must be an http(s) URL, got '{}'",
                self.backend.url
            )));
        }
        if self.backend.api_key.is_empty() {
            return Err(KilnError::Config(
                "backend.api_key must not be empty (set KILN_API_KEY)".to_string(),
            ));
        }
        if self.worker.max_concurrent_jobs == 0 {
            return Err(KilnError::Config(
                "worker.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.training.gpu_memory_fraction <= 0.0 || self.training.gpu_memory_fraction > 1.0 {
            return Err(KilnError::Config(format!(
                "training.gpu_memory_fraction must be in (0, 1], got {}",
                self.training.gpu_memory_fraction
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(KilnError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(KilnError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Create the working directories if they don't exist.
    pub fn ensure_directories(&self) -> Result<(), KilnError> {
        for dir in [
            &self.paths.model_dir,
            &self.paths.dataset_dir,
            &self.paths.checkpoint_dir,
            &self.paths.log_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                KilnError::Config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "ignoring unparseable env override");
                None
            }
        },
        Err(_) => None,
    }
}

/// Unified error type for the kiln worker agent.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Error from the backend reporting client (metrics, status, logs).
    #[error("backend error: {0}")]
    Backend(String),

    /// Error from worker registration with the backend.
    #[error("registration error: {0}")]
    Registration(String),

    /// Error from the heartbeat exchange.
    #[error("heartbeat error: {0}")]
    Heartbeat(String),

    /// The referenced job does not exist in the registry.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The requested lifecycle transition is not valid from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The executor is at its concurrency cap and cannot accept another job.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Failed to spawn or address the trainer subprocess.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

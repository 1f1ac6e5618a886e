use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Lookup errors
    #[error("Node execution not found: {0}")]
    NotFound(String),

    #[error("Node Execution is null for planNodeUuid: {plan_node_id}")]
    NoLiveExecution { plan_node_id: String },

    // Integrity errors
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    // Concurrency errors
    #[error("Concurrent modification of node execution {id} after {attempts} attempts")]
    ConcurrentModification { id: String, attempts: u32 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    /// True for the "record does not resolve" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TrellisError::NotFound(_) | TrellisError::NoLiveExecution { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;

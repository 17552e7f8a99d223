use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),
}

impl RpcError {
    /// Transient errors are worth retrying; anything else should surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_)
                | RpcError::Status { status: 500..=599, .. }
                | RpcError::RateLimited { .. }
                | RpcError::ResourceExhausted(_)
        )
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("semaphore already has a waiter")]
    SemaphoreAlreadyWaiting,

    #[error("semaphore is closed")]
    SemaphoreClosed,

    #[error("rpc error: {0}")]
    Rpc(#[from] icm_rpc::RpcError),

    #[error("codec error: {0}")]
    Codec(#[from] icm_common::codec::CodecError),

    #[error("no finalized function registered for method {0}")]
    UnknownMethod(String),

    #[error("batch invariant violated: {0}")]
    BatchInvariant(String),

    #[error("restore state file did not appear before shutdown")]
    RestoreAborted,

    #[error("restore io error: {0}")]
    RestoreIo(#[from] std::io::Error),

    #[error("restore state parse error: {0}")]
    RestoreParse(#[from] serde_json::Error),

    #[error("gpu checkpoint primitive failed: {0}")]
    GpuCheckpoint(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

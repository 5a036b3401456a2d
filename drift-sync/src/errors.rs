//! Error types for sync operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] drift_store::StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Save failed for session {session_id} after {attempts} attempts: {message}")]
    SaveFailed {
        session_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, SyncError>;

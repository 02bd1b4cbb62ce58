use thiserror::Error;

use crate::api::ApiError;

/// Crate-level error type.
///
/// The variants follow the error taxonomy the editor surfaces to the user:
/// validation and conflicts are always shown, network failures are absorbed by
/// the offline queue and only their existence is reported.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Stable machine-readable code, mirroring the API's error envelope codes.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "VALIDATION_ERROR",
            SyncError::Conflict(_) => "CONFLICT",
            SyncError::Network(_) => "NETWORK_ERROR",
            SyncError::Server { .. } => "SERVER_ERROR",
            SyncError::InvalidPath(_) => "INVALID_PATH",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::Storage(_) => "STORAGE_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Message suitable for showing to the person editing the document.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Validation(msg) => format!("Fix before saving: {msg}"),
            SyncError::Conflict(_) => {
                "This profile was changed elsewhere. Reload to get the latest version.".to_string()
            }
            SyncError::Network(_) => {
                "You're offline. Changes will sync when you reconnect.".to_string()
            }
            SyncError::Server { .. } => "Saving failed. Please try again.".to_string(),
            SyncError::InvalidPath(path) => format!("'{path}' is not an editable field"),
            SyncError::NotFound(what) => format!("{what} could not be found"),
            SyncError::Storage(e) => {
                tracing::error!("Storage error: {e}");
                "Local storage is unavailable".to_string()
            }
            SyncError::Serialization(e) => {
                tracing::error!("Serialization error: {e}");
                "Local data could not be read".to_string()
            }
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Network(msg) => SyncError::Network(msg),
            ApiError::Conflict { message, .. } => SyncError::Conflict(message),
            ApiError::Server { status, message } => SyncError::Server { status, message },
            ApiError::Parse(e) => SyncError::Serialization(e),
        }
    }
}

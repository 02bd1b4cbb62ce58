//! Network collaborators consumed by the sync core.
//!
//! Every server interaction goes through one of the traits below so the draft
//! store, autosave scheduler, offline queue and reconciler can be exercised
//! against fakes. [`http::HttpApi`] is the production implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::collection::{ListQuery, RecordPage};
use crate::models::{Document, VersionMarker};
use crate::queue::QueuedOperation;

pub mod http;

#[cfg(test)]
pub mod fakes;

#[derive(Debug, Error)]
pub enum ApiError {
    /// No response: connection refused, DNS failure, timeout, or the client
    /// already knows it is offline.
    #[error("network error: {0}")]
    Network(String),

    /// The server holds a marker that supersedes the one the client sent.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        server_marker: Option<VersionMarker>,
    },

    #[error("API error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ApiError {
    /// Connectivity-class failures are the only ones worth queueing; a
    /// deterministic server rejection would fail again identically.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }
}

/// What the server hands back after persisting a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDraft {
    pub id: Uuid,
    #[serde(flatten)]
    pub marker: VersionMarker,
}

/// Body of `PUT /drafts/{id}`. Also the payload of a queued draft save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDraftRequest {
    pub content: Value,
    pub last_known_server_updated_at: Option<DateTime<Utc>>,
    pub last_known_version: Option<i64>,
}

impl UpdateDraftRequest {
    pub fn new(content: Value, last_known: Option<VersionMarker>) -> Self {
        Self {
            content,
            last_known_server_updated_at: last_known.map(|m| m.server_timestamp),
            last_known_version: last_known.map(|m| m.version),
        }
    }
}

/// Endpoint path a draft is persisted at. Queued saves are keyed by it.
pub fn draft_endpoint(id: Uuid) -> String {
    format!("/drafts/{id}")
}

#[async_trait]
pub trait DraftApi: Send + Sync {
    async fn create_draft(&self, content: &Value) -> Result<SavedDraft, ApiError>;

    async fn update_draft(
        &self,
        id: Uuid,
        request: &UpdateDraftRequest,
    ) -> Result<SavedDraft, ApiError>;

    /// Fetches the authoritative copy, used to recover from a conflict.
    async fn fetch_draft(&self, id: Uuid) -> Result<Document, ApiError>;
}

#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn list_records(&self, query: &ListQuery) -> Result<RecordPage, ApiError>;
}

/// Re-issues a queued mutating request. Returns the response body, if any.
#[async_trait]
pub trait ReplayTransport: Send + Sync {
    async fn replay(&self, operation: &QueuedOperation) -> Result<Option<Value>, ApiError>;
}

//! Server-pushed change events for the record collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Comment, Record, RecordPatch, Share, VersionMarker};

/// One message from the push channel. The wire form is a JSON object with a
/// `type` discriminator, e.g. `{"type":"file_deleted","fileId":"…"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    FileCreated {
        file: Record,
    },
    #[serde(rename_all = "camelCase")]
    FileUpdated {
        file_id: Uuid,
        file: RecordPatch,
    },
    #[serde(rename_all = "camelCase")]
    FileDeleted {
        file_id: Uuid,
        #[serde(default)]
        deleted_at: Option<DateTime<Utc>>,
    },
    FileRestored {
        file: Record,
    },
    #[serde(rename_all = "camelCase")]
    FileShared {
        file_id: Uuid,
        share: Share,
    },
    #[serde(rename_all = "camelCase")]
    ShareRemoved {
        file_id: Uuid,
        share_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    CommentAdded {
        file_id: Uuid,
        comment: Comment,
    },
}

impl PushEvent {
    pub fn record_id(&self) -> Uuid {
        match self {
            PushEvent::FileCreated { file } | PushEvent::FileRestored { file } => file.id,
            PushEvent::FileUpdated { file_id, .. }
            | PushEvent::FileDeleted { file_id, .. }
            | PushEvent::FileShared { file_id, .. }
            | PushEvent::ShareRemoved { file_id, .. }
            | PushEvent::CommentAdded { file_id, .. } => *file_id,
        }
    }

    /// The wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::FileCreated { .. } => "file_created",
            PushEvent::FileUpdated { .. } => "file_updated",
            PushEvent::FileDeleted { .. } => "file_deleted",
            PushEvent::FileRestored { .. } => "file_restored",
            PushEvent::FileShared { .. } => "file_shared",
            PushEvent::ShareRemoved { .. } => "share_removed",
            PushEvent::CommentAdded { .. } => "comment_added",
        }
    }

    /// The marker carried by events that include record state.
    pub fn marker(&self) -> Option<VersionMarker> {
        match self {
            PushEvent::FileCreated { file } | PushEvent::FileRestored { file } => Some(file.marker),
            PushEvent::FileUpdated { file, .. } => Some(file.marker),
            _ => None,
        }
    }
}

/// Decodes one raw push payload. Unknown `type` values and missing fields are
/// errors; callers log and drop them.
pub fn parse_push_message(raw: &str) -> Result<PushEvent, serde_json::Error> {
    serde_json::from_str(raw)
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::marker::VersionMarker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharePermission {
    View,
    Comment,
    Edit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub id: Uuid,
    pub email: String,
    pub permission: SharePermission,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One stored file in the collection. Soft-deleted records keep their row and
/// carry `deleted_at` until purged server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: Uuid,
    #[serde(default)]
    pub folder_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub marker: VersionMarker,
    #[serde(default)]
    pub shares: Vec<Share>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Partial record carried by `file_updated`. Absent fields are left untouched;
/// `folderId: null` moves the record to the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub folder_id: Option<Option<Uuid>>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub marker: VersionMarker,
}

/// Distinguishes an explicit `null` from a missing key.
fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl Record {
    /// Merges a patch into this record. `data` objects are merged key by key;
    /// any other `data` shape replaces the old value wholesale.
    pub fn merge(&mut self, patch: RecordPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(folder_id) = patch.folder_id {
            self.folder_id = folder_id;
        }
        if let Some(data) = patch.data {
            match (&mut self.data, data) {
                (Value::Object(current), Value::Object(incoming)) => {
                    for (key, value) in incoming {
                        current.insert(key, value);
                    }
                }
                (current, incoming) => *current = incoming,
            }
        }
        self.marker = patch.marker;
    }

    /// Inserts or replaces a share by id.
    pub fn upsert_share(&mut self, share: Share) {
        match self.shares.iter_mut().find(|s| s.id == share.id) {
            Some(existing) => *existing = share,
            None => self.shares.push(share),
        }
    }

    pub fn remove_share(&mut self, share_id: Uuid) -> bool {
        let before = self.shares.len();
        self.shares.retain(|s| s.id != share_id);
        self.shares.len() != before
    }

    /// Inserts or replaces a comment by id. Returns false when an identical
    /// comment was already present.
    pub fn upsert_comment(&mut self, comment: Comment) -> bool {
        match self.comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) if *existing == comment => false,
            Some(existing) => {
                *existing = comment;
                true
            }
            None => {
                self.comments.push(comment);
                true
            }
        }
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::marker::VersionMarker;

/// Profile sections present on a blank document, in display order.
pub const SECTIONS: &[&str] = &[
    "experience",
    "education",
    "project",
    "skill",
    "publication",
    "open_source",
    "certification",
    "award",
    "extracurricular",
];

/// The editable profile. `content` is an arbitrary nested structure of named
/// sections; `id` and `marker` are absent until the first successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(flatten)]
    pub marker: Option<VersionMarker>,
    pub content: Value,
}

impl Document {
    /// A never-persisted profile with an empty contact block and every section.
    pub fn blank() -> Self {
        let mut content = Map::new();
        content.insert(
            "contact".to_string(),
            json!({ "name": "", "email": "", "phone": "", "location": "" }),
        );
        content.insert("summary".to_string(), Value::String(String::new()));
        for section in SECTIONS {
            content.insert(section.to_string(), Value::Array(Vec::new()));
        }
        Self {
            id: None,
            marker: None,
            content: Value::Object(content),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::blank()
    }
}

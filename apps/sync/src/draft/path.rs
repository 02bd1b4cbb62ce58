use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::errors::SyncError;

/// A dotted path into the document, e.g. `contact.name` or `experience.0.role`.
///
/// Numeric segments index arrays; on objects they are ordinary keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if raw.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(SyncError::InvalidPath(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(root, |current, segment| match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    /// Writes `value` at this path, creating missing intermediate containers.
    ///
    /// An index equal to the array length appends. Walking through a scalar
    /// or past the end of an array is an error and leaves `root` untouched
    /// up to the failing segment.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), SyncError> {
        let (last, parents) = self
            .segments
            .split_last()
            .ok_or_else(|| SyncError::InvalidPath(self.raw.clone()))?;

        let mut current = root;
        for (i, segment) in parents.iter().enumerate() {
            let next_is_index = self.segments[i + 1].parse::<usize>().is_ok();
            current = self.child_mut(current, segment, next_is_index)?;
        }
        *self.child_mut(current, last, false)? = value;
        Ok(())
    }

    fn child_mut<'a>(
        &self,
        current: &'a mut Value,
        segment: &str,
        next_is_index: bool,
    ) -> Result<&'a mut Value, SyncError> {
        if current.is_null() {
            *current = match segment.parse::<usize>() {
                Ok(_) => Value::Array(Vec::new()),
                Err(_) => Value::Object(Map::new()),
            };
        }
        let empty = || {
            if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Null
            }
        };
        match current {
            Value::Object(map) => Ok(map.entry(segment.to_string()).or_insert_with(empty)),
            Value::Array(items) => {
                let index = segment
                    .parse::<usize>()
                    .map_err(|_| SyncError::InvalidPath(self.raw.clone()))?;
                if index == items.len() {
                    items.push(empty());
                }
                items
                    .get_mut(index)
                    .ok_or_else(|| SyncError::InvalidPath(self.raw.clone()))
            }
            _ => Err(SyncError::InvalidPath(self.raw.clone())),
        }
    }
}

impl FromStr for FieldPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("contact..name").is_err());
        assert!(FieldPath::parse(".name").is_err());
        assert!(FieldPath::parse("contact.name").is_ok());
    }

    #[test]
    fn test_set_existing_nested_field() {
        let mut doc = json!({ "contact": { "name": "John Doe" } });
        FieldPath::parse("contact.name")
            .unwrap()
            .set(&mut doc, json!("Jane Doe"))
            .unwrap();
        assert_eq!(doc["contact"]["name"], "Jane Doe");
    }

    #[test]
    fn test_set_creates_missing_objects() {
        let mut doc = json!({});
        FieldPath::parse("contact.links.github")
            .unwrap()
            .set(&mut doc, json!("jdoe"))
            .unwrap();
        assert_eq!(doc["contact"]["links"]["github"], "jdoe");
    }

    #[test]
    fn test_set_indexes_and_appends_arrays() {
        let mut doc = json!({ "experience": [ { "role": "Engineer" } ] });
        let path = FieldPath::parse("experience.0.role").unwrap();
        path.set(&mut doc, json!("Senior Engineer")).unwrap();
        assert_eq!(doc["experience"][0]["role"], "Senior Engineer");

        FieldPath::parse("experience.1.role")
            .unwrap()
            .set(&mut doc, json!("Staff Engineer"))
            .unwrap();
        assert_eq!(doc["experience"][1]["role"], "Staff Engineer");
    }

    #[test]
    fn test_set_missing_array_is_created_for_index_segment() {
        let mut doc = json!({});
        FieldPath::parse("skill.0")
            .unwrap()
            .set(&mut doc, json!("Rust"))
            .unwrap();
        assert_eq!(doc["skill"], json!(["Rust"]));
    }

    #[test]
    fn test_set_rejects_out_of_range_index() {
        let mut doc = json!({ "experience": [] });
        let err = FieldPath::parse("experience.3.role")
            .unwrap()
            .set(&mut doc, json!("x"))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath(_)));
    }

    #[test]
    fn test_set_rejects_walking_through_scalar() {
        let mut doc = json!({ "summary": "text" });
        assert!(FieldPath::parse("summary.first")
            .unwrap()
            .set(&mut doc, json!("x"))
            .is_err());
    }

    #[test]
    fn test_get_reads_nested_values() {
        let doc = json!({ "experience": [ { "company": "Acme" } ] });
        let path = FieldPath::parse("experience.0.company").unwrap();
        assert_eq!(path.get(&doc), Some(&json!("Acme")));
        assert!(FieldPath::parse("experience.4").unwrap().get(&doc).is_none());
    }
}

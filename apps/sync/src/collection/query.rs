use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Record;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    Name,
    CreatedAt,
    UpdatedAt,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Name => "name",
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: SortField::UpdatedAt,
            direction: SortDirection::Desc,
        }
    }
}

/// How soft-deleted records participate in the view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedFilter {
    /// Active records only.
    #[default]
    Exclude,
    /// Active and soft-deleted records side by side.
    Include,
    /// The recycle bin.
    Only,
}

impl DeletedFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletedFilter::Exclude => "exclude",
            DeletedFilter::Include => "include",
            DeletedFilter::Only => "only",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub folder_id: Option<Uuid>,
    pub deleted: DeletedFilter,
}

/// Parameters of the paginated list-fetch endpoint. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub page: u32,
    pub page_size: u32,
    pub sort: Sort,
    pub filter: Filter,
    pub search: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: Sort::default(),
            filter: Filter::default(),
            search: None,
        }
    }
}

impl ListQuery {
    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Self::default()
        }
    }

    pub fn is_first_page(&self) -> bool {
        self.page <= 1
    }

    /// Number of records on the pages before this one.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Whether `record` belongs in a view with this folder/search/deleted filter.
    pub fn matches(&self, record: &Record) -> bool {
        let deleted_ok = match self.filter.deleted {
            DeletedFilter::Exclude => record.deleted_at.is_none(),
            DeletedFilter::Include => true,
            DeletedFilter::Only => record.deleted_at.is_some(),
        };
        let folder_ok = self
            .filter
            .folder_id
            .map_or(true, |folder| record.folder_id == Some(folder));
        let search_ok = match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => record
                .name
                .to_lowercase()
                .contains(&term.to_lowercase()),
            _ => true,
        };
        deleted_ok && folder_ok && search_ok
    }

    /// Ordering under the active sort. Ties fall back to id so the order is total.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ordering = match self.sort.field {
            SortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a
                .marker
                .server_timestamp
                .cmp(&b.marker.server_timestamp),
        };
        let ordering = match self.sort.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        ordering.then_with(|| a.id.cmp(&b.id))
    }
}

/// One page as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    #[serde(alias = "files")]
    pub records: Vec<Record>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VersionMarker;
    use chrono::{TimeZone, Utc};

    fn record(name: &str, updated_secs: i64) -> Record {
        Record {
            id: Uuid::new_v4(),
            folder_id: None,
            name: name.to_string(),
            data: serde_json::Value::Null,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            deleted_at: None,
            marker: VersionMarker::new(1, Utc.timestamp_opt(updated_secs, 0).unwrap()),
            shares: vec![],
            comments: vec![],
        }
    }

    #[test]
    fn test_offset_is_zero_on_first_page() {
        let mut q = ListQuery::with_page_size(10);
        assert_eq!(q.offset(), 0);
        q.page = 3;
        assert_eq!(q.offset(), 20);
        assert!(!q.is_first_page());
    }

    #[test]
    fn test_default_sort_is_most_recently_updated_first() {
        let q = ListQuery::default();
        let older = record("a", 10);
        let newer = record("b", 20);
        assert_eq!(q.compare(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_name_sort_is_case_insensitive() {
        let mut q = ListQuery::default();
        q.sort = Sort {
            field: SortField::Name,
            direction: SortDirection::Asc,
        };
        assert_eq!(q.compare(&record("alpha", 0), &record("Beta", 0)), Ordering::Less);
    }

    #[test]
    fn test_matches_respects_deleted_filter() {
        let mut q = ListQuery::default();
        let mut r = record("Resume", 0);
        assert!(q.matches(&r));
        r.deleted_at = Some(Utc::now());
        assert!(!q.matches(&r));
        q.filter.deleted = DeletedFilter::Only;
        assert!(q.matches(&r));
        q.filter.deleted = DeletedFilter::Include;
        assert!(q.matches(&r));
    }

    #[test]
    fn test_matches_folder_and_search() {
        let folder = Uuid::new_v4();
        let mut q = ListQuery::default();
        q.filter.folder_id = Some(folder);
        q.search = Some("backend".to_string());
        let mut r = record("Senior Backend Engineer", 0);
        assert!(!q.matches(&r));
        r.folder_id = Some(folder);
        assert!(q.matches(&r));
        r.name = "Designer".to_string();
        assert!(!q.matches(&r));
    }
}

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::collection::query::{ListQuery, RecordPage};
use crate::models::Record;

/// Result of trying to place a newly created record into the visible page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Splice {
    Inserted,
    AlreadyPresent,
    /// The record does not belong under the active folder/search/deleted filter.
    FilteredOut,
    /// Where the record lands can't be derived locally; fetch the page again.
    Refetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotPresent,
    Removed,
    /// Removed, and the page is now short while later pages still hold records.
    Backfill,
}

/// The externally visible page of records under one [`ListQuery`].
#[derive(Debug, Clone)]
pub struct CollectionView {
    query: ListQuery,
    records: Vec<Record>,
    total: u64,
}

impl CollectionView {
    pub fn new(query: ListQuery) -> Self {
        Self {
            query,
            records: Vec::new(),
            total: 0,
        }
    }

    pub fn query(&self) -> &ListQuery {
        &self.query
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Total number of records matching the query across all pages.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Switches page, sort, filter or search. The current page is dropped and
    /// must be refetched.
    pub fn set_query(&mut self, query: ListQuery) {
        self.query = query;
        self.records.clear();
        self.total = 0;
    }

    pub fn replace_page(&mut self, page: RecordPage) {
        self.records = page.records;
        self.total = page.total;
    }

    fn has_capacity(&self) -> bool {
        self.records.len() < self.query.page_size as usize
    }

    /// Places a created record locally when that is unambiguous: only on the
    /// first page and only while it has room, in which case the page holds the
    /// entire result set and the sort position is derivable.
    pub fn splice_created(&mut self, record: Record) -> Splice {
        if self.contains(record.id) {
            return Splice::AlreadyPresent;
        }
        if !self.query.matches(&record) {
            return Splice::FilteredOut;
        }
        if !(self.query.is_first_page() && self.has_capacity()) {
            return Splice::Refetch;
        }
        let query = &self.query;
        let at = self
            .records
            .partition_point(|existing| query.compare(existing, &record).is_lt());
        self.records.insert(at, record);
        self.total += 1;
        Splice::Inserted
    }

    pub fn remove(&mut self, id: Uuid) -> Removal {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return Removal::NotPresent;
        };
        self.records.remove(index);
        self.total = self.total.saturating_sub(1);

        let shown_through = self.query.offset() + self.records.len() as u64;
        if self.has_capacity() && self.total > shown_through {
            Removal::Backfill
        } else {
            Removal::Removed
        }
    }

    /// Soft-deletes in place for views that show deleted records.
    pub fn stamp_deleted(&mut self, id: Uuid, at: DateTime<Utc>) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.deleted_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Restores sort order after an in-place edit changed a sort key.
    pub fn resort(&mut self) {
        let query = &self.query;
        self.records.sort_by(|a, b| query.compare(a, b));
    }
}

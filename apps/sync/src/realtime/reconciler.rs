//! Applies push events to the locally held page of records.
//!
//! Every event carrying record state is gated on the per-record marker table:
//! an incoming marker that does not supersede the tracked one is stale and is
//! dropped without touching the view. Application never fails outward; the
//! caller only learns whether the page must be refetched.
//!
//! Deleted ids leave a tombstone behind so a redelivered `file_created` can't
//! bring the record back. Markers and tombstones for records off the page are
//! forgotten once they have gone unseen for the retention window.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::collection::{CollectionView, DeletedFilter, ListQuery, RecordPage, Removal, Splice};
use crate::models::{Record, VersionMarker};
use crate::realtime::events::PushEvent;

/// How long an off-page marker or tombstone is kept after it was last seen.
pub const DEFAULT_MARKER_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Marker does not supersede the one already tracked.
    Stale,
    /// Already applied, e.g. an at-least-once redelivery.
    Duplicate,
    /// The record is not on the visible page.
    NotLoaded,
    /// The record does not belong under the active filter.
    FilteredOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    Ignored(IgnoreReason),
    /// The visible page can't be derived locally; fetch it again.
    Refetch,
}

#[derive(Debug, Clone, Copy)]
struct Seen<T> {
    value: T,
    at: DateTime<Utc>,
}

impl<T> Seen<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            at: Utc::now(),
        }
    }
}

pub struct Reconciler {
    view: CollectionView,
    markers: HashMap<Uuid, Seen<VersionMarker>>,
    /// Deleted ids with the marker held at deletion, if any.
    tombstones: HashMap<Uuid, Seen<Option<VersionMarker>>>,
    retention: Duration,
}

impl Reconciler {
    pub fn new(query: ListQuery) -> Self {
        Self {
            view: CollectionView::new(query),
            markers: HashMap::new(),
            tombstones: HashMap::new(),
            retention: DEFAULT_MARKER_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn view(&self) -> &CollectionView {
        &self.view
    }

    pub fn query(&self) -> &ListQuery {
        self.view.query()
    }

    /// Latest marker seen for `id`, whether or not the record is on the page.
    pub fn marker(&self, id: Uuid) -> Option<VersionMarker> {
        self.markers.get(&id).map(|seen| seen.value)
    }

    pub fn is_tombstoned(&self, id: Uuid) -> bool {
        self.tombstones.contains_key(&id)
    }

    /// Switches page, sort or filter. The caller fetches the returned query.
    pub fn navigate(&mut self, query: ListQuery) -> ListQuery {
        self.view.set_query(query.clone());
        query
    }

    /// Records `marker` for `id` if it is fresh. Returns false for stale markers.
    fn observe(&mut self, id: Uuid, marker: VersionMarker) -> bool {
        let local = self.markers.get(&id).map(|seen| &seen.value);
        if !VersionMarker::is_fresh(&marker, local) {
            return false;
        }
        self.markers.insert(id, Seen::now(marker));
        true
    }

    /// Adopts a page fetched for `query`. A page fetched for a query the view
    /// has since moved away from is dropped. Records held locally at a strictly
    /// newer marker than the fetched copy are kept as they are.
    pub fn adopt_page(&mut self, query: &ListQuery, page: RecordPage) -> bool {
        self.adopt_page_at(query, page, Utc::now())
    }

    /// [`Reconciler::adopt_page`] with an explicit clock for retention.
    pub fn adopt_page_at(
        &mut self,
        query: &ListQuery,
        page: RecordPage,
        now: DateTime<Utc>,
    ) -> bool {
        if query != self.view.query() {
            debug!("Discarding page fetched for a previous query");
            return false;
        }

        let mut records = Vec::with_capacity(page.records.len());
        for fetched in page.records {
            let kept = match self.markers.get(&fetched.id) {
                Some(local) if !fetched.marker.supersedes(&local.value) => {
                    self.view.get(fetched.id).cloned()
                }
                _ => None,
            };
            let record = kept.unwrap_or(fetched);
            if record.deleted_at.is_none() {
                self.tombstones.remove(&record.id);
            }
            self.observe(record.id, record.marker);
            records.push(record);
        }

        self.view.replace_page(RecordPage {
            records,
            total: page.total,
        });
        self.forget_unseen(now);
        true
    }

    /// Drops markers and tombstones of off-page records not seen within the
    /// retention window.
    fn forget_unseen(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(self.retention.as_secs() as i64);
        let on_page: HashSet<Uuid> = self.view.records().iter().map(|r| r.id).collect();
        let before = self.markers.len() + self.tombstones.len();
        self.markers
            .retain(|id, seen| seen.at >= cutoff || on_page.contains(id));
        self.tombstones.retain(|_, seen| seen.at >= cutoff);
        let forgotten = before - self.markers.len() - self.tombstones.len();
        if forgotten > 0 {
            debug!("Forgot {forgotten} marker(s) for records off the page");
        }
    }

    pub fn apply(&mut self, event: PushEvent) -> ReconcileOutcome {
        let kind = event.kind();
        let id = event.record_id();
        let outcome = match event {
            PushEvent::FileCreated { file } => self.created(file),
            PushEvent::FileUpdated { file_id, file } => {
                if !self.observe(file_id, file.marker) {
                    ReconcileOutcome::Ignored(IgnoreReason::Stale)
                } else {
                    match self.view.get_mut(file_id) {
                        Some(record) => {
                            record.merge(file);
                            self.after_in_place_edit(file_id)
                        }
                        None => ReconcileOutcome::Ignored(IgnoreReason::NotLoaded),
                    }
                }
            }
            PushEvent::FileDeleted {
                file_id,
                deleted_at,
            } => self.deleted(file_id, deleted_at.unwrap_or_else(Utc::now)),
            PushEvent::FileRestored { file } => {
                if self.observe(file.id, file.marker) {
                    self.tombstones.remove(&file.id);
                    ReconcileOutcome::Refetch
                } else {
                    ReconcileOutcome::Ignored(IgnoreReason::Stale)
                }
            }
            PushEvent::FileShared { file_id, share } => match self.view.get_mut(file_id) {
                Some(record) => {
                    record.upsert_share(share);
                    ReconcileOutcome::Applied
                }
                None => ReconcileOutcome::Ignored(IgnoreReason::NotLoaded),
            },
            PushEvent::ShareRemoved { file_id, share_id } => match self.view.get_mut(file_id) {
                Some(record) => applied_unless_duplicate(record.remove_share(share_id)),
                None => ReconcileOutcome::Ignored(IgnoreReason::NotLoaded),
            },
            PushEvent::CommentAdded { file_id, comment } => match self.view.get_mut(file_id) {
                Some(record) => applied_unless_duplicate(record.upsert_comment(comment)),
                None => ReconcileOutcome::Ignored(IgnoreReason::NotLoaded),
            },
        };

        match outcome {
            ReconcileOutcome::Ignored(IgnoreReason::Stale) => {
                debug!("{kind} for {id}: stale, ignored")
            }
            ReconcileOutcome::Ignored(reason) => debug!("{kind} for {id}: ignored ({reason:?})"),
            ReconcileOutcome::Applied => debug!("{kind} for {id}: applied"),
            ReconcileOutcome::Refetch => debug!("{kind} for {id}: page refetch needed"),
        }
        outcome
    }

    fn created(&mut self, file: Record) -> ReconcileOutcome {
        if self.view.contains(file.id) {
            return ReconcileOutcome::Ignored(IgnoreReason::Duplicate);
        }
        // Only a strictly newer incarnation may follow a delete.
        if let Some(tombstone) = self.tombstones.get(&file.id) {
            let newer = tombstone.value.map_or(false, |dead| file.marker > dead);
            if !newer {
                return ReconcileOutcome::Ignored(IgnoreReason::Duplicate);
            }
            self.tombstones.remove(&file.id);
        }
        if !self.observe(file.id, file.marker) {
            return ReconcileOutcome::Ignored(IgnoreReason::Stale);
        }
        match self.view.splice_created(file) {
            Splice::Inserted => ReconcileOutcome::Applied,
            Splice::AlreadyPresent => ReconcileOutcome::Ignored(IgnoreReason::Duplicate),
            Splice::FilteredOut => ReconcileOutcome::Ignored(IgnoreReason::FilteredOut),
            Splice::Refetch => ReconcileOutcome::Refetch,
        }
    }

    fn deleted(&mut self, id: Uuid, at: DateTime<Utc>) -> ReconcileOutcome {
        let marker = self.marker(id);
        self.tombstones.insert(id, Seen::now(marker));
        match self.view.query().filter.deleted {
            DeletedFilter::Include => {
                if self.view.stamp_deleted(id, at) {
                    ReconcileOutcome::Applied
                } else {
                    ReconcileOutcome::Ignored(IgnoreReason::NotLoaded)
                }
            }
            // A recycle-bin view gains the record at a position it can't derive.
            DeletedFilter::Only => {
                if self.view.contains(id) {
                    ReconcileOutcome::Ignored(IgnoreReason::Duplicate)
                } else {
                    ReconcileOutcome::Refetch
                }
            }
            DeletedFilter::Exclude => match self.view.remove(id) {
                Removal::NotPresent => ReconcileOutcome::Ignored(IgnoreReason::NotLoaded),
                Removal::Removed => ReconcileOutcome::Applied,
                Removal::Backfill => ReconcileOutcome::Refetch,
            },
        }
    }

    /// An update may have moved the record out of the filter or changed its
    /// sort key.
    fn after_in_place_edit(&mut self, id: Uuid) -> ReconcileOutcome {
        let still_matches = self
            .view
            .get(id)
            .map_or(false, |record| self.view.query().matches(record));
        if still_matches {
            self.view.resort();
            return ReconcileOutcome::Applied;
        }
        match self.view.remove(id) {
            Removal::Backfill => ReconcileOutcome::Refetch,
            _ => ReconcileOutcome::Applied,
        }
    }
}

fn applied_unless_duplicate(changed: bool) -> ReconcileOutcome {
    if changed {
        ReconcileOutcome::Applied
    } else {
        ReconcileOutcome::Ignored(IgnoreReason::Duplicate)
    }
}

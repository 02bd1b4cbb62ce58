use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::api::SavedDraft;
use crate::draft::path::FieldPath;
use crate::errors::SyncError;
use crate::models::{Document, VersionMarker};

/// Undo depth. Older snapshots are dropped first.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The server holds a marker that supersedes ours. Only a reload clears it.
    Server,
    /// A save landed for an older snapshot than the one now being edited.
    /// Cleared by the next edit or the next successful save.
    StaleWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictFlag {
    pub kind: ConflictKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Published on every semantic change. `generation` moves when a different
/// document is loaded; `revision` moves on every dirtying edit within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DraftChange {
    pub generation: u64,
    pub revision: u64,
}

/// The document as of a specific change, captured when a deferred save fires.
#[derive(Debug, Clone)]
pub struct DraftSnapshot {
    pub document: Document,
    pub change: DraftChange,
}

pub type SharedDraft = Arc<Mutex<DraftStore>>;

/// Locks the shared store. A poisoned lock still holds consistent data since
/// every mutation completes before releasing it.
pub fn lock(draft: &SharedDraft) -> MutexGuard<'_, DraftStore> {
    draft.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the one editable document for an editing session.
pub struct DraftStore {
    document: Document,
    undo: VecDeque<Value>,
    redo: Vec<Value>,
    history_limit: usize,
    dirty: bool,
    conflict: Option<ConflictFlag>,
    last_saved_at: Option<DateTime<Utc>>,
    change: DraftChange,
    notifier: watch::Sender<DraftChange>,
}

impl DraftStore {
    pub fn new(document: Document) -> Self {
        Self::with_history_limit(document, HISTORY_LIMIT)
    }

    pub fn with_history_limit(document: Document, history_limit: usize) -> Self {
        let change = DraftChange::default();
        let (notifier, _) = watch::channel(change);
        Self {
            document,
            undo: VecDeque::new(),
            redo: Vec::new(),
            history_limit,
            dirty: false,
            conflict: None,
            last_saved_at: None,
            change,
            notifier,
        }
    }

    pub fn into_shared(self) -> SharedDraft {
        Arc::new(Mutex::new(self))
    }

    pub fn subscribe(&self) -> watch::Receiver<DraftChange> {
        self.notifier.subscribe()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        FieldPath::parse(path).ok()?.get(&self.document.content)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn conflict(&self) -> Option<&ConflictFlag> {
        self.conflict.as_ref()
    }

    pub fn has_server_conflict(&self) -> bool {
        matches!(&self.conflict, Some(c) if c.kind == ConflictKind::Server)
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    pub fn change(&self) -> DraftChange {
        self.change
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Number of snapshots held, including the current one.
    pub fn history_len(&self) -> usize {
        self.undo.len() + 1 + self.redo.len()
    }

    /// Position of the current snapshot within the history.
    pub fn history_index(&self) -> usize {
        self.undo.len()
    }

    /// Replaces the document wholesale: history collapses to the loaded
    /// snapshot, dirty and conflict state reset, and any pending autosave for
    /// the previous document is cancelled via the generation bump.
    pub fn load(&mut self, document: Document) {
        debug!("Loading draft {:?}", document.id);
        self.document = document;
        self.undo.clear();
        self.redo.clear();
        self.dirty = false;
        self.conflict = None;
        self.last_saved_at = None;
        self.change = DraftChange {
            generation: self.change.generation + 1,
            revision: 0,
        };
        self.notifier.send_replace(self.change);
    }

    /// Recovers from a server conflict by adopting the authoritative copy.
    pub fn reload_authoritative(&mut self, document: Document) {
        self.load(document);
    }

    /// Sets the field at `path` as a user edit.
    pub fn mutate(&mut self, path: &str, value: Value) -> Result<(), SyncError> {
        let path = FieldPath::parse(path)?;
        if path.get(&self.document.content) == Some(&value) {
            return Ok(());
        }
        let mut next = self.document.content.clone();
        path.set(&mut next, value)?;

        let previous = std::mem::replace(&mut self.document.content, next);
        self.undo.push_back(previous);
        while self.undo.len() > self.history_limit {
            self.undo.pop_front();
        }
        self.redo.clear();
        self.commit();
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        let Some(previous) = self.undo.pop_back() else {
            return false;
        };
        let current = std::mem::replace(&mut self.document.content, previous);
        self.redo.push(current);
        self.commit();
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(next) = self.redo.pop() else {
            return false;
        };
        let current = std::mem::replace(&mut self.document.content, next);
        self.undo.push_back(current);
        self.commit();
        true
    }

    /// The single choke point every user-visible change passes through.
    fn commit(&mut self) {
        self.dirty = true;
        if matches!(&self.conflict, Some(c) if c.kind == ConflictKind::StaleWrite) {
            self.conflict = None;
        }
        self.change.revision += 1;
        self.notifier.send_replace(self.change);
    }

    /// Applies a server-sourced copy of the current document without marking
    /// it dirty or growing history. Refused while local edits are unsaved, or
    /// when the incoming marker does not supersede the one held.
    pub fn apply_server_snapshot(&mut self, document: Document) -> bool {
        if self.dirty || document.id != self.document.id {
            return false;
        }
        let fresh = match (&document.marker, &self.document.marker) {
            (Some(incoming), local) => VersionMarker::is_fresh(incoming, local.as_ref()),
            (None, _) => false,
        };
        if !fresh {
            debug!("Ignoring stale server snapshot for draft {:?}", document.id);
            return false;
        }
        self.document = document;
        true
    }

    pub fn snapshot(&self) -> DraftSnapshot {
        DraftSnapshot {
            document: self.document.clone(),
            change: self.change,
        }
    }

    /// Records a successful save of the snapshot taken at `saved_from`.
    ///
    /// The response is ignored if a different document has been loaded since,
    /// or if it carries a marker older than the one already held. Dirty clears
    /// only when nothing was edited while the save was in flight; otherwise a
    /// `StaleWrite` flag is raised and the newer edits stay dirty.
    pub fn mark_saved(
        &mut self,
        saved_from: DraftChange,
        saved: SavedDraft,
        at: DateTime<Utc>,
    ) -> bool {
        if saved_from.generation != self.change.generation {
            debug!("Save response for a previous document ignored");
            return false;
        }
        if !VersionMarker::is_fresh(&saved.marker, self.document.marker.as_ref()) {
            debug!(
                "Save response at version {} is older than local marker; ignored",
                saved.marker.version
            );
            return false;
        }

        self.document.id = Some(saved.id);
        self.document.marker = Some(saved.marker);
        self.last_saved_at = Some(at);

        if saved_from.revision == self.change.revision {
            self.dirty = false;
            if matches!(&self.conflict, Some(c) if c.kind == ConflictKind::StaleWrite) {
                self.conflict = None;
            }
        } else {
            self.conflict = Some(ConflictFlag {
                kind: ConflictKind::StaleWrite,
                message: "Newer edits were made while saving; they will be saved next".to_string(),
                raised_at: at,
            });
        }
        true
    }

    /// Flags a server-side conflict. Dirty state is kept so no edit is lost.
    pub fn set_conflict(&mut self, message: impl Into<String>) {
        self.conflict = Some(ConflictFlag {
            kind: ConflictKind::Server,
            message: message.into(),
            raised_at: Utc::now(),
        });
    }

    /// Adopts the marker from a replayed offline save of this document. Dirty
    /// clears only if the document still matches what was replayed.
    pub fn confirm_replayed(&mut self, saved: SavedDraft, replayed_content: &Value) -> bool {
        if self.document.id != Some(saved.id)
            || !VersionMarker::is_fresh(&saved.marker, self.document.marker.as_ref())
        {
            return false;
        }
        self.document.marker = Some(saved.marker);
        if self.dirty && self.document.content == *replayed_content {
            self.dirty = false;
            self.last_saved_at = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn store() -> DraftStore {
        let mut doc = Document::blank();
        doc.content["contact"]["name"] = json!("John Doe");
        DraftStore::new(doc)
    }

    fn saved(id: Uuid, version: i64) -> SavedDraft {
        SavedDraft {
            id,
            marker: VersionMarker::new(version, Utc.timestamp_opt(version * 100, 0).unwrap()),
        }
    }

    #[test]
    fn test_mutate_sets_field_and_marks_dirty() {
        let mut s = store();
        s.mutate("contact.name", json!("Jane Doe")).unwrap();
        assert_eq!(s.get("contact.name"), Some(&json!("Jane Doe")));
        assert!(s.is_dirty());
        assert!(s.can_undo());
        assert_eq!(s.change().revision, 1);
    }

    #[test]
    fn test_mutate_with_same_value_is_a_no_op() {
        let mut s = store();
        s.mutate("contact.name", json!("John Doe")).unwrap();
        assert!(!s.is_dirty());
        assert!(!s.can_undo());
    }

    #[test]
    fn test_invalid_path_leaves_document_untouched() {
        let mut s = store();
        assert!(s.mutate("summary.0.x", json!(1)).is_err());
        assert!(!s.is_dirty());
        assert_eq!(s.change().revision, 0);
    }

    #[test]
    fn test_undo_redo_bounds_after_sixty_edits() {
        let mut s = store();
        for i in 0..60 {
            s.mutate("summary", json!(format!("draft {i}"))).unwrap();
        }
        assert!(!s.can_redo());

        let mut undos = 0;
        while s.undo() {
            undos += 1;
        }
        assert_eq!(undos, HISTORY_LIMIT);
        assert!(!s.can_undo());
        assert_eq!(s.get("summary"), Some(&json!("draft 9")));

        let mut redos = 0;
        while s.redo() {
            redos += 1;
        }
        assert_eq!(redos, HISTORY_LIMIT);
        assert!(!s.can_redo());
        assert_eq!(s.get("summary"), Some(&json!("draft 59")));
    }

    #[test]
    fn test_undo_and_redo_are_no_ops_at_bounds() {
        let mut s = store();
        assert!(!s.undo());
        assert!(!s.redo());
        assert!(!s.is_dirty());
    }

    #[test]
    fn test_new_edit_after_undo_discards_redo() {
        let mut s = store();
        s.mutate("summary", json!("a")).unwrap();
        s.mutate("summary", json!("b")).unwrap();
        s.undo();
        assert!(s.can_redo());
        s.mutate("summary", json!("c")).unwrap();
        assert!(!s.can_redo());
        assert_eq!(s.history_len(), 3);
        assert_eq!(s.history_index(), 2);
    }

    #[test]
    fn test_load_resets_history_and_bumps_generation() {
        let mut s = store();
        let mut rx = s.subscribe();
        s.mutate("summary", json!("x")).unwrap();
        s.set_conflict("stale");
        s.load(Document::blank());

        assert!(!s.is_dirty());
        assert!(s.conflict().is_none());
        assert_eq!(s.history_len(), 1);
        assert!(!s.can_undo());
        let change = *rx.borrow_and_update();
        assert_eq!(change, DraftChange { generation: 1, revision: 0 });
    }

    #[test]
    fn test_every_edit_path_notifies_subscribers() {
        let mut s = store();
        let rx = s.subscribe();
        s.mutate("summary", json!("x")).unwrap();
        s.undo();
        s.redo();
        assert_eq!(rx.borrow().revision, 3);
    }

    #[test]
    fn test_server_snapshot_is_silent() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mark_saved(s.change(), saved(id, 1), Utc::now());
        let rx = s.subscribe();

        let mut incoming = s.document().clone();
        incoming.content["summary"] = json!("from another session");
        incoming.marker = Some(saved(id, 2).marker);

        assert!(s.apply_server_snapshot(incoming));
        assert!(!s.is_dirty());
        assert!(!s.can_undo());
        assert_eq!(rx.borrow().revision, 0);
        assert_eq!(s.get("summary"), Some(&json!("from another session")));
    }

    #[test]
    fn test_server_snapshot_refused_while_dirty_or_stale() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mark_saved(s.change(), saved(id, 3), Utc::now());

        let mut older = s.document().clone();
        older.marker = Some(saved(id, 2).marker);
        assert!(!s.apply_server_snapshot(older));

        s.mutate("summary", json!("local")).unwrap();
        let mut newer = s.document().clone();
        newer.marker = Some(saved(id, 4).marker);
        assert!(!s.apply_server_snapshot(newer));
        assert_eq!(s.get("summary"), Some(&json!("local")));
    }

    #[test]
    fn test_mark_saved_clears_dirty_when_nothing_changed() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mutate("contact.name", json!("Jane Doe")).unwrap();
        let at = Utc::now();
        assert!(s.mark_saved(s.change(), saved(id, 1), at));
        assert!(!s.is_dirty());
        assert_eq!(s.document().id, Some(id));
        assert_eq!(s.last_saved_at(), Some(at));
    }

    #[test]
    fn test_mark_saved_with_edits_in_flight_raises_stale_write() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mutate("contact.name", json!("Jane Doe")).unwrap();
        let captured = s.change();
        s.mutate("summary", json!("typed during save")).unwrap();

        s.mark_saved(captured, saved(id, 1), Utc::now());
        assert!(s.is_dirty());
        assert_eq!(s.conflict().map(|c| c.kind), Some(ConflictKind::StaleWrite));

        s.mutate("summary", json!("more")).unwrap();
        assert!(s.conflict().is_none());
    }

    #[test]
    fn test_mark_saved_ignores_previous_document_and_old_markers() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mutate("summary", json!("x")).unwrap();
        let captured = s.change();
        s.load(Document::blank());
        assert!(!s.mark_saved(captured, saved(id, 1), Utc::now()));
        assert!(s.document().id.is_none());

        s.mark_saved(s.change(), saved(id, 5), Utc::now());
        assert!(!s.mark_saved(s.change(), saved(id, 4), Utc::now()));
        assert_eq!(s.document().marker.map(|m| m.version), Some(5));
    }

    #[test]
    fn test_server_conflict_survives_edits_until_reload() {
        let mut s = store();
        s.mutate("summary", json!("mine")).unwrap();
        s.set_conflict("modified elsewhere");
        s.mutate("summary", json!("still mine")).unwrap();
        assert!(s.has_server_conflict());
        assert!(s.is_dirty());

        s.reload_authoritative(Document::blank());
        assert!(!s.has_server_conflict());
    }

    #[test]
    fn test_confirm_replayed_clears_dirty_for_matching_content() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mark_saved(s.change(), saved(id, 1), Utc::now());
        s.mutate("summary", json!("offline edit")).unwrap();
        let replayed = s.document().content.clone();

        assert!(s.confirm_replayed(saved(id, 2), &replayed));
        assert!(!s.is_dirty());
        assert_eq!(s.document().marker.map(|m| m.version), Some(2));
    }

    #[test]
    fn test_confirm_replayed_keeps_newer_edits_dirty() {
        let id = Uuid::new_v4();
        let mut s = store();
        s.mark_saved(s.change(), saved(id, 1), Utc::now());
        s.mutate("summary", json!("offline edit")).unwrap();
        let replayed = s.document().content.clone();
        s.mutate("summary", json!("edited after queueing")).unwrap();

        assert!(s.confirm_replayed(saved(id, 2), &replayed));
        assert!(s.is_dirty());
    }
}

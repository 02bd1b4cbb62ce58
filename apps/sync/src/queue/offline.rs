use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{ApiError, ReplayTransport};
use crate::errors::SyncError;
use crate::queue::storage::QueueStorage;

/// Held by whoever is writing a queued resource to the server. Replay holds it
/// for a whole pass, so a direct save can't race a replay of the same draft.
pub type WritePermit<'a> = tokio::sync::MutexGuard<'a, ()>;

/// Fixed storage key the whole queue is serialized under.
pub const QUEUE_STORAGE_KEY: &str = "profile-sync.offline-queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Save,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Save => "save",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// A mutating request that failed for lack of connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub endpoint: String,
    pub payload: Value,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedOperation {
    pub fn new(kind: OperationKind, endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            endpoint: endpoint.into(),
            payload,
            attempt_count: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Oldest operations are evicted once this many are pending.
    pub capacity: usize,
    /// Failed replays allowed before an operation is dropped.
    pub max_attempts: u32,
    /// Operations older than this are pruned on open.
    pub max_age: chrono::Duration,
    /// Pause between two replayed operations.
    pub replay_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            max_attempts: 3,
            max_age: chrono::Duration::hours(24),
            replay_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayedOperation {
    pub operation: QueuedOperation,
    pub response: Option<Value>,
}

/// Outcome of one [`OfflineQueue::flush`] pass.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub replayed: Vec<ReplayedOperation>,
    /// Failed on the network again; still queued with a bumped attempt count.
    pub retried: Vec<QueuedOperation>,
    /// Exhausted their attempts and were removed.
    pub dropped: Vec<QueuedOperation>,
    /// Rejected because the server copy moved on. Removed.
    pub conflicts: Vec<(QueuedOperation, String)>,
    /// Rejected deterministically by the server. Removed.
    pub rejected: Vec<(QueuedOperation, String)>,
}

impl FlushReport {
    pub fn attempted(&self) -> usize {
        self.replayed.len()
            + self.retried.len()
            + self.dropped.len()
            + self.conflicts.len()
            + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempted() == 0
    }
}

/// Durable, capacity-bounded FIFO of failed writes.
///
/// Every change to the contents is written through to [`QueueStorage`] so
/// the queue survives a restart. Replay is strictly sequential; a second
/// `flush` waits for the first to finish.
pub struct OfflineQueue {
    config: QueueConfig,
    storage: Arc<dyn QueueStorage>,
    operations: Mutex<VecDeque<QueuedOperation>>,
    writes: tokio::sync::Mutex<()>,
    pending: watch::Sender<usize>,
}

impl OfflineQueue {
    pub fn open(storage: Arc<dyn QueueStorage>, config: QueueConfig) -> Result<Self, SyncError> {
        Self::open_at(storage, config, Utc::now())
    }

    /// Loads the persisted queue and prunes anything older than `max_age`
    /// relative to `now`. An unreadable payload is discarded rather than
    /// blocking startup.
    pub fn open_at(
        storage: Arc<dyn QueueStorage>,
        config: QueueConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let operations = match storage.read(QUEUE_STORAGE_KEY)? {
            None => VecDeque::new(),
            Some(raw) => match serde_json::from_str::<VecDeque<QueuedOperation>>(&raw) {
                Ok(ops) => ops,
                Err(e) => {
                    warn!("Discarding unreadable offline queue: {e}");
                    VecDeque::new()
                }
            },
        };

        let (pending, _) = watch::channel(operations.len());
        let queue = Self {
            config,
            storage,
            operations: Mutex::new(operations),
            writes: tokio::sync::Mutex::new(()),
            pending,
        };

        let pruned = queue.prune(now)?;
        if pruned > 0 {
            info!("Pruned {pruned} expired offline operation(s)");
        }
        info!("Offline queue loaded with {} pending operation(s)", queue.len());
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedOperation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, operations: &VecDeque<QueuedOperation>) -> Result<(), SyncError> {
        self.pending.send_if_modified(|len| {
            let changed = *len != operations.len();
            *len = operations.len();
            changed
        });
        let raw = serde_json::to_string(operations)?;
        self.storage.write(QUEUE_STORAGE_KEY, &raw)
    }

    /// Persists during replay, where a storage failure must not abort the pass.
    fn persist_quietly(&self, operations: &VecDeque<QueuedOperation>) {
        if let Err(e) = self.persist(operations) {
            warn!("Failed to persist offline queue: {e}");
        }
    }

    /// Appends an operation, evicting the oldest when at capacity.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Result<QueuedOperation, SyncError> {
        let operation = QueuedOperation::new(kind, endpoint, payload);
        let mut operations = self.lock();
        self.push_bounded(&mut operations, operation.clone());
        self.persist(&operations)?;
        warn!(
            "Queued {} {} for replay ({} pending)",
            operation.kind,
            operation.endpoint,
            operations.len()
        );
        Ok(operation)
    }

    /// Replaces the payload of a pending operation with the same kind and
    /// endpoint, keeping its place in line. Enqueues when there is none.
    pub fn upsert(
        &self,
        kind: OperationKind,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Result<QueuedOperation, SyncError> {
        let endpoint = endpoint.into();
        let mut operations = self.lock();
        let existing = operations
            .iter_mut()
            .find(|op| op.kind == kind && op.endpoint == endpoint);

        let operation = match existing {
            Some(op) => {
                op.payload = payload;
                op.attempt_count = 0;
                op.enqueued_at = Utc::now();
                debug!("Replaced queued {kind} {endpoint} in place");
                op.clone()
            }
            None => {
                let op = QueuedOperation::new(kind, endpoint, payload);
                self.push_bounded(&mut operations, op.clone());
                warn!(
                    "Queued {} {} for replay ({} pending)",
                    op.kind,
                    op.endpoint,
                    operations.len()
                );
                op
            }
        };
        self.persist(&operations)?;
        Ok(operation)
    }

    fn push_bounded(&self, operations: &mut VecDeque<QueuedOperation>, operation: QueuedOperation) {
        let capacity = self.config.capacity.max(1);
        while operations.len() >= capacity {
            if let Some(evicted) = operations.pop_front() {
                warn!(
                    "Offline queue full; evicting {} {} queued at {}",
                    evicted.kind, evicted.endpoint, evicted.enqueued_at
                );
            }
        }
        operations.push_back(operation);
    }

    pub fn dequeue(&self, id: Uuid) -> Result<Option<QueuedOperation>, SyncError> {
        let mut operations = self.lock();
        let Some(index) = operations.iter().position(|op| op.id == id) else {
            return Ok(None);
        };
        let removed = operations.remove(index);
        self.persist(&operations)?;
        Ok(removed)
    }

    /// Removes any pending operation of `kind` on `endpoint`, e.g. a queued
    /// save made obsolete by a direct one. Returns how many were removed.
    pub fn discard(&self, kind: OperationKind, endpoint: &str) -> Result<usize, SyncError> {
        let mut operations = self.lock();
        let before = operations.len();
        operations.retain(|op| !(op.kind == kind && op.endpoint == endpoint));
        let discarded = before - operations.len();
        if discarded > 0 {
            self.persist(&operations)?;
            debug!("Discarded {discarded} queued {kind} {endpoint}");
        }
        Ok(discarded)
    }

    /// Pending operation count, updated on every change.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    /// Waits until no replay or other permit holder is writing.
    pub async fn write_permit(&self) -> WritePermit<'_> {
        self.writes.lock().await
    }

    /// Pending operations in replay order.
    pub fn list(&self) -> Vec<QueuedOperation> {
        self.lock().iter().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<QueuedOperation> {
        self.lock().iter().find(|op| op.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops operations older than `max_age`. Returns how many were dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let max_age = self.config.max_age;
        let mut operations = self.lock();
        let before = operations.len();
        operations.retain(|op| now.signed_duration_since(op.enqueued_at) <= max_age);
        let pruned = before - operations.len();
        if pruned > 0 {
            self.persist(&operations)?;
        }
        Ok(pruned)
    }

    /// Replays every pending operation once, oldest first, with
    /// `replay_delay` between calls.
    ///
    /// Success removes the operation. A network failure bumps its attempt
    /// count and drops it once `max_attempts` is reached. Conflicts and other
    /// server rejections are removed immediately and reported.
    pub async fn flush(&self, transport: &dyn ReplayTransport) -> FlushReport {
        let permit = self.write_permit().await;
        self.flush_with(&permit, transport).await
    }

    /// [`OfflineQueue::flush`] under a permit the caller already holds, so
    /// follow-up work on the report happens before other writers resume.
    pub async fn flush_with(
        &self,
        _permit: &WritePermit<'_>,
        transport: &dyn ReplayTransport,
    ) -> FlushReport {
        let mut report = FlushReport::default();

        let pending: Vec<Uuid> = self.lock().iter().map(|op| op.id).collect();
        if pending.is_empty() {
            return report;
        }
        info!("Replaying {} offline operation(s)", pending.len());

        for (i, id) in pending.into_iter().enumerate() {
            if i > 0 && !self.config.replay_delay.is_zero() {
                tokio::time::sleep(self.config.replay_delay).await;
            }
            // Re-read: the operation may have been dequeued or upserted meanwhile.
            let Some(operation) = self.get(id) else {
                continue;
            };

            match transport.replay(&operation).await {
                Ok(response) => {
                    if self.remove_if_unchanged(&operation) {
                        debug!("Replayed {} {}", operation.kind, operation.endpoint);
                    }
                    report.replayed.push(ReplayedOperation {
                        operation,
                        response,
                    });
                }
                Err(e) if e.is_network() => match self.record_failure(id) {
                    Some(failed) if failed.attempt_count >= self.config.max_attempts => {
                        self.remove(id);
                        warn!(
                            "Dropping {} {} after {} failed attempts",
                            failed.kind, failed.endpoint, failed.attempt_count
                        );
                        report.dropped.push(failed);
                    }
                    Some(failed) => report.retried.push(failed),
                    None => {}
                },
                Err(ApiError::Conflict { message, .. }) => {
                    self.remove(id);
                    warn!(
                        "Replay of {} {} conflicted: {message}",
                        operation.kind, operation.endpoint
                    );
                    report.conflicts.push((operation, message));
                }
                Err(e) => {
                    self.remove(id);
                    warn!(
                        "Replay of {} {} rejected: {e}",
                        operation.kind, operation.endpoint
                    );
                    report.rejected.push((operation, e.to_string()));
                }
            }
        }

        info!(
            "Offline replay finished: {} replayed, {} retrying, {} dropped",
            report.replayed.len(),
            report.retried.len(),
            report.dropped.len() + report.conflicts.len() + report.rejected.len()
        );
        report
    }

    fn remove(&self, id: Uuid) {
        let mut operations = self.lock();
        operations.retain(|op| op.id != id);
        self.persist_quietly(&operations);
    }

    /// Removes a replayed operation unless its payload was replaced while the
    /// request was in flight, in which case the newer payload stays queued.
    fn remove_if_unchanged(&self, replayed: &QueuedOperation) -> bool {
        let mut operations = self.lock();
        let Some(index) = operations.iter().position(|op| op.id == replayed.id) else {
            return false;
        };
        if operations[index].payload != replayed.payload {
            return false;
        }
        operations.remove(index);
        self.persist_quietly(&operations);
        true
    }

    fn record_failure(&self, id: Uuid) -> Option<QueuedOperation> {
        let mut operations = self.lock();
        let op = operations.iter_mut().find(|op| op.id == id)?;
        op.attempt_count += 1;
        let updated = op.clone();
        self.persist_quietly(&operations);
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fakes::{FakeReplay, Scripted};
    use crate::queue::storage::MemoryQueueStorage;
    use serde_json::json;

    fn memory() -> Arc<dyn QueueStorage> {
        Arc::new(MemoryQueueStorage::new())
    }

    fn queue_on(storage: Arc<dyn QueueStorage>) -> OfflineQueue {
        OfflineQueue::open(storage, QueueConfig::default()).unwrap()
    }

    #[test]
    fn test_enqueue_persists_in_order() {
        let storage = memory();
        let queue = queue_on(storage.clone());
        queue
            .enqueue(OperationKind::Save, "/drafts/1", json!({"n": 1}))
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, "/files/2", json!(null))
            .unwrap();

        let reopened = queue_on(storage);
        let endpoints: Vec<_> = reopened.list().into_iter().map(|op| op.endpoint).collect();
        assert_eq!(endpoints, vec!["/drafts/1", "/files/2"]);
    }

    #[test]
    fn test_enqueue_evicts_oldest_at_capacity() {
        let queue = OfflineQueue::open(
            memory(),
            QueueConfig {
                capacity: 2,
                ..QueueConfig::default()
            },
        )
        .unwrap();
        for n in 0..3 {
            queue
                .enqueue(OperationKind::Update, format!("/files/{n}"), json!({}))
                .unwrap();
        }
        let endpoints: Vec<_> = queue.list().into_iter().map(|op| op.endpoint).collect();
        assert_eq!(endpoints, vec!["/files/1", "/files/2"]);
    }

    #[test]
    fn test_open_prunes_entries_older_than_a_day() {
        let storage = memory();
        let now = Utc::now();
        let mut stale = QueuedOperation::new(OperationKind::Save, "/drafts/old", json!({}));
        stale.enqueued_at = now - chrono::Duration::hours(25);
        let mut fresh = QueuedOperation::new(OperationKind::Save, "/drafts/new", json!({}));
        fresh.enqueued_at = now - chrono::Duration::hours(1);
        storage
            .write(
                QUEUE_STORAGE_KEY,
                &serde_json::to_string(&vec![stale, fresh]).unwrap(),
            )
            .unwrap();

        let queue = OfflineQueue::open_at(storage.clone(), QueueConfig::default(), now).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.list()[0].endpoint, "/drafts/new");
        // The prune is written back.
        let raw = storage.read(QUEUE_STORAGE_KEY).unwrap().unwrap();
        assert!(!raw.contains("/drafts/old"));
    }

    #[test]
    fn test_unreadable_storage_starts_empty() {
        let storage = memory();
        storage.write(QUEUE_STORAGE_KEY, "not json").unwrap();
        assert!(queue_on(storage).is_empty());
    }

    #[test]
    fn test_upsert_replaces_payload_in_place() {
        let queue = queue_on(memory());
        let first = queue
            .upsert(OperationKind::Save, "/drafts/1", json!({"rev": 1}))
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, "/files/9", json!(null))
            .unwrap();
        let second = queue
            .upsert(OperationKind::Save, "/drafts/1", json!({"rev": 2}))
            .unwrap();

        assert_eq!(first.id, second.id);
        let ops = queue.list();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].payload, json!({"rev": 2}));
    }

    #[test]
    fn test_dequeue_removes_by_id() {
        let queue = queue_on(memory());
        let op = queue
            .enqueue(OperationKind::Save, "/drafts/1", json!({}))
            .unwrap();
        assert_eq!(queue.dequeue(op.id).unwrap().map(|o| o.id), Some(op.id));
        assert!(queue.dequeue(op.id).unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_replays_in_enqueue_order_and_clears() {
        let queue = queue_on(memory());
        for n in 1..=3 {
            queue
                .enqueue(OperationKind::Save, format!("/drafts/{n}"), json!({ "n": n }))
                .unwrap();
        }
        let transport = FakeReplay::succeeding();

        let report = queue.flush(&transport).await;

        assert_eq!(report.replayed.len(), 3);
        assert_eq!(
            transport.endpoints(),
            vec!["/drafts/1", "/drafts/2", "/drafts/3"]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drops_after_retry_ceiling() {
        let queue = queue_on(memory());
        for n in 1..=3 {
            queue
                .enqueue(OperationKind::Save, format!("/drafts/{n}"), json!({}))
                .unwrap();
        }
        let transport = FakeReplay::failing_with(Scripted::Network);

        for round in 1..=2 {
            let report = queue.flush(&transport).await;
            assert_eq!(report.retried.len(), 3, "round {round}");
            assert!(queue.list().iter().all(|op| op.attempt_count == round));
        }
        let report = queue.flush(&transport).await;
        assert_eq!(report.dropped.len(), 3);
        assert!(queue.is_empty());

        // Nothing left to retry.
        let before = transport.calls().len();
        assert!(queue.flush(&transport).await.is_empty());
        assert_eq!(transport.calls().len(), before);
        assert_eq!(before, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_removes_conflicts_and_rejections() {
        let queue = queue_on(memory());
        queue
            .enqueue(OperationKind::Save, "/drafts/1", json!({}))
            .unwrap();
        queue
            .enqueue(OperationKind::Update, "/files/2", json!({}))
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, "/files/3", json!(null))
            .unwrap();
        let transport = FakeReplay::scripted(vec![
            Scripted::Conflict,
            Scripted::Server(422),
            Scripted::Network,
        ]);

        let report = queue.flush(&transport).await;

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.retried.len(), 1);
        assert_eq!(queue.list()[0].endpoint, "/files/3");
    }

    #[test]
    fn test_discard_removes_matching_saves_only() {
        let queue = queue_on(memory());
        queue
            .upsert(OperationKind::Save, "/drafts/1", json!({"rev": 1}))
            .unwrap();
        queue
            .enqueue(OperationKind::Delete, "/drafts/1", json!(null))
            .unwrap();
        let mut pending = queue.subscribe();
        assert_eq!(*pending.borrow_and_update(), 2);

        assert_eq!(queue.discard(OperationKind::Save, "/drafts/1").unwrap(), 1);
        assert_eq!(queue.discard(OperationKind::Save, "/drafts/1").unwrap(), 0);
        assert_eq!(queue.list()[0].kind, OperationKind::Delete);
        assert!(pending.has_changed().unwrap());
        assert_eq!(*pending.borrow_and_update(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_write_permit() {
        let queue = Arc::new(queue_on(memory()));
        queue
            .enqueue(OperationKind::Save, "/drafts/1", json!({}))
            .unwrap();
        let transport = Arc::new(FakeReplay::succeeding());

        let permit = queue.write_permit().await;
        let flushing = {
            let (queue, transport) = (queue.clone(), transport.clone());
            tokio::spawn(async move { queue.flush(transport.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(transport.calls().is_empty());

        drop(permit);
        let report = flushing.await.unwrap();
        assert_eq!(report.replayed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flushes_are_serialized() {
        let queue = queue_on(memory());
        queue
            .enqueue(OperationKind::Save, "/drafts/1", json!({}))
            .unwrap();
        queue
            .enqueue(OperationKind::Save, "/drafts/2", json!({}))
            .unwrap();
        let transport = FakeReplay::succeeding();

        let (first, second) = tokio::join!(queue.flush(&transport), queue.flush(&transport));

        assert_eq!(first.replayed.len() + second.replayed.len(), 2);
        assert_eq!(transport.calls().len(), 2);
    }
}

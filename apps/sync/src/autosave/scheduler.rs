//! Debounced autosave.
//!
//! State machine: `idle -> pending (timer armed) -> saving -> idle`, with
//! `saving -> conflict` and `saving -> idle-with-error` branches. Edits while
//! pending re-arm the single timer; edits while saving are picked up once the
//! save resolves, so two saves for one document never overlap. A save also
//! waits out any replay of the offline queue and then reads the marker that
//! replay left behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{draft_endpoint, ApiError, DraftApi, SavedDraft, UpdateDraftRequest};
use crate::connectivity::Connectivity;
use crate::draft::{lock, DocumentValidator, DraftChange, SharedDraft, ValidationReport};
use crate::models::Document;
use crate::queue::{OfflineQueue, OperationKind};

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    /// How long the document must go without edits before it is saved.
    pub quiet_period: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            quiet_period: DEFAULT_QUIET_PERIOD,
        }
    }
}

/// Result of one save attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Nothing to save.
    Clean,
    Saved(SavedDraft),
    /// Blocked locally; the network was never contacted.
    Invalid(ValidationReport),
    Conflict(String),
    /// Network unavailable; held in the offline queue under this operation id.
    Queued(Uuid),
    Failed(String),
    /// The response arrived for a document or marker that has since moved on.
    Superseded,
}

/// What the editor shows next to the document.
#[derive(Debug, Clone, PartialEq)]
pub enum AutosaveStatus {
    Idle,
    Pending,
    Saving,
    Saved { version: i64 },
    Invalid(ValidationReport),
    Conflict(String),
    /// "Will sync when reconnected."
    Queued,
    Failed(String),
}

impl From<&SaveOutcome> for AutosaveStatus {
    fn from(outcome: &SaveOutcome) -> Self {
        match outcome {
            SaveOutcome::Clean | SaveOutcome::Superseded => AutosaveStatus::Idle,
            SaveOutcome::Saved(saved) => AutosaveStatus::Saved {
                version: saved.marker.version,
            },
            SaveOutcome::Invalid(report) => AutosaveStatus::Invalid(report.clone()),
            SaveOutcome::Conflict(message) => AutosaveStatus::Conflict(message.clone()),
            SaveOutcome::Queued(_) => AutosaveStatus::Queued,
            SaveOutcome::Failed(message) => AutosaveStatus::Failed(message.clone()),
        }
    }
}

#[derive(Debug)]
enum Command {
    SaveNow,
    Cancel,
    Shutdown,
}

pub struct Autosave {
    draft: SharedDraft,
    api: Arc<dyn DraftApi>,
    queue: Arc<OfflineQueue>,
    validator: Arc<dyn DocumentValidator>,
    connectivity: Connectivity,
    config: AutosaveConfig,
    status: watch::Sender<AutosaveStatus>,
}

impl Autosave {
    pub fn new(
        draft: SharedDraft,
        api: Arc<dyn DraftApi>,
        queue: Arc<OfflineQueue>,
        validator: Arc<dyn DocumentValidator>,
        connectivity: Connectivity,
        config: AutosaveConfig,
    ) -> Self {
        let (status, _) = watch::channel(AutosaveStatus::Idle);
        Self {
            draft,
            api,
            queue,
            validator,
            connectivity,
            config,
            status,
        }
    }

    /// Starts the debounce loop on the current runtime.
    pub fn spawn(self) -> AutosaveHandle {
        let changes = lock(&self.draft).subscribe();
        let (commands, receiver) = mpsc::unbounded_channel();
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run(changes, receiver));
        AutosaveHandle {
            commands,
            status,
            task,
        }
    }

    fn publish(&self, status: AutosaveStatus) {
        self.status.send_replace(status);
    }

    async fn run(
        self,
        mut changes: watch::Receiver<DraftChange>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut generation = changes.borrow().generation;
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let change = *changes.borrow_and_update();
                    if change.generation != generation {
                        generation = change.generation;
                        if deadline.take().is_some() {
                            debug!("Document switched; pending autosave cancelled");
                        }
                        self.publish(AutosaveStatus::Idle);
                        continue;
                    }
                    deadline = Some(Instant::now() + self.config.quiet_period);
                    self.publish(AutosaveStatus::Pending);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.save_now().await;
                }
                command = commands.recv() => match command {
                    Some(Command::SaveNow) => {
                        deadline = None;
                        self.save_now().await;
                    }
                    Some(Command::Cancel) => {
                        if deadline.take().is_some() {
                            debug!("Pending autosave cancelled");
                            self.publish(AutosaveStatus::Idle);
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }
        debug!("Autosave loop stopped");
    }

    /// Saves the latest state of the document right away and publishes the
    /// resulting status. The document is read at call time, never from an
    /// earlier capture.
    pub async fn save_now(&self) -> SaveOutcome {
        let outcome = self.attempt_save().await;
        self.publish(AutosaveStatus::from(&outcome));
        outcome
    }

    async fn attempt_save(&self) -> SaveOutcome {
        let _permit = self.queue.write_permit().await;
        let snapshot = {
            let store = lock(&self.draft);
            if !store.is_dirty() {
                return SaveOutcome::Clean;
            }
            if store.has_server_conflict() {
                let message = store
                    .conflict()
                    .map(|c| c.message.clone())
                    .unwrap_or_default();
                debug!("Autosave held back by unresolved conflict");
                return SaveOutcome::Conflict(message);
            }
            store.snapshot()
        };

        let report = self.validator.validate(&snapshot.document);
        if !report.passed {
            warn!("Autosave skipped, document invalid: {}", report.summary());
            return SaveOutcome::Invalid(report);
        }

        self.publish(AutosaveStatus::Saving);
        match snapshot.document.id {
            Some(id) => self.save_existing(id, snapshot.document, snapshot.change).await,
            None => self.create(snapshot.document, snapshot.change).await,
        }
    }

    async fn save_existing(&self, id: Uuid, document: Document, change: DraftChange) -> SaveOutcome {
        let request = UpdateDraftRequest::new(document.content, document.marker);

        if !self.connectivity.is_online() {
            debug!("Offline; queueing save of draft {id}");
            return self.enqueue(id, &request);
        }

        match self.api.update_draft(id, &request).await {
            Ok(saved) => {
                // Anything still queued for this draft is older than what just landed.
                if let Err(e) = self.queue.discard(OperationKind::Save, &draft_endpoint(id)) {
                    warn!("Could not drop superseded queued save of draft {id}: {e}");
                }
                self.adopt(change, saved)
            }
            Err(ApiError::Conflict { message, .. }) => {
                warn!("Save of draft {id} rejected as stale: {message}");
                lock(&self.draft).set_conflict(message.clone());
                SaveOutcome::Conflict(message)
            }
            Err(e) if e.is_network() => {
                warn!("Save of draft {id} failed on the network: {e}");
                self.enqueue(id, &request)
            }
            Err(e) => {
                error!("Save of draft {id} failed: {e}");
                SaveOutcome::Failed(e.to_string())
            }
        }
    }

    async fn create(&self, document: Document, change: DraftChange) -> SaveOutcome {
        if !self.connectivity.is_online() {
            return SaveOutcome::Failed(
                "Offline: the first save of a new profile needs a connection".to_string(),
            );
        }
        match self.api.create_draft(&document.content).await {
            Ok(saved) => self.adopt(change, saved),
            Err(e) => {
                error!("Creating draft failed: {e}");
                SaveOutcome::Failed(e.to_string())
            }
        }
    }

    fn enqueue(&self, id: Uuid, request: &UpdateDraftRequest) -> SaveOutcome {
        let payload = match serde_json::to_value(request) {
            Ok(payload) => payload,
            Err(e) => return SaveOutcome::Failed(e.to_string()),
        };
        match self
            .queue
            .upsert(OperationKind::Save, draft_endpoint(id), payload)
        {
            Ok(operation) => SaveOutcome::Queued(operation.id),
            Err(e) => {
                error!("Could not queue save of draft {id}: {e}");
                SaveOutcome::Failed(e.to_string())
            }
        }
    }

    fn adopt(&self, change: DraftChange, saved: SavedDraft) -> SaveOutcome {
        if lock(&self.draft).mark_saved(change, saved, Utc::now()) {
            info!("Saved draft {} at version {}", saved.id, saved.marker.version);
            SaveOutcome::Saved(saved)
        } else {
            SaveOutcome::Superseded
        }
    }
}

/// Control surface for a spawned [`Autosave`] loop.
pub struct AutosaveHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<AutosaveStatus>,
    task: JoinHandle<()>,
}

impl AutosaveHandle {
    /// Skips the rest of the quiet period.
    pub fn save_now(&self) {
        let _ = self.commands.send(Command::SaveNow);
    }

    /// Disarms a pending timer. An in-flight save still completes.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    pub fn status(&self) -> AutosaveStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AutosaveStatus> {
        self.status.clone()
    }

    /// Stops the loop after any in-flight save resolves.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Autosave task ended abnormally: {e}");
        }
    }
}

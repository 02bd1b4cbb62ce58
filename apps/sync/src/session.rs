//! One editing session: the draft with its autosave loop, the offline queue,
//! the connectivity monitor, the push consumer and the periodic resync, all
//! running on the same runtime and sharing state through short-lived locks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{draft_endpoint, DraftApi, RecordApi, ReplayTransport, SavedDraft};
use crate::autosave::{Autosave, AutosaveConfig, AutosaveHandle};
use crate::collection::{CollectionView, ListQuery, DEFAULT_PAGE_SIZE};
use crate::connectivity::Connectivity;
use crate::draft::{lock, DocumentValidator, SharedDraft};
use crate::errors::SyncError;
use crate::queue::{FlushReport, OfflineQueue, OperationKind};
use crate::realtime::{
    parse_push_message, Backoff, PushChannel, PushEvent, PushMessage, PushTransport,
    ReconcileOutcome, Reconciler,
};

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub autosave: AutosaveConfig,
    pub page_size: u32,
    /// Full page refetch cadence, closing gaps left by lost push events.
    pub resync_interval: Duration,
    pub backoff: Backoff,
    /// Treat push connect/disconnect as the online/offline signal.
    pub push_drives_connectivity: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave: AutosaveConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff: Backoff::default(),
            push_drives_connectivity: false,
        }
    }
}

/// The collaborators a session talks to.
#[derive(Clone)]
pub struct Services {
    pub drafts: Arc<dyn DraftApi>,
    pub records: Arc<dyn RecordApi>,
    pub replay: Arc<dyn ReplayTransport>,
    pub push: Arc<dyn PushTransport>,
    pub queue: Arc<OfflineQueue>,
    pub validator: Arc<dyn DocumentValidator>,
}

struct Shared {
    draft: SharedDraft,
    services: Services,
    connectivity: Connectivity,
    reconciler: Mutex<Reconciler>,
    push_drives_connectivity: bool,
}

pub struct SyncSession {
    shared: Arc<Shared>,
    autosave: AutosaveHandle,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncSession {
    /// Spawns the session's background tasks on the current runtime.
    pub fn start(
        draft: SharedDraft,
        services: Services,
        connectivity: Connectivity,
        config: SessionConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            draft: draft.clone(),
            services: services.clone(),
            connectivity: connectivity.clone(),
            reconciler: Mutex::new(
                Reconciler::new(ListQuery::with_page_size(config.page_size))
                    .with_retention(config.resync_interval.saturating_mul(2)),
            ),
            push_drives_connectivity: config.push_drives_connectivity,
        });

        let autosave = Autosave::new(
            draft,
            services.drafts.clone(),
            services.queue.clone(),
            services.validator.clone(),
            connectivity,
            config.autosave.clone(),
        )
        .spawn();

        let (stop, _) = watch::channel(false);
        let (channel, messages) = PushChannel::new(services.push.clone(), config.backoff);
        let tasks = vec![
            tokio::spawn(monitor_connectivity(
                shared.clone(),
                config.backoff,
                stop.subscribe(),
            )),
            tokio::spawn(consume_push(shared.clone(), channel, messages, stop.subscribe())),
            tokio::spawn(resync_periodically(
                shared.clone(),
                config.resync_interval,
                stop.subscribe(),
            )),
        ];
        info!("Sync session started");

        Self {
            shared,
            autosave,
            stop,
            tasks,
        }
    }

    pub fn draft(&self) -> &SharedDraft {
        &self.shared.draft
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.shared.connectivity
    }

    pub fn autosave(&self) -> &AutosaveHandle {
        &self.autosave
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.shared.services.queue
    }

    /// A copy of the visible page.
    pub fn view(&self) -> CollectionView {
        self.shared.reconciler().view().clone()
    }

    /// Switches page, sort or filter and fetches the new page.
    pub async fn navigate(&self, query: ListQuery) -> Result<(), SyncError> {
        self.shared.reconciler().navigate(query);
        self.shared.refetch().await
    }

    pub async fn refetch(&self) -> Result<(), SyncError> {
        self.shared.refetch().await
    }

    pub async fn flush_queue(&self) -> FlushReport {
        self.shared.flush_queue().await
    }

    /// Replaces the local draft with the server copy, discarding unsaved
    /// edits. The way out of a save conflict.
    pub async fn reload_draft(&self) -> Result<(), SyncError> {
        let id = lock(&self.shared.draft)
            .document()
            .id
            .ok_or_else(|| SyncError::NotFound("draft has never been saved".to_string()))?;
        let document = self.shared.services.drafts.fetch_draft(id).await?;
        lock(&self.shared.draft).reload_authoritative(document);
        info!("Draft {id} reloaded from server");
        Ok(())
    }

    /// Loads another draft, cancelling any pending autosave of the current one.
    pub async fn open_draft(&self, id: Uuid) -> Result<(), SyncError> {
        let document = self.shared.services.drafts.fetch_draft(id).await?;
        lock(&self.shared.draft).load(document);
        info!("Opened draft {id}");
        Ok(())
    }

    /// Stops background work. An in-flight save or replay completes first.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        self.autosave.shutdown().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {e}");
            }
        }
        info!("Sync session stopped");
    }
}

impl Shared {
    fn reconciler(&self) -> MutexGuard<'_, Reconciler> {
        self.reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn refetch(&self) -> Result<(), SyncError> {
        let query = self.reconciler().query().clone();
        let page = self.services.records.list_records(&query).await?;
        if self.reconciler().adopt_page(&query, page) {
            debug!("Page {} refetched", query.page);
        }
        Ok(())
    }

    /// Replays the queue and settles the draft before autosave may write again.
    async fn flush_queue(&self) -> FlushReport {
        let queue = &self.services.queue;
        let permit = queue.write_permit().await;
        let report = queue.flush_with(&permit, self.services.replay.as_ref()).await;
        self.apply_flush_report(&report);
        drop(permit);
        report
    }

    /// Hands replayed saves of the open draft back to the draft store.
    fn apply_flush_report(&self, report: &FlushReport) {
        let mut draft = lock(&self.draft);
        let Some(id) = draft.document().id else {
            return;
        };
        let endpoint = draft_endpoint(id);
        let is_draft_save =
            |kind: OperationKind, op_endpoint: &str| kind == OperationKind::Save && op_endpoint == endpoint;

        for replayed in &report.replayed {
            let operation = &replayed.operation;
            if !is_draft_save(operation.kind, &operation.endpoint) {
                continue;
            }
            let saved = replayed
                .response
                .clone()
                .and_then(|body| serde_json::from_value::<SavedDraft>(body).ok());
            let content = operation.payload.get("content").unwrap_or(&Value::Null);
            match saved {
                Some(saved) if draft.confirm_replayed(saved, content) => {
                    info!("Queued save of draft {id} landed at version {}", saved.marker.version)
                }
                _ => debug!("Queued save of draft {id} replayed without a usable marker"),
            }
        }

        for (operation, message) in &report.conflicts {
            if !is_draft_save(operation.kind, &operation.endpoint) {
                continue;
            }
            // A save queued against a marker the draft has since moved past is obsolete.
            let based_on = operation.payload.get("lastKnownVersion").and_then(Value::as_i64);
            let current = draft.document().marker.map(|m| m.version);
            if based_on == current {
                draft.set_conflict(message.clone());
            } else {
                debug!("Obsolete queued save of draft {id} conflicted; ignored");
            }
        }
    }

    async fn handle_push(&self, raw: &str) {
        let event = match parse_push_message(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed push message: {e}");
                return;
            }
        };
        let touched_draft = self.touches_open_draft(&event);

        let outcome = self.reconciler().apply(event);
        if outcome == ReconcileOutcome::Refetch {
            if let Err(e) = self.refetch().await {
                warn!("Page refetch after push event failed: {e}");
            }
        }
        if let Some(id) = touched_draft {
            self.refresh_draft(id).await;
        }
    }

    /// An update to the open draft made elsewhere, newer than what we hold.
    fn touches_open_draft(&self, event: &PushEvent) -> Option<Uuid> {
        let PushEvent::FileUpdated { file_id, file } = event else {
            return None;
        };
        let draft = lock(&self.draft);
        let document = draft.document();
        let newer = match document.marker {
            Some(local) => file.marker > local,
            None => true,
        };
        (document.id == Some(*file_id) && newer).then_some(*file_id)
    }

    /// Pulls the server copy into a clean draft without marking it dirty.
    async fn refresh_draft(&self, id: Uuid) {
        if lock(&self.draft).is_dirty() {
            debug!("Draft {id} changed remotely while edited locally; keeping local edits");
            return;
        }
        match self.services.drafts.fetch_draft(id).await {
            Ok(document) => {
                if lock(&self.draft).apply_server_snapshot(document) {
                    info!("Draft {id} refreshed from server");
                }
            }
            Err(e) => warn!("Fetching draft {id} failed: {e}"),
        }
    }
}

/// Flushes the queue on every offline to online transition. While online, a
/// non-empty queue is retried on `backoff`, which covers saves that failed on
/// the network without connectivity ever reporting offline.
async fn monitor_connectivity(
    shared: Arc<Shared>,
    backoff: Backoff,
    mut stop: watch::Receiver<bool>,
) {
    let mut online = shared.connectivity.subscribe();
    let mut pending = shared.services.queue.subscribe();
    let mut was_online = *online.borrow_and_update();
    if was_online && !shared.services.queue.is_empty() {
        shared.flush_queue().await;
    }

    let mut retry: Option<Instant> = None;
    let mut retries = 0u32;
    loop {
        if shared.services.queue.is_empty() {
            retry = None;
            retries = 0;
        } else if was_online && retry.is_none() {
            let delay = backoff.delay(retries);
            debug!("Offline queue not empty; retrying in {}ms", delay.as_millis());
            retry = Some(Instant::now() + delay);
        }

        tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_online = *online.borrow_and_update();
                if now_online && !was_online {
                    retries = 0;
                    shared.flush_queue().await;
                }
                if !now_online {
                    retry = None;
                }
                was_online = now_online;
            }
            changed = pending.changed() => {
                if changed.is_err() {
                    break;
                }
                pending.borrow_and_update();
            }
            _ = sleep_until(retry.unwrap_or_else(Instant::now)), if retry.is_some() => {
                retry = None;
                retries = retries.saturating_add(1);
                shared.flush_queue().await;
            }
            _ = stop.changed() => break,
        }
    }
}

async fn consume_push(
    shared: Arc<Shared>,
    mut channel: PushChannel,
    mut messages: tokio::sync::mpsc::UnboundedReceiver<PushMessage>,
    mut stop: watch::Receiver<bool>,
) {
    channel.connect();
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(PushMessage::Connected) => {
                    if shared.push_drives_connectivity {
                        shared.connectivity.set_online(true);
                    }
                    // Events may have been missed while disconnected.
                    if let Err(e) = shared.refetch().await {
                        warn!("Refetch after push reconnect failed: {e}");
                    }
                }
                Some(PushMessage::Message(raw)) => shared.handle_push(&raw).await,
                Some(PushMessage::Disconnected { retry_in }) => {
                    debug!("Push channel down, retrying in {}ms", retry_in.as_millis());
                    if shared.push_drives_connectivity {
                        shared.connectivity.set_online(false);
                    }
                }
                None => break,
            },
            _ = stop.changed() => break,
        }
    }
    channel.dispose();
}

async fn resync_periodically(
    shared: Arc<Shared>,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = shared.refetch().await {
                    warn!("Periodic resync failed: {e}");
                }
            }
            _ = stop.changed() => break,
        }
    }
}

//! Recording fakes for the network collaborators.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::api::{ApiError, DraftApi, RecordApi, ReplayTransport, SavedDraft, UpdateDraftRequest};
use crate::collection::{ListQuery, RecordPage};
use crate::models::{Document, VersionMarker};
use crate::queue::QueuedOperation;
use crate::realtime::{PushStream, PushTransport};

/// A canned response. Errors are rebuilt on every use since `ApiError` isn't `Clone`.
#[derive(Debug, Clone)]
pub enum Scripted<T> {
    Ok(T),
    Network,
    Conflict,
    Server(u16),
}

impl<T> Scripted<T> {
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Scripted::Ok(value) => Ok(value),
            Scripted::Network => Err(ApiError::Network("connection refused".to_string())),
            Scripted::Conflict => Err(ApiError::Conflict {
                message: "document was modified by another session".to_string(),
                server_marker: None,
            }),
            Scripted::Server(status) => Err(ApiError::Server {
                status,
                message: "rejected".to_string(),
            }),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Draft API fake. Unscripted calls succeed, bumping the version by one.
#[derive(Default)]
pub struct FakeDraftApi {
    creates: Mutex<Vec<Value>>,
    updates: Mutex<Vec<(Uuid, UpdateDraftRequest)>>,
    create_script: Mutex<VecDeque<Scripted<SavedDraft>>>,
    update_script: Mutex<VecDeque<Scripted<SavedDraft>>>,
    authoritative: Mutex<Option<Document>>,
    latency: Option<Duration>,
}

impl FakeDraftApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn script_create(&self, outcome: Scripted<SavedDraft>) {
        lock(&self.create_script).push_back(outcome);
    }

    pub fn script_update(&self, outcome: Scripted<SavedDraft>) {
        lock(&self.update_script).push_back(outcome);
    }

    pub fn set_authoritative(&self, document: Document) {
        *lock(&self.authoritative) = Some(document);
    }

    pub fn creates(&self) -> Vec<Value> {
        lock(&self.creates).clone()
    }

    pub fn updates(&self) -> Vec<(Uuid, UpdateDraftRequest)> {
        lock(&self.updates).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.creates).len() + lock(&self.updates).len()
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DraftApi for FakeDraftApi {
    async fn create_draft(&self, content: &Value) -> Result<SavedDraft, ApiError> {
        lock(&self.creates).push(content.clone());
        self.wait().await;
        let scripted = lock(&self.create_script).pop_front();
        scripted
            .unwrap_or_else(|| {
                Scripted::Ok(SavedDraft {
                    id: Uuid::new_v4(),
                    marker: VersionMarker::new(1, Utc::now()),
                })
            })
            .into_result()
    }

    async fn update_draft(
        &self,
        id: Uuid,
        request: &UpdateDraftRequest,
    ) -> Result<SavedDraft, ApiError> {
        lock(&self.updates).push((id, request.clone()));
        self.wait().await;
        let scripted = lock(&self.update_script).pop_front();
        scripted
            .unwrap_or_else(|| {
                Scripted::Ok(SavedDraft {
                    id,
                    marker: VersionMarker::new(
                        request.last_known_version.unwrap_or(0) + 1,
                        Utc::now(),
                    ),
                })
            })
            .into_result()
    }

    async fn fetch_draft(&self, id: Uuid) -> Result<Document, ApiError> {
        lock(&self.authoritative).clone().ok_or(ApiError::Server {
            status: 404,
            message: format!("draft {id} not found"),
        })
    }
}

/// List endpoint fake: serves scripted pages, then repeats the last one.
#[derive(Default)]
pub struct FakeRecordApi {
    pages: Mutex<VecDeque<Scripted<RecordPage>>>,
    fallback: Mutex<Option<RecordPage>>,
    calls: Mutex<Vec<ListQuery>>,
}

impl FakeRecordApi {
    pub fn serving(page: RecordPage) -> Self {
        let api = Self::default();
        *lock(&api.fallback) = Some(page);
        api
    }

    pub fn script(&self, outcome: Scripted<RecordPage>) {
        lock(&self.pages).push_back(outcome);
    }

    pub fn set_page(&self, page: RecordPage) {
        *lock(&self.fallback) = Some(page);
    }

    pub fn calls(&self) -> Vec<ListQuery> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl RecordApi for FakeRecordApi {
    async fn list_records(&self, query: &ListQuery) -> Result<RecordPage, ApiError> {
        lock(&self.calls).push(query.clone());
        if let Some(scripted) = lock(&self.pages).pop_front() {
            return scripted.into_result();
        }
        lock(&self.fallback)
            .clone()
            .ok_or_else(|| ApiError::Network("no page configured".to_string()))
    }
}

/// Replay fake: pops scripted outcomes, then falls back to a fixed one.
pub struct FakeReplay {
    calls: Mutex<Vec<QueuedOperation>>,
    script: Mutex<VecDeque<Scripted<Option<Value>>>>,
    fallback: Mutex<Scripted<Option<Value>>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeReplay {
    pub fn succeeding() -> Self {
        Self::failing_with(Scripted::Ok(None))
    }

    pub fn failing_with(outcome: Scripted<Option<Value>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(outcome),
            latency: Mutex::new(None),
        }
    }

    pub fn scripted(outcomes: Vec<Scripted<Option<Value>>>) -> Self {
        let replay = Self::succeeding();
        *lock(&replay.script) = outcomes.into();
        replay
    }

    pub fn set_fallback(&self, outcome: Scripted<Option<Value>>) {
        *lock(&self.fallback) = outcome;
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn calls(&self) -> Vec<QueuedOperation> {
        lock(&self.calls).clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.calls().into_iter().map(|op| op.endpoint).collect()
    }
}

#[async_trait]
impl ReplayTransport for FakeReplay {
    async fn replay(&self, operation: &QueuedOperation) -> Result<Option<Value>, ApiError> {
        lock(&self.calls).push(operation.clone());
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = lock(&self.script).pop_front();
        scripted
            .unwrap_or_else(|| lock(&self.fallback).clone())
            .into_result()
    }
}

/// Push transport fake. The first `open` hands out a stream fed by
/// [`FakePush::send`]; later opens stay pending like an idle connection.
pub struct FakePush {
    sender: tokio::sync::mpsc::UnboundedSender<String>,
    receiver: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<String>>>,
    opens: Mutex<usize>,
}

impl FakePush {
    pub fn new() -> Self {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            opens: Mutex::new(0),
        }
    }

    pub fn send(&self, message: impl Into<String>) {
        let _ = self.sender.send(message.into());
    }

    pub fn opens(&self) -> usize {
        *lock(&self.opens)
    }
}

struct FakePushStream(tokio::sync::mpsc::UnboundedReceiver<String>);

#[async_trait]
impl PushStream for FakePushStream {
    async fn next_message(&mut self) -> Result<Option<String>, ApiError> {
        Ok(self.0.recv().await)
    }
}

#[async_trait]
impl PushTransport for FakePush {
    async fn open(&self) -> Result<Box<dyn PushStream>, ApiError> {
        *lock(&self.opens) += 1;
        let receiver = lock(&self.receiver).take();
        match receiver {
            Some(receiver) => Ok(Box::new(FakePushStream(receiver))),
            None => std::future::pending().await,
        }
    }
}

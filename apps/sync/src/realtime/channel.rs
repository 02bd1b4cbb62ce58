//! Push channel lifecycle: connect, read, back off, reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::ApiError;

/// Opens one connection to the push endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PushStream>, ApiError>;
}

/// An open push connection.
#[async_trait]
pub trait PushStream: Send {
    /// Next raw message; `Ok(None)` once the server closes the stream.
    async fn next_message(&mut self) -> Result<Option<String>, ApiError>;
}

/// What the channel reports to its consumer, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    Connected,
    Message(String),
    /// The connection dropped or could not be opened; next attempt after `retry_in`.
    Disconnected { retry_in: Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `failures + 1`: 1s, 2s, 4s, ... capped.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    backoff: Backoff,
    sender: mpsc::UnboundedSender<PushMessage>,
    task: Option<JoinHandle<()>>,
}

impl PushChannel {
    /// Creates a disconnected channel and the receiver its messages arrive on.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        backoff: Backoff,
    ) -> (Self, mpsc::UnboundedReceiver<PushMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            transport,
            backoff,
            sender,
            task: None,
        };
        (channel, receiver)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts the reader task. A no-op while it is already running.
    pub fn connect(&mut self) {
        if self.is_running() {
            return;
        }
        info!("Push channel connecting");
        self.task = Some(tokio::spawn(pump(
            self.transport.clone(),
            self.backoff,
            self.sender.clone(),
        )));
    }

    /// Drops the current connection and starts over with no backoff.
    pub fn reconnect(&mut self) {
        self.dispose();
        self.connect();
    }

    pub fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Push channel disposed");
            task.abort();
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn pump(
    transport: Arc<dyn PushTransport>,
    backoff: Backoff,
    sender: mpsc::UnboundedSender<PushMessage>,
) {
    let mut failures = 0u32;
    loop {
        match transport.open().await {
            Ok(mut stream) => {
                failures = 0;
                if sender.send(PushMessage::Connected).is_err() {
                    return;
                }
                loop {
                    match stream.next_message().await {
                        Ok(Some(message)) => {
                            if sender.send(PushMessage::Message(message)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("Push stream closed by server");
                            break;
                        }
                        Err(e) => {
                            warn!("Push stream failed: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Push channel connect failed: {e}"),
        }

        let retry_in = backoff.delay(failures);
        failures = failures.saturating_add(1);
        if sender.send(PushMessage::Disconnected { retry_in }).is_err() {
            return;
        }
        tokio::time::sleep(retry_in).await;
    }
}

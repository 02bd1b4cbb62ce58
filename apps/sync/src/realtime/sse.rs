//! Server-Sent Events transport for the push channel.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Response};
use tracing::debug;

use crate::api::ApiError;
use crate::realtime::channel::{PushStream, PushTransport};

pub struct SsePushTransport {
    client: Client,
    url: String,
    token: Option<String>,
}

impl SsePushTransport {
    /// The stream is long-lived, so only connecting is bounded by `connect_timeout`.
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().connect_timeout(connect_timeout).build()?,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl PushTransport for SsePushTransport {
    async fn open(&self) -> Result<Box<dyn PushStream>, ApiError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                message: format!("push endpoint refused stream: {status}"),
            });
        }

        debug!("SSE stream open at {}", self.url);
        Ok(Box::new(SseStream {
            response,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
        }))
    }
}

struct SseStream {
    response: Response,
    buffer: BytesMut,
    pending: VecDeque<String>,
}

#[async_trait]
impl PushStream for SseStream {
    async fn next_message(&mut self) -> Result<Option<String>, ApiError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.pending.extend(drain_events(&mut self.buffer));
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(ApiError::Network(e.to_string())),
            }
        }
    }
}

/// Splits every complete event (terminated by a blank line) off the front of
/// `buffer` and returns the joined `data:` payload of each. Comments, other
/// fields and events without data are skipped; a trailing partial event stays
/// buffered.
fn drain_events(buffer: &mut BytesMut) -> Vec<String> {
    let mut events = Vec::new();
    while let Some((end, separator)) = find_event_end(buffer) {
        let frame = buffer.split_to(end + separator);
        let text = String::from_utf8_lossy(&frame[..end]);

        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

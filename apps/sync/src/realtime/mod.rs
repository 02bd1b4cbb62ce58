//! Real-time reconciliation: push events in, record collection updates out.

pub mod channel;
pub mod events;
pub mod reconciler;
pub mod sse;

pub use channel::{Backoff, PushChannel, PushMessage, PushStream, PushTransport};
pub use events::{parse_push_message, PushEvent};
pub use reconciler::{IgnoreReason, ReconcileOutcome, Reconciler, DEFAULT_MARKER_RETENTION};
pub use sse::SsePushTransport;

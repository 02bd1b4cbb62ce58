//! Autosave: debounces draft edits into one save per quiet period and routes
//! the outcome (saved, invalid, conflict, queued offline, failed) back into the
//! draft store.

pub mod scheduler;

pub use scheduler::{Autosave, AutosaveConfig, AutosaveHandle, AutosaveStatus, SaveOutcome};

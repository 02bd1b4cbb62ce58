pub mod api;
pub mod autosave;
pub mod collection;
pub mod config;
pub mod connectivity;
pub mod console;
pub mod draft;
pub mod errors;
pub mod models;
pub mod queue;
pub mod realtime;
pub mod session;

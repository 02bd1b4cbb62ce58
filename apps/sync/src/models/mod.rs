pub mod document;
pub mod marker;
pub mod record;

pub use document::Document;
pub use marker::VersionMarker;
pub use record::{Comment, Record, RecordPatch, Share, SharePermission};

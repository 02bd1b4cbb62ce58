//! Draft store: the single locally editable profile, its undo/redo history and
//! dirty/conflict state. All user edits go through `DraftStore::mutate`.

pub mod path;
pub mod store;
pub mod validation;

pub use path::FieldPath;
pub use store::{
    lock, ConflictFlag, ConflictKind, DraftChange, DraftSnapshot, DraftStore, SharedDraft,
    HISTORY_LIMIT,
};
pub use validation::{DocumentValidator, ProfileValidator, ValidationIssue, ValidationReport};

//! Paginated collection view: the filtered/sorted page of records the user sees,
//! plus the rules for when a pushed change can be spliced in locally.

pub mod query;
pub mod view;

pub use query::{
    DeletedFilter, Filter, ListQuery, RecordPage, Sort, SortDirection, SortField, DEFAULT_PAGE_SIZE,
};
pub use view::{CollectionView, Removal, Splice};

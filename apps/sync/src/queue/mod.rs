//! Offline write queue: durable FIFO of mutating requests that failed for lack of
//! connectivity, replayed sequentially once the network is back.

pub mod offline;
pub mod storage;

pub use offline::{
    FlushReport, OfflineQueue, OperationKind, QueueConfig, QueuedOperation, ReplayedOperation,
    WritePermit, QUEUE_STORAGE_KEY,
};
pub use storage::{FileQueueStorage, MemoryQueueStorage, QueueStorage};

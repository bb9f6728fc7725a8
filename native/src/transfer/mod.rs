// Raw capture transfer workflow and the storage it writes into.

pub mod manager;
pub mod storage;

pub use manager::{PullState, PushState, RawRangePackage, TransferError, TransferManager};
pub use storage::{AccessGrant, FileStorage, ResourceHandle, StorageError, StorageProvider};

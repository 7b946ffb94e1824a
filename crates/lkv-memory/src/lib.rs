#![forbid(unsafe_code)]
//! In-process reference implementation of the latchkv storage contract.
//!
//! [`MemoryStore`] keeps one slot per key (a small mutex-guarded state
//! machine holding the current `(value, version)` pair and the one-shot
//! waiters attached to it) inside a sharded map that materializes slots
//! lazily and garbage-collects them as soon as they are absent with no
//! watchers left. Waits are race-free against concurrent mutation: a
//! watcher is registered before the slot state is re-read, so the
//! transition that should wake it cannot slip between the read and the
//! block.
//!
//! ```
//! use lkv_memory::{MemoryStore, Storage};
//!
//! let store = MemoryStore::new();
//! let version = store.create_value("greeting", "hello".into())?.expect("fresh key");
//! let entry = store.get_value("greeting")?.expect("present");
//! assert_eq!(entry.version, version);
//! # Ok::<(), lkv_memory::LkvError>(())
//! ```

mod slot;
mod store;
mod waiter;

pub use lkv_core::{
    LkvError, Result, Storage, StorageDetails, ValueDetails, Version, VersionedValue,
};
pub use store::{MemoryStore, MemoryStoreConfig};

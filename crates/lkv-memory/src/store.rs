//! Storage coordinator: key→slot routing, version allocation, close.
//!
//! Design:
//! - Slots live in a sharded map (`RwLock<HashMap>` per shard, hash-routed)
//!   so installs and lookups on different keys proceed without contention.
//!   Load-or-store is atomic per shard; no coarse storage lock exists.
//! - Versions come from a single `AtomicU64`, so every version handed out
//!   as "current" is strictly greater than every one handed out before it.
//!   Create paths allocate speculatively: a tick may be consumed without a
//!   write when the value turns out to exist. Monotonic, not dense.
//! - Every public operation runs a retry loop: an attempt that observes a
//!   tombstoned slot restarts against the map, which by then no longer
//!   references that slot. A slot tombstones at most once, so the loop
//!   terminates.
//! - Closing swaps an atomic flag and drops the sender half of the close
//!   channel. Receiver disconnect is the broadcast: every blocked wait
//!   (current and future) observes it, without firing waiters one by one.
//!
//! Lock order: a shard lock is never held while locking a slot (lookups
//! clone the `Arc<Slot>` out first); the GC hook takes a shard lock while
//! holding the slot guard, which is safe because the reverse order never
//! occurs.

use crate::slot::{Slot, SlotGone, WatchHandle};
use crate::waiter::WakeEvent;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded, select};
use lkv_core::{LkvError, Result, Storage};
use lkv_types::{StorageDetails, ValueDetails, Version, VersionedValue, raw_version};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace};

/// Configuration for [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreConfig {
    /// Number of shards the slot map is split across.
    /// Default: 16.
    pub shard_count: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { shard_count: 16 }
    }
}

/// Why a single attempt against a slot did not produce a result.
enum AttemptError {
    /// The slot was tombstoned under us; retry against a fresh slot.
    SlotGone,
    /// A real error for the caller.
    Storage(LkvError),
}

impl From<SlotGone> for AttemptError {
    fn from(_: SlotGone) -> Self {
        Self::SlotGone
    }
}

impl From<LkvError> for AttemptError {
    fn from(err: LkvError) -> Self {
        Self::Storage(err)
    }
}

type Attempt<T> = std::result::Result<T, AttemptError>;

/// How a blocked wait ended.
enum WaitOutcome {
    Fired(WakeEvent),
    Closed,
    TimedOut,
}

/// In-process reference implementation of the latchkv [`Storage`] contract.
///
/// Safe to share behind an `Arc`; every operation takes `&self`.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<RwLock<HashMap<String, Arc<Slot>>>>,
    hasher: RandomState,
    next_version: AtomicU64,
    closed: AtomicBool,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        let (close_tx, close_rx) = bounded(0);
        Self {
            shards,
            hasher: RandomState::new(),
            next_version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    /// Number of slots currently mapped, including slots that only exist to
    /// carry watchers for absent keys. After quiescence this equals the
    /// number of present values — anything beyond that is a leak.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LkvError::Closed);
        }
        Ok(())
    }

    /// Allocate the next version. Strictly increasing across the store.
    fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn shard_for(&self, key: &str) -> &RwLock<HashMap<String, Arc<Slot>>> {
        let shard_count = u64::try_from(self.shards.len()).expect("shard count fits in u64");
        let index = usize::try_from(self.hasher.hash_one(key) % shard_count)
            .expect("shard index fits in usize");
        &self.shards[index]
    }

    fn load_slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.shard_for(key).read().get(key).cloned()
    }

    /// Atomic load-or-store: return the mapped slot for `key`, installing
    /// the one built by `make` if the key is unmapped. The boolean reports
    /// whether an install happened.
    fn load_or_install_slot(&self, key: &str, make: impl FnOnce() -> Slot) -> (Arc<Slot>, bool) {
        let mut shard = self.shard_for(key).write();
        if let Some(slot) = shard.get(key) {
            return (Arc::clone(slot), false);
        }
        let slot = Arc::new(make());
        shard.insert(key.to_owned(), Arc::clone(&slot));
        (slot, true)
    }

    /// GC hook handed to slot operations: drops the map entry. Runs while
    /// the slot guard is held, in the same critical section that set the
    /// tombstone flag.
    fn drop_slot(&self, key: &str) {
        self.shard_for(key).write().remove(key);
        trace!(key, "slot_collected");
    }

    fn try_get_value(&self, key: &str) -> Attempt<Option<VersionedValue>> {
        self.ensure_open()?;
        let Some(slot) = self.load_slot(key) else {
            return Ok(None);
        };
        let (value, version) = slot.get()?;
        Ok(versioned_value(value, version))
    }

    fn try_wait_for_value(
        &self,
        key: &str,
        old_version: u64,
        deadline: Option<Instant>,
    ) -> Attempt<Option<VersionedValue>> {
        self.ensure_open()?;
        let slot = match self.load_slot(key) {
            Some(slot) => slot,
            // The caller knew a version but nothing is mapped: the value is
            // gone. Report the absence without installing a slot.
            None if old_version != 0 => return Ok(None),
            None => self.load_or_install_slot(key, Slot::new).0,
        };
        // Attach before re-reading state: a transition between the read and
        // the block would otherwise be lost.
        let handle = slot.add_watcher()?;
        let (value, version) = slot.get()?;
        if version != 0 {
            if old_version == 0 || version != old_version {
                let _ = slot.remove_watcher(handle.id, || self.drop_slot(key));
                return Ok(versioned_value(value, version));
            }
        } else if old_version != 0 {
            // Absent, but the caller supplied a version: the deletion
            // already happened from the caller's point of view.
            let _ = slot.remove_watcher(handle.id, || self.drop_slot(key));
            return Ok(None);
        }
        trace!(key, old_version, "wait_blocking");
        match self.block_on_waiter(&handle, deadline) {
            WaitOutcome::Fired(event) => Ok(versioned_value(event.value, event.version)),
            WaitOutcome::Closed => {
                let _ = slot.remove_watcher(handle.id, || self.drop_slot(key));
                Err(LkvError::Closed.into())
            }
            WaitOutcome::TimedOut => {
                let _ = slot.remove_watcher(handle.id, || self.drop_slot(key));
                Err(LkvError::WaitTimeout.into())
            }
        }
    }

    /// Race the attached waiter against the close broadcast and, when a
    /// deadline is given, the clock.
    fn block_on_waiter(&self, handle: &WatchHandle, deadline: Option<Instant>) -> WaitOutcome {
        let fired = handle.waiter.fired();
        if let Some(deadline) = deadline {
            select! {
                recv(fired) -> event => {
                    WaitOutcome::Fired(event.expect("waiter detached without firing"))
                }
                recv(&self.close_rx) -> _ => WaitOutcome::Closed,
                default(deadline.saturating_duration_since(Instant::now())) => WaitOutcome::TimedOut,
            }
        } else {
            select! {
                recv(fired) -> event => {
                    WaitOutcome::Fired(event.expect("waiter detached without firing"))
                }
                recv(&self.close_rx) -> _ => WaitOutcome::Closed,
            }
        }
    }

    fn try_create_value(&self, key: &str, value: &Bytes) -> Attempt<Option<Version>> {
        self.ensure_open()?;
        let version = self.allocate_version();
        let (slot, installed) =
            self.load_or_install_slot(key, || Slot::with_value(value.clone(), version));
        if installed {
            debug!(key, version, "value_created");
            return Ok(Version::from_raw(version));
        }
        let applied = slot.check_and_set(|current| {
            if current != 0 {
                return None;
            }
            Some((value.clone(), version))
        })?;
        if !applied {
            return Ok(None);
        }
        debug!(key, version, "value_created");
        Ok(Version::from_raw(version))
    }

    fn try_update_value(&self, key: &str, value: &Bytes, old_version: u64) -> Attempt<Option<Version>> {
        self.ensure_open()?;
        let Some(slot) = self.load_slot(key) else {
            return Ok(None);
        };
        let mut new_version = 0;
        let applied = slot.check_and_set(|current| {
            if current == 0 {
                return None;
            }
            if old_version != 0 && current != old_version {
                return None;
            }
            new_version = self.allocate_version();
            Some((value.clone(), new_version))
        })?;
        if !applied {
            return Ok(None);
        }
        debug!(key, version = new_version, "value_updated");
        Ok(Version::from_raw(new_version))
    }

    fn try_create_or_update_value(
        &self,
        key: &str,
        value: &Bytes,
        old_version: u64,
    ) -> Attempt<Option<Version>> {
        self.ensure_open()?;
        let version = self.allocate_version();
        let (slot, installed) =
            self.load_or_install_slot(key, || Slot::with_value(value.clone(), version));
        if installed {
            debug!(key, version, "value_created");
            return Ok(Version::from_raw(version));
        }
        let mut written = 0;
        let applied = slot.check_and_set(|current| {
            if current == 0 {
                // Absent: nothing to mismatch against, write the
                // pre-allocated version even if an old version was given.
                written = version;
                return Some((value.clone(), version));
            }
            if old_version != 0 && current != old_version {
                return None;
            }
            written = self.allocate_version();
            Some((value.clone(), written))
        })?;
        if !applied {
            return Ok(None);
        }
        debug!(key, version = written, "value_written");
        Ok(Version::from_raw(written))
    }

    fn try_delete_value(&self, key: &str, version: u64) -> Attempt<bool> {
        self.ensure_open()?;
        let Some(slot) = self.load_slot(key) else {
            return Ok(false);
        };
        let cleared = slot.clear(version, || self.drop_slot(key))?;
        if cleared {
            debug!(key, "value_deleted");
        }
        Ok(cleared)
    }

    fn wait_inner(
        &self,
        key: &str,
        old_version: u64,
        deadline: Option<Instant>,
    ) -> Result<Option<VersionedValue>> {
        loop {
            match self.try_wait_for_value(key, old_version, deadline) {
                Ok(result) => return Ok(result),
                Err(AttemptError::SlotGone) => trace!(key, "tombstone_race_retry"),
                Err(AttemptError::Storage(err)) => return Err(err),
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn get_value(&self, key: &str) -> Result<Option<VersionedValue>> {
        loop {
            match self.try_get_value(key) {
                Ok(result) => return Ok(result),
                Err(AttemptError::SlotGone) => trace!(key, "tombstone_race_retry"),
                Err(AttemptError::Storage(err)) => return Err(err),
            }
        }
    }

    fn wait_for_value(
        &self,
        key: &str,
        old_version: Option<Version>,
    ) -> Result<Option<VersionedValue>> {
        self.wait_inner(key, raw_version(old_version), None)
    }

    fn wait_for_value_deadline(
        &self,
        key: &str,
        old_version: Option<Version>,
        deadline: Instant,
    ) -> Result<Option<VersionedValue>> {
        self.wait_inner(key, raw_version(old_version), Some(deadline))
    }

    fn create_value(&self, key: &str, value: Bytes) -> Result<Option<Version>> {
        loop {
            match self.try_create_value(key, &value) {
                Ok(result) => return Ok(result),
                Err(AttemptError::SlotGone) => trace!(key, "tombstone_race_retry"),
                Err(AttemptError::Storage(err)) => return Err(err),
            }
        }
    }

    fn update_value(
        &self,
        key: &str,
        value: Bytes,
        old_version: Option<Version>,
    ) -> Result<Option<Version>> {
        let old_version = raw_version(old_version);
        loop {
            match self.try_update_value(key, &value, old_version) {
                Ok(result) => return Ok(result),
                Err(AttemptError::SlotGone) => trace!(key, "tombstone_race_retry"),
                Err(AttemptError::Storage(err)) => return Err(err),
            }
        }
    }

    fn create_or_update_value(
        &self,
        key: &str,
        value: Bytes,
        old_version: Option<Version>,
    ) -> Result<Option<Version>> {
        let old_version = raw_version(old_version);
        loop {
            match self.try_create_or_update_value(key, &value, old_version) {
                Ok(result) => return Ok(result),
                Err(AttemptError::SlotGone) => trace!(key, "tombstone_race_retry"),
                Err(AttemptError::Storage(err)) => return Err(err),
            }
        }
    }

    fn delete_value(&self, key: &str, version: Option<Version>) -> Result<bool> {
        let version = raw_version(version);
        loop {
            match self.try_delete_value(key, version) {
                Ok(result) => return Ok(result),
                Err(AttemptError::SlotGone) => trace!(key, "tombstone_race_retry"),
                Err(AttemptError::Storage(err)) => return Err(err),
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(LkvError::Closed);
        }
        // Dropping the only sender disconnects every receiver, waking all
        // blocked waits at once.
        self.close_tx.lock().take();
        info!("storage_closed");
        Ok(())
    }

    fn inspect(&self) -> StorageDetails {
        if self.closed.load(Ordering::SeqCst) {
            return StorageDetails {
                values: BTreeMap::new(),
                is_closed: true,
            };
        }
        let mut values = BTreeMap::new();
        for shard in &self.shards {
            let slots: Vec<(String, Arc<Slot>)> = shard
                .read()
                .iter()
                .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
                .collect();
            for (key, slot) in slots {
                // A slot tombstoned mid-scan is no longer mapped; skip it.
                let Ok((value, version)) = slot.get() else {
                    continue;
                };
                if let Some(version) = Version::from_raw(version) {
                    values.insert(key, ValueDetails { value, version });
                }
            }
        }
        StorageDetails {
            values,
            is_closed: false,
        }
    }
}

fn versioned_value(value: Bytes, raw: u64) -> Option<VersionedValue> {
    Version::from_raw(raw).map(|version| VersionedValue { value, version })
}

//! Per-key slot state machine.
//!
//! A slot holds the current `(value, version)` pair for one key plus the
//! set of one-shot waiters attached to it. Three states:
//!
//! - **Absent** — `version == 0`, value empty; watchers may be attached.
//! - **Present** — `version != 0`.
//! - **Tombstoned** — terminal. The slot was removed from the storage map
//!   in the same critical section that set the flag; any operation that
//!   observes it fails with [`SlotGone`] and the storage retries against a
//!   freshly installed slot.
//!
//! Locking discipline: the guard is held for the whole of a single slot
//! operation, except that firing detached waiters happens after the guard
//! is released. The detach guarantees a later check-and-set finds an empty
//! watcher set; firing outside the guard keeps waiter observers from
//! re-entering a locked slot. A slot transitions to Tombstoned exactly when
//! it is Absent with no watchers left, and the `gc` hook runs inside that
//! critical section so the map entry disappears atomically with the flag.

use crate::waiter::{WakeEvent, Waiter};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The slot has been tombstoned and unmapped.
///
/// Strictly a control-flow signal between the slot and the storage
/// coordinator; it never reaches a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotGone;

/// Handle to a watcher attached by [`Slot::add_watcher`].
#[derive(Debug)]
pub(crate) struct WatchHandle {
    pub(crate) id: u64,
    pub(crate) waiter: Arc<Waiter>,
}

#[derive(Debug)]
struct SlotState {
    value: Bytes,
    version: u64,
    watchers: BTreeMap<u64, Arc<Waiter>>,
    next_watcher_id: u64,
    tombstoned: bool,
}

impl SlotState {
    fn set(&mut self, value: Bytes, version: u64) {
        debug_assert!(version != 0, "present values carry a nonzero version");
        self.value = value;
        self.version = version;
    }
}

/// Per-key state machine: current value, version, and pending waiters.
#[derive(Debug)]
pub(crate) struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    /// A fresh Absent slot (installed for watchers of a missing key).
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: Bytes::new(),
                version: 0,
                watchers: BTreeMap::new(),
                next_watcher_id: 0,
                tombstoned: false,
            }),
        }
    }

    /// A fresh Present slot carrying `(value, version)`.
    pub(crate) fn with_value(value: Bytes, version: u64) -> Self {
        let slot = Self::new();
        slot.state.lock().set(value, version);
        slot
    }

    /// The current `(value, raw version)` pair. Raw version 0 means Absent.
    pub(crate) fn get(&self) -> Result<(Bytes, u64), SlotGone> {
        let state = self.state.lock();
        if state.tombstoned {
            return Err(SlotGone);
        }
        Ok((state.value.clone(), state.version))
    }

    /// Attach a fresh one-shot waiter.
    ///
    /// Registering the waiter *before* re-reading slot state is what makes
    /// wakeups race-free: any transition that fires the watcher set happens
    /// entirely after this insertion.
    pub(crate) fn add_watcher(&self) -> Result<WatchHandle, SlotGone> {
        let mut state = self.state.lock();
        if state.tombstoned {
            return Err(SlotGone);
        }
        let id = state.next_watcher_id;
        state.next_watcher_id += 1;
        let waiter = Arc::new(Waiter::new());
        state.watchers.insert(id, Arc::clone(&waiter));
        Ok(WatchHandle { id, waiter })
    }

    /// Detach the watcher `id` if it is still attached.
    ///
    /// Idempotent: a watcher that already fired (and was detached by the
    /// firing transition) or was already removed is a no-op. If the removal
    /// leaves the slot Absent with no watchers, the slot is tombstoned and
    /// `gc` runs inside the same critical section.
    pub(crate) fn remove_watcher(&self, id: u64, gc: impl FnOnce()) -> Result<(), SlotGone> {
        let mut state = self.state.lock();
        if state.tombstoned {
            return Err(SlotGone);
        }
        if state.watchers.remove(&id).is_none() {
            return Ok(());
        }
        if state.watchers.is_empty() && state.version == 0 {
            state.tombstoned = true;
            gc();
        }
        Ok(())
    }

    /// Optimistic conditional write.
    ///
    /// `decide` receives the current raw version and returns the new
    /// `(value, version)` pair to write, or `None` to decline. The new
    /// version must be nonzero — clearing goes through [`Slot::clear`].
    /// On apply, the current watcher set is detached and fired with the
    /// new pair after the guard is released.
    pub(crate) fn check_and_set(
        &self,
        decide: impl FnOnce(u64) -> Option<(Bytes, u64)>,
    ) -> Result<bool, SlotGone> {
        let mut state = self.state.lock();
        if state.tombstoned {
            return Err(SlotGone);
        }
        let Some((value, version)) = decide(state.version) else {
            return Ok(false);
        };
        state.set(value.clone(), version);
        let fired = std::mem::take(&mut state.watchers);
        drop(state);
        for waiter in fired.into_values() {
            waiter.fire(WakeEvent {
                value: value.clone(),
                version,
            });
        }
        Ok(true)
    }

    /// Transition to Absent if the precondition holds.
    ///
    /// Fails (returns `false`) when already Absent, or when `expected` is
    /// nonzero and does not match the current version. On success the
    /// watcher set is detached, leaving the slot Absent with no waiters: it
    /// tombstones itself, running `gc` atomically with the transition. The
    /// detached waiters are then fired with the absent pair after the guard
    /// is released; firing needs only the waiters themselves, never the
    /// unmapped slot.
    pub(crate) fn clear(&self, expected: u64, gc: impl FnOnce()) -> Result<bool, SlotGone> {
        let mut state = self.state.lock();
        if state.tombstoned {
            return Err(SlotGone);
        }
        if state.version == 0 {
            return Ok(false);
        }
        if expected != 0 && state.version != expected {
            return Ok(false);
        }
        state.value = Bytes::new();
        state.version = 0;
        let fired = std::mem::take(&mut state.watchers);
        state.tombstoned = true;
        gc();
        drop(state);
        for waiter in fired.into_values() {
            waiter.fire(WakeEvent::absent());
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    #[cfg(test)]
    pub(crate) fn is_tombstoned(&self) -> bool {
        self.state.lock().tombstoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn tombstoned_slot() -> Slot {
        // A present slot with no watchers tombstones itself on clear.
        let slot = Slot::with_value(Bytes::from_static(b"x"), 1);
        let cleared = slot.clear(0, || {}).expect("live slot");
        assert!(cleared);
        assert!(slot.is_tombstoned());
        slot
    }

    #[test]
    fn get_on_fresh_slot_is_absent() {
        let slot = Slot::new();
        let (value, version) = slot.get().expect("live slot");
        assert!(value.is_empty());
        assert_eq!(version, 0);
    }

    #[test]
    fn get_returns_installed_pair() {
        let slot = Slot::with_value(Bytes::from_static(b"foo"), 7);
        let (value, version) = slot.get().expect("live slot");
        assert_eq!(value, Bytes::from_static(b"foo"));
        assert_eq!(version, 7);
    }

    #[test]
    fn operations_on_tombstoned_slot_report_gone() {
        let slot = tombstoned_slot();
        assert_eq!(slot.get(), Err(SlotGone));
        assert!(slot.add_watcher().is_err());
        assert_eq!(slot.remove_watcher(0, || {}), Err(SlotGone));
        assert_eq!(slot.check_and_set(|_| None), Err(SlotGone));
        assert_eq!(slot.clear(0, || {}), Err(SlotGone));
    }

    #[test]
    fn remove_watcher_is_idempotent() {
        let slot = Slot::with_value(Bytes::from_static(b"abc"), 100);
        let handle = slot.add_watcher().expect("live slot");
        slot.remove_watcher(handle.id, || {}).expect("live slot");
        assert_eq!(slot.watcher_count(), 0);
        // Second removal of the same id is a no-op.
        slot.remove_watcher(handle.id, || {}).expect("live slot");
        assert!(!slot.is_tombstoned());
    }

    #[test]
    fn removing_last_watcher_of_absent_slot_tombstones_it() {
        let slot = Slot::new();
        let handle = slot.add_watcher().expect("live slot");
        let gc_ran = Cell::new(false);
        slot.remove_watcher(handle.id, || gc_ran.set(true))
            .expect("live slot");
        assert!(gc_ran.get());
        assert!(slot.is_tombstoned());
    }

    #[test]
    fn absent_slot_with_remaining_watchers_stays_alive() {
        let slot = Slot::new();
        let first = slot.add_watcher().expect("live slot");
        let _second = slot.add_watcher().expect("live slot");
        let gc_ran = Cell::new(false);
        slot.remove_watcher(first.id, || gc_ran.set(true))
            .expect("live slot");
        assert!(!gc_ran.get());
        assert!(!slot.is_tombstoned());
        assert_eq!(slot.watcher_count(), 1);
    }

    #[test]
    fn removing_watcher_from_present_slot_never_tombstones() {
        let slot = Slot::with_value(Bytes::from_static(b"bar"), 88);
        let handle = slot.add_watcher().expect("live slot");
        let gc_ran = Cell::new(false);
        slot.remove_watcher(handle.id, || gc_ran.set(true))
            .expect("live slot");
        assert!(!gc_ran.get());
        assert!(!slot.is_tombstoned());
    }

    #[test]
    fn check_and_set_decline_leaves_state_untouched() {
        let slot = Slot::with_value(Bytes::from_static(b"foo"), 99);
        let applied = slot
            .check_and_set(|current| {
                assert_eq!(current, 99);
                None
            })
            .expect("live slot");
        assert!(!applied);
        let (value, version) = slot.get().expect("live slot");
        assert_eq!(value, Bytes::from_static(b"foo"));
        assert_eq!(version, 99);
    }

    #[test]
    fn check_and_set_fires_and_detaches_watchers() {
        let slot = Slot::new();
        let handle = slot.add_watcher().expect("live slot");
        let applied = slot
            .check_and_set(|current| {
                assert_eq!(current, 0);
                Some((Bytes::from_static(b"foo"), 99))
            })
            .expect("live slot");
        assert!(applied);
        assert_eq!(slot.watcher_count(), 0);

        let event = handle.waiter.fired().try_recv().expect("watcher fired");
        assert_eq!(event.value, Bytes::from_static(b"foo"));
        assert_eq!(event.version, 99);

        let (value, version) = slot.get().expect("live slot");
        assert_eq!(value, Bytes::from_static(b"foo"));
        assert_eq!(version, 99);
    }

    #[test]
    fn clear_on_absent_slot_fails() {
        let slot = Slot::new();
        let cleared = slot.clear(0, || {}).expect("live slot");
        assert!(!cleared);
    }

    #[test]
    fn clear_with_mismatched_version_fails() {
        let slot = Slot::with_value(Bytes::from_static(b"abc"), 99);
        let cleared = slot.clear(100, || {}).expect("live slot");
        assert!(!cleared);
        let (_, version) = slot.get().expect("live slot");
        assert_eq!(version, 99);
    }

    #[test]
    fn clear_with_matching_version_succeeds() {
        let slot = Slot::with_value(Bytes::from_static(b"abc"), 100);
        let gc_ran = Cell::new(false);
        let cleared = slot.clear(100, || gc_ran.set(true)).expect("live slot");
        assert!(cleared);
        assert!(gc_ran.get());
        assert!(slot.is_tombstoned());
    }

    #[test]
    fn clear_with_watchers_fires_absent_and_collects_the_slot() {
        let slot = Slot::with_value(Bytes::from_static(b"abc"), 99);
        let handle = slot.add_watcher().expect("live slot");
        let gc_ran = Cell::new(false);
        let cleared = slot.clear(0, || gc_ran.set(true)).expect("live slot");
        assert!(cleared);
        assert!(gc_ran.get());
        assert!(slot.is_tombstoned());

        // The detached waiter still observes the deletion.
        let event = handle.waiter.fired().try_recv().expect("watcher fired");
        assert!(event.value.is_empty());
        assert_eq!(event.version, 0);
    }
}

//! One-shot waiters: edge-triggered notifications registered against a slot.
//!
//! A waiter fires at most once, carrying the `(value, version)` pair the
//! slot held immediately after the transition that fired it. The payload
//! write happens-before the signal: delivering both through a single
//! bounded(1) channel send makes the payload visible to any observer of
//! the signal. The receiving side is a plain channel endpoint so a blocked
//! wait can select over it together with the storage-wide close signal.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

/// Payload delivered when a waiter fires.
///
/// A raw `version` of 0 means the value became absent (deletion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WakeEvent {
    pub(crate) value: Bytes,
    pub(crate) version: u64,
}

impl WakeEvent {
    pub(crate) fn absent() -> Self {
        Self {
            value: Bytes::new(),
            version: 0,
        }
    }
}

/// A one-shot edge-triggered notification.
///
/// Created by `Slot::add_watcher`, fired by the slot transition that
/// detaches it (check-and-set, clear) — never twice: the slot detaches the
/// watcher set before firing, and `fire` itself consumes the sender.
#[derive(Debug)]
pub(crate) struct Waiter {
    fire_tx: Mutex<Option<Sender<WakeEvent>>>,
    fired_rx: Receiver<WakeEvent>,
}

impl Waiter {
    pub(crate) fn new() -> Self {
        let (fire_tx, fired_rx) = bounded(1);
        Self {
            fire_tx: Mutex::new(Some(fire_tx)),
            fired_rx,
        }
    }

    /// Deliver `event` and publish the signal.
    ///
    /// Only the first call delivers; later calls are no-ops. A send error
    /// means the waiting side already gave up and dropped its receiver:
    /// the notification has nobody left to reach.
    pub(crate) fn fire(&self, event: WakeEvent) {
        if let Some(tx) = self.fire_tx.lock().take() {
            let _ = tx.send(event);
        }
    }

    /// The channel that delivers the fire payload; selected on together
    /// with the storage close signal.
    pub(crate) fn fired(&self) -> &Receiver<WakeEvent> {
        &self.fired_rx
    }

    #[cfg(test)]
    pub(crate) fn has_fired(&self) -> bool {
        self.fire_tx.lock().is_none()
    }
}

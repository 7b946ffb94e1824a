#![forbid(unsafe_code)]
//! The abstract latchkv storage contract.
//!
//! [`Storage`] is the seam between callers and backends: the in-process
//! reference engine lives in `lkv-memory`, and remote backends (etcd,
//! Redis, a filesystem) implement the same trait out of tree. The contract
//! combines optimistic version-based concurrency control with blocking
//! change notification: writers mutate under version preconditions, and
//! readers can block until a value moves away from a known version.
//!
//! Two error kinds exist ([`LkvError::Closed`] from every operation,
//! [`LkvError::WaitTimeout`] from the bounded wait forms). Everything else
//! (value already exists, value absent, version mismatch) is an ordinary
//! return value of `None` or `false`, not an error.

use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use lkv_error::{LkvError, Result};
pub use lkv_types::{StorageDetails, ValueDetails, Version, VersionedValue, raw_version};

/// A versioned key/value storage.
///
/// Implementations are safe to share across threads behind an `Arc`; all
/// operations take `&self`. Versions handed out by one instance are
/// strictly increasing over time and never compare meaningfully across
/// instances.
pub trait Storage: Send + Sync {
    /// Retrieve the current value for `key`.
    ///
    /// Returns `None` if the value does not exist. Never blocks.
    fn get_value(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Wait for the creation, update, or deletion of the value for `key`,
    /// blocking indefinitely (until the change or until the storage is
    /// closed).
    ///
    /// - If the value does not exist and `old_version` is `None`, blocks
    ///   until the value has been created.
    /// - If the value does not exist and `old_version` is given, returns
    ///   `None` right away.
    /// - If the value exists and `old_version` equals its current version,
    ///   blocks until the value has been updated (returning the new pair)
    ///   or deleted (returning `None`).
    /// - Otherwise returns the current pair right away.
    fn wait_for_value(
        &self,
        key: &str,
        old_version: Option<Version>,
    ) -> Result<Option<VersionedValue>>;

    /// Like [`wait_for_value`](Storage::wait_for_value), giving up at
    /// `deadline` with [`LkvError::WaitTimeout`].
    fn wait_for_value_deadline(
        &self,
        key: &str,
        old_version: Option<Version>,
        deadline: Instant,
    ) -> Result<Option<VersionedValue>>;

    /// Like [`wait_for_value`](Storage::wait_for_value), giving up after
    /// `timeout` with [`LkvError::WaitTimeout`].
    fn wait_for_value_timeout(
        &self,
        key: &str,
        old_version: Option<Version>,
        timeout: Duration,
    ) -> Result<Option<VersionedValue>> {
        self.wait_for_value_deadline(key, old_version, Instant::now() + timeout)
    }

    /// Create the value for `key`.
    ///
    /// Returns the version of the new value, or `None` if a value already
    /// exists.
    fn create_value(&self, key: &str, value: Bytes) -> Result<Option<Version>>;

    /// Update the existing value for `key`.
    ///
    /// With `old_version` of `None` the update is unconditional (as long as
    /// a value exists); otherwise it applies only if the current version
    /// matches. Returns the new version, or `None` if the value is absent
    /// or the precondition failed.
    fn update_value(
        &self,
        key: &str,
        value: Bytes,
        old_version: Option<Version>,
    ) -> Result<Option<Version>>;

    /// Create or update the value for `key` as a single atomic operation.
    ///
    /// Creates when absent, regardless of `old_version`: there is no
    /// current version to mismatch against. Otherwise behaves like
    /// [`update_value`](Storage::update_value). Returns the written
    /// version, or `None` on a version mismatch.
    fn create_or_update_value(
        &self,
        key: &str,
        value: Bytes,
        old_version: Option<Version>,
    ) -> Result<Option<Version>>;

    /// Delete the value for `key`.
    ///
    /// With `version` of `None` the deletion is unconditional; otherwise it
    /// applies only if the current version matches. Returns whether a value
    /// was deleted.
    fn delete_value(&self, key: &str, version: Option<Version>) -> Result<bool>;

    /// Close the storage, waking every blocked wait with
    /// [`LkvError::Closed`].
    ///
    /// Closing is terminal and idempotent in effect: the first call
    /// succeeds, every later call (and every other operation) fails with
    /// [`LkvError::Closed`].
    fn close(&self) -> Result<()>;

    /// A point-in-time snapshot of the stored values, for tests and
    /// debugging.
    fn inspect(&self) -> StorageDetails;
}

// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of DynaLease.
//
// DynaLease is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// DynaLease is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with DynaLease. If not, see <https://www.gnu.org/licenses/>.

//! In-memory lease handle and its timing predicates.

use crate::error::{LockError, LockResult};
use crate::store::Item;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked when a monitored lock enters the danger zone.
pub type SessionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Danger-zone configuration attached to a lock at acquisition.
///
/// The callback, when present, runs at most once per lock lifetime. Without
/// a callback the monitor still allows [`Lock::is_almost_expired`] polling.
pub(crate) struct SessionMonitor {
    safe_time: Duration,
    callback: Mutex<Option<SessionCallback>>,
}

impl SessionMonitor {
    pub(crate) fn new(safe_time: Duration, callback: Option<SessionCallback>) -> Self {
        Self {
            safe_time,
            callback: Mutex::new(callback),
        }
    }

    pub(crate) fn safe_time(&self) -> Duration {
        self.safe_time
    }

    /// Take the callback, leaving the monitor disarmed. At-most-once by
    /// construction.
    pub(crate) fn take_callback(&self) -> Option<SessionCallback> {
        self.callback.lock().take()
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }
}

/// Mutable half of a lock handle. Heartbeats and readers advance it in
/// place; release flips the flag.
struct LockState {
    record_version_number: String,
    lease_duration: Duration,
    lookup_time: DateTime<Utc>,
    data: Option<Vec<u8>>,
    additional_attributes: Item,
    is_released: bool,
}

struct LockInner {
    partition_key: String,
    sort_key: Option<String>,
    owner_name: String,
    delete_lock_on_release: bool,
    session_monitor: Option<SessionMonitor>,
    /// Serializes heartbeat refresh against release on the same handle, so
    /// the RVN and released flag are observed consistently across the store
    /// round-trip.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<LockState>,
}

/// Handle to an acquired (or observed) lock.
///
/// ## Purpose
/// Represents a lease on a named key. Handles are cheap to clone and share;
/// the background heartbeat and the owning client operate on the same
/// underlying state.
///
/// ## Behavior
/// A holder may treat the lock as its own only while [`Lock::is_expired`]
/// returns `false`: the lease is valid while `now - lookup_time` stays under
/// the lease duration and the handle has not been released.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        partition_key: String,
        sort_key: Option<String>,
        owner_name: String,
        delete_lock_on_release: bool,
        session_monitor: Option<SessionMonitor>,
        record_version_number: String,
        lease_duration: Duration,
        lookup_time: DateTime<Utc>,
        data: Option<Vec<u8>>,
        additional_attributes: Item,
        is_released: bool,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                partition_key,
                sort_key,
                owner_name,
                delete_lock_on_release,
                session_monitor,
                gate: tokio::sync::Mutex::new(()),
                state: Mutex::new(LockState {
                    record_version_number,
                    lease_duration,
                    lookup_time,
                    data,
                    additional_attributes,
                    is_released,
                }),
            }),
        }
    }

    /// An empty, already-expired handle. Returned by lookups of absent rows.
    pub(crate) fn empty() -> Self {
        Lock::new(
            String::new(),
            None,
            String::new(),
            false,
            None,
            String::new(),
            Duration::ZERO,
            DateTime::UNIX_EPOCH,
            None,
            Item::new(),
            false,
        )
    }

    /// Whether this handle refers to no row at all.
    pub fn is_empty(&self) -> bool {
        self.inner.partition_key.is_empty()
    }

    /// Partition key of the lock row.
    pub fn partition_key(&self) -> &str {
        &self.inner.partition_key
    }

    /// Sort key of the lock row, when the table uses a composite key.
    pub fn sort_key(&self) -> Option<&str> {
        self.inner.sort_key.as_deref()
    }

    /// Owner name asserted on the row.
    pub fn owner_name(&self) -> &str {
        &self.inner.owner_name
    }

    /// Whether release should delete the row instead of marking it released.
    pub fn delete_lock_on_release(&self) -> bool {
        self.inner.delete_lock_on_release
    }

    /// Identifier under which the client registers this lock: the partition
    /// key, extended with the sort key on composite tables.
    pub fn unique_identifier(&self) -> String {
        unique_identifier(&self.inner.partition_key, self.inner.sort_key.as_deref())
    }

    /// Current record version number of the handle.
    pub fn record_version_number(&self) -> String {
        self.inner.state.lock().record_version_number.clone()
    }

    /// Lease duration the owner claims.
    pub fn lease_duration(&self) -> Duration {
        self.inner.state.lock().lease_duration
    }

    /// Caller payload stored with the lock, if any.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.inner.state.lock().data.clone()
    }

    /// Caller-defined columns stored with the lock.
    pub fn additional_attributes(&self) -> Item {
        self.inner.state.lock().additional_attributes.clone()
    }

    /// Whether this handle was released.
    pub fn is_released(&self) -> bool {
        self.inner.state.lock().is_released
    }

    /// Whether the lease can no longer be trusted: the handle was released,
    /// or the lease duration elapsed since the last successful lookup.
    pub fn is_expired(&self) -> bool {
        let state = self.inner.state.lock();
        if state.is_released {
            return true;
        }
        let elapsed = Utc::now().signed_duration_since(state.lookup_time);
        match chrono::Duration::from_std(state.lease_duration) {
            Ok(lease) => elapsed >= lease,
            // A lease too large for the calendar never expires.
            Err(_) => false,
        }
    }

    /// Time left until the danger zone: lease duration minus elapsed time
    /// minus the monitor's safe time, floored at zero.
    ///
    /// Errors with [`LockError::SessionMonitorNotSet`] when the lock was
    /// acquired without a session monitor.
    pub fn time_until_danger_zone(&self) -> LockResult<Duration> {
        let monitor = self
            .inner
            .session_monitor
            .as_ref()
            .ok_or(LockError::SessionMonitorNotSet)?;
        let state = self.inner.state.lock();
        let lease = chrono::Duration::from_std(state.lease_duration)
            .map_err(|e| LockError::Config(format!("lease duration out of range: {e}")))?;
        let safe = chrono::Duration::from_std(monitor.safe_time())
            .map_err(|e| LockError::Config(format!("safe time out of range: {e}")))?;
        let elapsed = Utc::now().signed_duration_since(state.lookup_time);
        let remaining = lease - elapsed - safe;
        Ok(remaining.to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether the lock is in the danger zone: within `safe_time` of
    /// expiration (or past it).
    pub fn is_almost_expired(&self) -> LockResult<bool> {
        Ok(self.time_until_danger_zone()? == Duration::ZERO)
    }

    /// Advance the handle after a successful heartbeat or read.
    pub(crate) fn update_rvn(
        &self,
        record_version_number: String,
        lookup_time: DateTime<Utc>,
        lease_duration: Duration,
    ) {
        let mut state = self.inner.state.lock();
        state.record_version_number = record_version_number;
        state.lookup_time = lookup_time;
        state.lease_duration = lease_duration;
    }

    /// Replace the cached payload after a heartbeat rewrote it.
    pub(crate) fn set_data(&self, data: Option<Vec<u8>>) {
        self.inner.state.lock().data = data;
    }

    /// Mark the handle released locally.
    pub(crate) fn mark_released(&self) {
        self.inner.state.lock().is_released = true;
    }

    /// Serialize a heartbeat or release against the other on this handle.
    pub(crate) async fn acquire_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.gate.lock().await
    }

    pub(crate) fn session_monitor(&self) -> Option<&SessionMonitor> {
        self.inner.session_monitor.as_ref()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Lock")
            .field("partition_key", &self.inner.partition_key)
            .field("sort_key", &self.inner.sort_key)
            .field("owner_name", &self.inner.owner_name)
            .field("record_version_number", &state.record_version_number)
            .field("lease_duration", &state.lease_duration)
            .field("is_released", &state.is_released)
            .finish_non_exhaustive()
    }
}

/// Registry identifier for a (partition key, optional sort key) pair.
pub(crate) fn unique_identifier(partition_key: &str, sort_key: Option<&str>) -> String {
    match sort_key {
        Some(sk) => format!("{partition_key}#{sk}"),
        None => partition_key.to_string(),
    }
}

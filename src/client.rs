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

//! Lock client: acquisition engine, heartbeat loop, session monitors, and
//! the lifecycle facade.
//!
//! ## Acquisition protocol
//! Each attempt reads the current row with strong consistency and branches:
//! an absent or released row is claimed with a conditional put guarded on
//! absence/release; a live row is remembered as a contention witness, and
//! once the same record version number has been observed across a full lease
//! duration the row is claimed with a conditional put guarded on that exact
//! version. Condition failures mean another client won the race and are
//! never surfaced from the acquisition loop; the loop sleeps for the refresh
//! period and tries again until its wait budget runs out.
//!
//! ## Background work
//! One heartbeat task per client refreshes every held lock each period,
//! rewriting the record version number so stalled holders cannot be mistaken
//! for live ones. One watcher task per monitored lock sleeps until the
//! danger zone and fires the caller's callback at most once.

use crate::codec::{self, DecodedRow};
use crate::error::{LockError, LockResult, TimeoutError};
use crate::lock::{self, Lock, SessionCallback, SessionMonitor};
use crate::store::{Condition, CreateTableOptions, Item, LockStore, TableSchema, Update};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, instrument, warn};

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(20);
const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);
/// Default acquisition wait budget and retry period.
const DEFAULT_BUFFER: Duration = Duration::from_secs(1);
/// Owner names and record version numbers are 32 characters over a 62-glyph
/// alphabet, about 190 bits of entropy; collisions are treated as impossible.
const RANDOM_STRING_LENGTH: usize = 32;

/// Identity of a lock row: partition key plus optional sort key.
///
/// Converts from `&str`/`String` for hash-only tables and from 2-tuples for
/// composite tables: `client.acquire_lock(("host", "replica-2"), …)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    partition_key: String,
    sort_key: Option<String>,
}

impl LockKey {
    /// Key for a hash-only table.
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    /// Key for a composite table.
    pub fn with_sort_key(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: Some(sort_key.into()),
        }
    }

    /// The partition key.
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// The sort key, when present.
    pub fn sort_key(&self) -> Option<&str> {
        self.sort_key.as_deref()
    }

    fn unique_identifier(&self) -> String {
        lock::unique_identifier(&self.partition_key, self.sort_key.as_deref())
    }
}

impl From<&str> for LockKey {
    fn from(partition_key: &str) -> Self {
        LockKey::new(partition_key)
    }
}

impl From<String> for LockKey {
    fn from(partition_key: String) -> Self {
        LockKey::new(partition_key)
    }
}

impl From<(&str, &str)> for LockKey {
    fn from((partition_key, sort_key): (&str, &str)) -> Self {
        LockKey::with_sort_key(partition_key, sort_key)
    }
}

impl From<(String, String)> for LockKey {
    fn from((partition_key, sort_key): (String, String)) -> Self {
        LockKey::with_sort_key(partition_key, sort_key)
    }
}

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Owner name asserted on every row this client writes. A random
    /// 32-character string is generated when absent.
    pub owner_name: Option<String>,
    /// How long each acquired lease is claimed valid. Default 20 seconds.
    pub lease_duration: Duration,
    /// How often the background task refreshes held locks. Default 5
    /// seconds; zero disables heartbeating.
    pub heartbeat_period: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            owner_name: None,
            lease_duration: DEFAULT_LEASE_DURATION,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
        }
    }
}

impl ClientOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the owner name instead of generating one.
    pub fn with_owner_name(mut self, owner_name: impl Into<String>) -> Self {
        self.owner_name = Some(owner_name.into());
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set the heartbeat period. Zero disables the heartbeat task.
    pub fn with_heartbeat_period(mut self, heartbeat_period: Duration) -> Self {
        self.heartbeat_period = heartbeat_period;
        self
    }

    /// Disable automatic heartbeats; use
    /// [`LockClient::send_heartbeat`] to freshen locks manually.
    pub fn disable_heartbeat(mut self) -> Self {
        self.heartbeat_period = Duration::ZERO;
        self
    }
}

/// Danger-zone monitoring requested at acquisition.
pub struct SessionMonitorConfig {
    safe_time: Duration,
    callback: Option<SessionCallback>,
}

impl SessionMonitorConfig {
    /// Monitor with a callback fired once when the lock enters the danger
    /// zone.
    pub fn new(safe_time: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            safe_time,
            callback: Some(Box::new(callback)),
        }
    }

    /// Monitor without a callback; [`Lock::is_almost_expired`] polling still
    /// works.
    pub fn without_callback(safe_time: Duration) -> Self {
        Self {
            safe_time,
            callback: None,
        }
    }
}

/// Options for [`LockClient::acquire_lock`].
///
/// Duration fields left at zero fall back to their one-second defaults.
#[derive(Default)]
pub struct AcquireOptions {
    /// Payload to store with the lock. Without `replace_data`, an existing
    /// row's payload is preserved and this is only written to fresh rows.
    pub data: Option<Vec<u8>>,
    /// Force `data` to overwrite whatever the row holds.
    pub replace_data: bool,
    /// Give up after the first read instead of waiting for the lock.
    pub fail_if_locked: bool,
    /// Delete the row on release instead of marking it released.
    pub delete_lock_on_release: bool,
    /// How long to sleep between acquisition attempts. Default 1 second.
    pub refresh_period: Duration,
    /// How long to keep trying on top of one lease duration. Default 1
    /// second.
    pub additional_time_to_wait_for_lock: Duration,
    /// Caller-defined columns stored with the lock. Reserved names are
    /// rejected.
    pub additional_attributes: Item,
    /// Danger-zone monitoring for the acquired lock.
    pub session_monitor: Option<SessionMonitorConfig>,
}

impl AcquireOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` with the lock.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Force the payload to replace the row's current one.
    pub fn with_replace_data(mut self) -> Self {
        self.replace_data = true;
        self
    }

    /// Return `LockNotGranted` immediately when the lock is held.
    pub fn with_fail_if_locked(mut self) -> Self {
        self.fail_if_locked = true;
        self
    }

    /// Delete the row when the lock is released.
    pub fn with_delete_lock_on_release(mut self) -> Self {
        self.delete_lock_on_release = true;
        self
    }

    /// Set the sleep between acquisition attempts.
    pub fn with_refresh_period(mut self, refresh_period: Duration) -> Self {
        self.refresh_period = refresh_period;
        self
    }

    /// Set the extra wait budget on top of one lease duration.
    pub fn with_additional_time_to_wait_for_lock(mut self, wait: Duration) -> Self {
        self.additional_time_to_wait_for_lock = wait;
        self
    }

    /// Store an extra caller-defined column with the lock.
    pub fn with_additional_attribute(
        mut self,
        name: impl Into<String>,
        value: AttributeValue,
    ) -> Self {
        self.additional_attributes.insert(name.into(), value);
        self
    }

    /// Arm a session monitor with a danger-zone callback.
    pub fn with_session_monitor(
        mut self,
        safe_time: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.session_monitor = Some(SessionMonitorConfig::new(safe_time, callback));
        self
    }

    /// Arm a session monitor for polling only, with no callback.
    pub fn with_session_monitor_without_callback(mut self, safe_time: Duration) -> Self {
        self.session_monitor = Some(SessionMonitorConfig::without_callback(safe_time));
        self
    }
}

/// Options for [`LockClient::release_lock_with_options`].
#[derive(Debug, Clone, Default)]
pub struct ReleaseOptions {
    /// Whether to delete the row. Inherits the handle's
    /// `delete_lock_on_release` when absent.
    pub delete_lock: Option<bool>,
    /// New payload persisted with the released row; ignored when deleting.
    pub data: Option<Vec<u8>>,
}

impl ReleaseOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override whether the row is deleted on release.
    pub fn with_delete_lock(mut self, delete_lock: bool) -> Self {
        self.delete_lock = Some(delete_lock);
        self
    }

    /// Persist new payload with the released row.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// Options for [`LockClient::send_heartbeat_with_options`].
#[derive(Debug, Clone, Default)]
pub struct HeartbeatOptions {
    /// Replace the stored payload along with the refresh.
    pub data: Option<Vec<u8>>,
    /// Remove the stored payload along with the refresh. Cannot be combined
    /// with `data`.
    pub delete_data: bool,
}

impl HeartbeatOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored payload.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Remove the stored payload.
    pub fn with_delete_data(mut self) -> Self {
        self.delete_data = true;
        self
    }
}

struct ClientInner {
    store: Arc<dyn LockStore>,
    table_name: String,
    partition_key_name: String,
    sort_key_name: Option<String>,
    owner_name: String,
    lease_duration: Duration,
    heartbeat_period: Duration,
    /// Locks this client currently holds, by unique identifier.
    locks: DashMap<String, Lock>,
    /// Cancellation handles for armed session monitors; dropping the sender
    /// stops the watcher task.
    session_monitors: DashMap<String, oneshot::Sender<()>>,
    /// Close interlock: user-facing operations hold the read side, `close`
    /// the write side. The flag is the closed state.
    closed: RwLock<bool>,
    heartbeat_shutdown: watch::Sender<bool>,
    heartbeat_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn key_item_for(&self, partition_key: &str, sort_key: Option<&str>) -> Item {
        let mut item = Item::new();
        item.insert(
            self.partition_key_name.clone(),
            AttributeValue::S(partition_key.to_string()),
        );
        if let (Some(name), Some(sort_key)) = (&self.sort_key_name, sort_key) {
            item.insert(name.clone(), AttributeValue::S(sort_key.to_string()));
        }
        item
    }

    fn key_item(&self, key: &LockKey) -> Item {
        self.key_item_for(key.partition_key(), key.sort_key())
    }

    fn validate_key(&self, key: &LockKey) -> LockResult<()> {
        match (&self.sort_key_name, key.sort_key()) {
            (Some(_), None) => Err(LockError::InvalidKey(
                "this client's table uses a sort key; supply one with the partition key"
                    .to_string(),
            )),
            (None, Some(_)) => Err(LockError::InvalidKey(
                "this client's table has no sort key".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The row is free: it does not exist, or it was explicitly released.
    fn new_or_released_condition(&self) -> Condition {
        Condition::not_exists(&self.partition_key_name).or(Condition::exists(
            &self.partition_key_name,
        )
        .and(Condition::equals(
            codec::ATTR_IS_RELEASED,
            AttributeValue::S(codec::IS_RELEASED_VALUE.to_string()),
        )))
    }

    /// The row still carries the version we observed a full lease ago: no
    /// owner has heartbeated since.
    fn expired_takeover_condition(&self, observed_rvn: &str) -> Condition {
        Condition::exists(&self.partition_key_name).and(Condition::equals(
            codec::ATTR_RECORD_VERSION_NUMBER,
            AttributeValue::S(observed_rvn.to_string()),
        ))
    }

    /// The row exists with the expected version and this client's owner
    /// name.
    fn ownership_condition(&self, record_version_number: &str) -> Condition {
        Condition::exists(&self.partition_key_name)
            .and(Condition::equals(
                codec::ATTR_RECORD_VERSION_NUMBER,
                AttributeValue::S(record_version_number.to_string()),
            ))
            .and(Condition::equals(
                codec::ATTR_OWNER_NAME,
                AttributeValue::S(self.owner_name.clone()),
            ))
    }
}

/// A live lock row observed during acquisition: the witness for the expired
/// takeover protocol.
struct ContendingLock {
    record_version_number: String,
    lease_duration: Duration,
    observed_at: DateTime<Utc>,
}

impl ContendingLock {
    fn from_row(row: &DecodedRow) -> Self {
        Self {
            record_version_number: row.record_version_number.clone(),
            lease_duration: row.lease_duration,
            observed_at: row.lookup_time,
        }
    }

    fn is_expired(&self) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.observed_at);
        match chrono::Duration::from_std(self.lease_duration) {
            Ok(lease) => elapsed >= lease,
            Err(_) => false,
        }
    }
}

/// State of one `acquire_lock` call across its retry loop.
struct Attempt {
    key: LockKey,
    data: Option<Vec<u8>>,
    replace_data: bool,
    fail_if_locked: bool,
    delete_lock_on_release: bool,
    additional_attributes: Item,
    session_monitor: Option<SessionMonitorConfig>,
    refresh_period: Duration,
    wait_budget: Duration,
    started: Instant,
    contending: Option<ContendingLock>,
    budget_extended: bool,
}

impl Attempt {
    fn new(key: LockKey, options: AcquireOptions) -> Self {
        let refresh_period = if options.refresh_period.is_zero() {
            DEFAULT_BUFFER
        } else {
            options.refresh_period
        };
        let wait_budget = if options.additional_time_to_wait_for_lock.is_zero() {
            DEFAULT_BUFFER
        } else {
            options.additional_time_to_wait_for_lock
        };
        Self {
            key,
            data: options.data,
            replace_data: options.replace_data,
            fail_if_locked: options.fail_if_locked,
            delete_lock_on_release: options.delete_lock_on_release,
            additional_attributes: options.additional_attributes,
            session_monitor: options.session_monitor,
            refresh_period,
            wait_budget,
            started: Instant::now(),
            contending: None,
            budget_extended: false,
        }
    }
}

/// DynamoDB-backed distributed lock client.
///
/// ## Purpose
/// Hands out exclusive, time-bounded leases on named keys to callers across
/// processes and hosts. A background task keeps held leases fresh; a closed
/// client refuses all further work.
///
/// Cloning is cheap and clones share all state, including the held-locks
/// registry and the heartbeat task.
///
/// ## Example
/// ```rust,no_run
/// use dynalease::{AcquireOptions, ClientOptions, DynamoDbLockStore, LockClient};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), dynalease::LockError> {
/// let store = Arc::new(DynamoDbLockStore::connect("us-east-1", None).await);
/// let client = LockClient::new(store, "locks", "key", ClientOptions::new())?;
///
/// let lock = client
///     .acquire_lock("leader", AcquireOptions::new().with_data(b"node-1".to_vec()))
///     .await?;
/// // ... critical section ...
/// client.release_lock(&lock).await?;
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LockClient {
    inner: Arc<ClientInner>,
}

impl LockClient {
    /// Create a client for a hash-only table.
    ///
    /// Must be called within a Tokio runtime when heartbeats are enabled,
    /// since the heartbeat task is spawned here. Fails when the lease
    /// duration cannot cover two heartbeat periods.
    pub fn new(
        store: Arc<dyn LockStore>,
        table_name: impl Into<String>,
        partition_key_name: impl Into<String>,
        options: ClientOptions,
    ) -> LockResult<Self> {
        Self::build(
            store,
            table_name.into(),
            partition_key_name.into(),
            None,
            options,
        )
    }

    /// Create a client for a composite (hash + range) table.
    pub fn new_with_sort_key(
        store: Arc<dyn LockStore>,
        table_name: impl Into<String>,
        partition_key_name: impl Into<String>,
        sort_key_name: impl Into<String>,
        options: ClientOptions,
    ) -> LockResult<Self> {
        let sort_key_name = sort_key_name.into();
        if sort_key_name.is_empty() {
            return Err(LockError::Config(
                "a sort key name must be supplied; use new() if the table has no sort key"
                    .to_string(),
            ));
        }
        Self::build(
            store,
            table_name.into(),
            partition_key_name.into(),
            Some(sort_key_name),
            options,
        )
    }

    fn build(
        store: Arc<dyn LockStore>,
        table_name: String,
        partition_key_name: String,
        sort_key_name: Option<String>,
        options: ClientOptions,
    ) -> LockResult<Self> {
        if !options.heartbeat_period.is_zero()
            && options.lease_duration < 2 * options.heartbeat_period
        {
            return Err(LockError::Config(
                "heartbeat period must be no more than half the lease duration, or locks \
                 might expire before the heartbeat task refreshes them (four or more times \
                 shorter is recommended)"
                    .to_string(),
            ));
        }

        let owner_name = options
            .owner_name
            .unwrap_or_else(|| random_string(RANDOM_STRING_LENGTH));
        let (heartbeat_shutdown, shutdown_rx) = watch::channel(false);
        let client = LockClient {
            inner: Arc::new(ClientInner {
                store,
                table_name,
                partition_key_name,
                sort_key_name,
                owner_name,
                lease_duration: options.lease_duration,
                heartbeat_period: options.heartbeat_period,
                locks: DashMap::new(),
                session_monitors: DashMap::new(),
                closed: RwLock::new(false),
                heartbeat_shutdown,
                heartbeat_handle: parking_lot::Mutex::new(None),
            }),
        };

        if !client.inner.heartbeat_period.is_zero() {
            let handle = tokio::spawn(heartbeat_loop(client.clone(), shutdown_rx));
            *client.inner.heartbeat_handle.lock() = Some(handle);
        }
        Ok(client)
    }

    /// Owner name this client asserts on every write.
    pub fn owner_name(&self) -> &str {
        &self.inner.owner_name
    }

    /// Table this client operates on.
    pub fn table_name(&self) -> &str {
        &self.inner.table_name
    }

    /// Lease duration written with every acquisition and heartbeat.
    pub fn lease_duration(&self) -> Duration {
        self.inner.lease_duration
    }

    /// Whether [`LockClient::close`] has completed.
    pub async fn is_closed(&self) -> bool {
        *self.inner.closed.read().await
    }

    /// Acquire the named lock, waiting out a live holder if necessary.
    ///
    /// ## Behavior
    /// Retries until the lock is granted or the wait budget runs out. The
    /// budget starts at `additional_time_to_wait_for_lock` and is extended
    /// by exactly one lease duration the first time a live holder is
    /// observed, guaranteeing a full lease cycle of patience. Dropping the
    /// returned future (or racing it with a timeout) abandons the wait at
    /// the next sleep or store boundary.
    ///
    /// ## Returns
    /// - `Ok(lock)`: the lease is held and registered for heartbeats
    /// - `Err(LockError::LockNotGranted { .. })`: budget exhausted, or
    ///   `fail_if_locked` saw a live holder
    /// - `Err(LockError::ClientClosed)`: the client was closed
    #[instrument(
        level = "debug",
        skip_all,
        fields(table = %self.inner.table_name, owner = %self.inner.owner_name)
    )]
    pub async fn acquire_lock(
        &self,
        key: impl Into<LockKey>,
        options: AcquireOptions,
    ) -> LockResult<Lock> {
        let key = key.into();
        // Hold the read side for the whole loop so `close` cannot slip in
        // between attempts.
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(LockError::ClientClosed);
        }
        self.inner.validate_key(&key)?;
        if let Some(name) = codec::reserved_collision(
            &self.inner.partition_key_name,
            self.inner.sort_key_name.as_deref(),
            &options.additional_attributes,
        ) {
            return Err(LockError::ReservedAttribute(name));
        }

        let mut attempt = Attempt::new(key, options);
        loop {
            if let Some(lock) = self.try_store_lock(&mut attempt).await? {
                return Ok(lock);
            }
            debug!(
                refresh_period = ?attempt.refresh_period,
                partition_key = %attempt.key.partition_key(),
                "lock is busy, sleeping for a refresh period"
            );
            tokio::time::sleep(attempt.refresh_period).await;
        }
    }

    /// One pass of the acquisition state machine. `Ok(None)` means "not
    /// granted this attempt, sleep and retry".
    async fn try_store_lock(&self, attempt: &mut Attempt) -> LockResult<Option<Lock>> {
        let inner = &self.inner;
        debug!(
            partition_key = %attempt.key.partition_key(),
            "reading the current lock row"
        );
        let existing = self.read_lock_row(&attempt.key).await?;

        let new_data = if attempt.replace_data {
            attempt.data.clone()
        } else {
            existing
                .as_ref()
                .and_then(|row| row.data.clone())
                .or_else(|| attempt.data.clone())
        };

        // Existing row attributes first, caller's overlays win.
        let mut merged_attributes = existing
            .as_ref()
            .map(|row| row.additional_attributes.clone())
            .unwrap_or_default();
        for (name, value) in &attempt.additional_attributes {
            merged_attributes.insert(name.clone(), value.clone());
        }

        let record_version_number = random_string(RANDOM_STRING_LENGTH);
        let item = codec::encode_lock_row(
            inner.key_item(&attempt.key),
            &inner.owner_name,
            inner.lease_duration,
            &record_version_number,
            new_data.as_deref(),
            &merged_attributes,
        );

        let row = match existing {
            Some(row) if !row.is_released => row,
            _ => {
                // Absent or explicitly released: claim it outright.
                debug!(
                    partition_key = %attempt.key.partition_key(),
                    "acquiring a new or released lock"
                );
                let condition = inner.new_or_released_condition();
                return match self
                    .put_and_register(attempt, item, record_version_number, new_data, merged_attributes, condition)
                    .await
                {
                    Ok(lock) => Ok(Some(lock)),
                    Err(err) if err.is_condition_failed() => Ok(None),
                    Err(err) => Err(err),
                };
            }
        };

        let witness = attempt
            .contending
            .as_ref()
            .map(|w| (w.record_version_number.clone(), w.is_expired()));
        match witness {
            None => {
                if attempt.fail_if_locked {
                    return Err(LockError::not_granted(
                        "lock is held and the request is configured not to retry",
                    ));
                }
                // First sighting of a live holder: it may hold the lease for
                // its full duration, so the wait budget grows by one lease,
                // once.
                if !attempt.budget_extended {
                    attempt.budget_extended = true;
                    attempt.wait_budget += row.lease_duration;
                }
                attempt.contending = Some(ContendingLock::from_row(&row));
            }
            Some((witness_rvn, expired))
                if witness_rvn == row.record_version_number && expired =>
            {
                // Same version across a full lease: the owner went quiet.
                debug!(
                    partition_key = %attempt.key.partition_key(),
                    "taking over an expired lock"
                );
                let condition = inner.expired_takeover_condition(&witness_rvn);
                return match self
                    .put_and_register(attempt, item, record_version_number, new_data, merged_attributes, condition)
                    .await
                {
                    Ok(lock) => Ok(Some(lock)),
                    Err(err) if err.is_condition_failed() => Ok(None),
                    Err(err) => Err(err),
                };
            }
            Some((witness_rvn, _)) if witness_rvn != row.record_version_number => {
                // The owner heartbeated; restart the witness clock.
                attempt.contending = Some(ContendingLock::from_row(&row));
            }
            Some(_) => {}
        }

        let age = attempt.started.elapsed();
        if age > attempt.wait_budget {
            return Err(LockError::LockNotGranted {
                reason: "didn't acquire lock after sleeping".to_string(),
                cause: Some(TimeoutError { age }),
            });
        }
        Ok(None)
    }

    /// Conditional put of the proposed row; on success, build the handle,
    /// register it for heartbeats, and arm its session monitor.
    async fn put_and_register(
        &self,
        attempt: &mut Attempt,
        item: Item,
        record_version_number: String,
        data: Option<Vec<u8>>,
        additional_attributes: Item,
        condition: Condition,
    ) -> LockResult<Lock> {
        let inner = &self.inner;
        // The holder errs on the side of thinking the lease expires sooner
        // than it does: the clock starts before the put, not after.
        let lookup_time = Utc::now();
        inner
            .store
            .put_item(&inner.table_name, item, condition)
            .await?;

        let session_monitor = attempt
            .session_monitor
            .take()
            .map(|config| SessionMonitor::new(config.safe_time, config.callback));
        let lock = Lock::new(
            attempt.key.partition_key().to_string(),
            attempt.key.sort_key().map(str::to_string),
            inner.owner_name.clone(),
            attempt.delete_lock_on_release,
            session_monitor,
            record_version_number,
            inner.lease_duration,
            lookup_time,
            data,
            additional_attributes,
            false,
        );
        inner.locks.insert(lock.unique_identifier(), lock.clone());
        self.arm_session_monitor(&lock);
        debug!(
            partition_key = %lock.partition_key(),
            owner = %inner.owner_name,
            "lock acquired"
        );
        Ok(lock)
    }

    async fn read_lock_row(&self, key: &LockKey) -> LockResult<Option<DecodedRow>> {
        let inner = &self.inner;
        let key_item = inner.key_item(key);
        match inner.store.get_item(&inner.table_name, &key_item).await? {
            Some(item) => codec::decode_lock_row(
                item,
                &inner.partition_key_name,
                inner.sort_key_name.as_deref(),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// Find out who owns the named lock without acquiring it.
    ///
    /// Returns the registered handle when this client holds the lock (so
    /// release works on it). Otherwise returns a decoded, read-only view
    /// whose version is cleared and which always reads as expired; an absent
    /// row yields an empty handle.
    #[instrument(level = "debug", skip_all, fields(table = %self.inner.table_name))]
    pub async fn get_lock(&self, key: impl Into<LockKey>) -> LockResult<Lock> {
        let key = key.into();
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(LockError::ClientClosed);
        }
        self.inner.validate_key(&key)?;

        if let Some(held) = self.inner.locks.get(&key.unique_identifier()) {
            return Ok(held.value().clone());
        }
        let Some(row) = self.read_lock_row(&key).await? else {
            return Ok(Lock::empty());
        };
        let lease_duration = row.lease_duration;
        let lock = Lock::new(
            key.partition_key().to_string(),
            key.sort_key().map(str::to_string),
            row.owner_name,
            false,
            None,
            row.record_version_number,
            lease_duration,
            row.lookup_time,
            row.data,
            row.additional_attributes,
            row.is_released,
        );
        // Observed, not held: clear the version so the handle cannot pass an
        // ownership check, and backdate it so it reads as expired.
        lock.update_rvn(String::new(), DateTime::UNIX_EPOCH, lease_duration);
        Ok(lock)
    }

    /// Release the given lock if this client still holds it.
    ///
    /// The handle is marked released and deregistered even when the store
    /// write is denied because someone else took the row over; the denial is
    /// still reported.
    pub async fn release_lock(&self, lock: &Lock) -> LockResult<()> {
        self.release_lock_with_options(lock, ReleaseOptions::default())
            .await
    }

    /// [`LockClient::release_lock`] with explicit options.
    #[instrument(
        level = "debug",
        skip_all,
        fields(table = %self.inner.table_name, owner = %self.inner.owner_name)
    )]
    pub async fn release_lock_with_options(
        &self,
        lock: &Lock,
        options: ReleaseOptions,
    ) -> LockResult<()> {
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(LockError::ClientClosed);
        }
        self.release_lock_inner(lock, options).await
    }

    /// Release without touching the close interlock; shared by the public
    /// path and `close`.
    async fn release_lock_inner(&self, lock: &Lock, options: ReleaseOptions) -> LockResult<()> {
        let inner = &self.inner;
        if lock.is_empty() {
            return Err(LockError::CannotReleaseNullLock);
        }
        if lock.owner_name() != inner.owner_name {
            return Err(LockError::OwnerMismatched);
        }
        let delete_lock = options
            .delete_lock
            .unwrap_or_else(|| lock.delete_lock_on_release());

        let _gate = lock.acquire_gate().await;
        let record_version_number = lock.record_version_number();
        lock.mark_released();
        inner.locks.remove(&lock.unique_identifier());
        // Dropping the sender stops the watcher task.
        inner.session_monitors.remove(&lock.unique_identifier());

        let key_item = inner.key_item_for(lock.partition_key(), lock.sort_key());
        let condition = inner.ownership_condition(&record_version_number);
        if delete_lock {
            inner
                .store
                .delete_item(&inner.table_name, key_item, condition)
                .await?;
        } else {
            let mut update = Update::default().set(
                codec::ATTR_IS_RELEASED,
                AttributeValue::S(codec::IS_RELEASED_VALUE.to_string()),
            );
            if let Some(data) = options.data {
                if !data.is_empty() {
                    update = update.set(codec::ATTR_DATA, AttributeValue::B(Blob::new(data)));
                }
            }
            inner
                .store
                .update_item(&inner.table_name, key_item, update, condition)
                .await?;
        }
        debug!(partition_key = %lock.partition_key(), "lock released");
        Ok(())
    }

    /// Refresh the lease on a held lock.
    ///
    /// Writes a new record version number and lease duration under the
    /// ownership condition, then advances the handle. Rewriting the version
    /// on every refresh is what makes a stalled holder distinguishable from
    /// a live one: any stale version witness a contender holds stops
    /// matching.
    pub async fn send_heartbeat(&self, lock: &Lock) -> LockResult<()> {
        self.send_heartbeat_with_options(lock, HeartbeatOptions::default())
            .await
    }

    /// [`LockClient::send_heartbeat`] with explicit options.
    #[instrument(
        level = "debug",
        skip_all,
        fields(table = %self.inner.table_name, owner = %self.inner.owner_name)
    )]
    pub async fn send_heartbeat_with_options(
        &self,
        lock: &Lock,
        options: HeartbeatOptions,
    ) -> LockResult<()> {
        // Hold the read side for the whole refresh so `close` cannot race it.
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(LockError::ClientClosed);
        }
        if options.delete_data && options.data.is_some() {
            return Err(LockError::Config(
                "delete_data cannot be combined with new data".to_string(),
            ));
        }

        let inner = &self.inner;
        let _gate = lock.acquire_gate().await;
        // Only release or close deregister a lock; a failed precheck leaves
        // it in place for the next tick.
        if lock.is_expired() || lock.owner_name() != inner.owner_name {
            return Err(LockError::not_granted(
                "cannot send heartbeat because lock is not granted",
            ));
        }

        let old_record_version_number = lock.record_version_number();
        let record_version_number = random_string(RANDOM_STRING_LENGTH);
        let mut update = Update::default()
            .set(
                codec::ATTR_RECORD_VERSION_NUMBER,
                AttributeValue::S(record_version_number.clone()),
            )
            .set(
                codec::ATTR_LEASE_DURATION,
                AttributeValue::S(codec::format_duration(inner.lease_duration)),
            );
        if options.delete_data {
            update = update.remove(codec::ATTR_DATA);
        } else if let Some(data) = &options.data {
            update = update.set(codec::ATTR_DATA, AttributeValue::B(Blob::new(data.clone())));
        }

        let key_item = inner.key_item_for(lock.partition_key(), lock.sort_key());
        let condition = inner.ownership_condition(&old_record_version_number);
        let lookup_time = Utc::now();
        inner
            .store
            .update_item(&inner.table_name, key_item, update, condition)
            .await?;

        if options.delete_data {
            lock.set_data(None);
        } else if let Some(data) = options.data {
            lock.set_data(Some(data));
        }
        lock.update_rvn(record_version_number, lookup_time, inner.lease_duration);
        debug!(partition_key = %lock.partition_key(), "heartbeat sent");
        Ok(())
    }

    /// Create the lock table for this client's key schema, with
    /// pay-per-request billing.
    ///
    /// Lock tables should be provisioned ahead of time; creating one that
    /// already exists is an error.
    pub async fn create_table(&self) -> LockResult<()> {
        self.create_table_with_options(CreateTableOptions::default())
            .await
    }

    /// [`LockClient::create_table`] with explicit options.
    pub async fn create_table_with_options(&self, options: CreateTableOptions) -> LockResult<()> {
        // Hold the read side for the whole call so `close` cannot race it.
        let closed = self.inner.closed.read().await;
        if *closed {
            return Err(LockError::ClientClosed);
        }
        let inner = &self.inner;
        let schema = TableSchema {
            partition_key_name: inner.partition_key_name.clone(),
            sort_key_name: inner.sort_key_name.clone(),
        };
        inner
            .store
            .create_table(&inner.table_name, &schema, &options)
            .await
    }

    /// Close the client: best-effort release of every held lock, stop the
    /// heartbeat task, and refuse all further operations.
    ///
    /// Waits for in-flight acquisitions to finish (they hold the read side
    /// of the close interlock, bounded by their wait budgets). Idempotent;
    /// the second and later calls return `ClientClosed` and perform no I/O.
    /// The first call returns the first release failure, if any.
    #[instrument(level = "debug", skip_all, fields(owner = %self.inner.owner_name))]
    pub async fn close(&self) -> LockResult<()> {
        let inner = &self.inner;
        let mut closed = inner.closed.write().await;
        if *closed {
            return Err(LockError::ClientClosed);
        }

        let held: Vec<Lock> = inner.locks.iter().map(|entry| entry.value().clone()).collect();
        let mut first_error: Option<LockError> = None;
        for lock in held {
            if let Err(err) = self
                .release_lock_inner(&lock, ReleaseOptions::default())
                .await
            {
                warn!(
                    partition_key = %lock.partition_key(),
                    error = %err,
                    "failed to release lock while closing"
                );
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        let _ = inner.heartbeat_shutdown.send(true);
        *closed = true;
        drop(closed);

        // Await off the write guard: a blocked heartbeat needs the read side
        // to observe the closed flag and wind down.
        let handle = inner.heartbeat_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("client closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Spawn the danger-zone watcher for a freshly acquired lock, when it
    /// carries a monitor with a callback.
    fn arm_session_monitor(&self, lock: &Lock) {
        let has_callback = lock
            .session_monitor()
            .map(|monitor| monitor.has_callback())
            .unwrap_or(false);
        if !has_callback {
            return;
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let name = lock.unique_identifier();
        self.inner.session_monitors.insert(name.clone(), cancel_tx);
        tokio::spawn(session_monitor_task(
            self.inner.clone(),
            name,
            lock.clone(),
            cancel_rx,
        ));
    }
}

/// Periodically refreshes every held lock until the client closes.
///
/// Errors are logged and the lock stays registered; the next tick retries.
/// Only release or close remove a lock from the registry.
async fn heartbeat_loop(client: LockClient, mut shutdown: watch::Receiver<bool>) {
    debug!(owner = %client.inner.owner_name, "starting heartbeats");
    let mut ticker = tokio::time::interval(client.inner.heartbeat_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first interval tick completes immediately; the first heartbeat
    // should come one full period after startup.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("client closed, stopping heartbeat");
                return;
            }
            _ = ticker.tick() => {
                let held: Vec<Lock> = client
                    .inner
                    .locks
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for lock in held {
                    if let Err(err) = client.send_heartbeat(&lock).await {
                        error!(
                            partition_key = %lock.partition_key(),
                            error = %err,
                            "error sending heartbeat"
                        );
                    }
                }
            }
        }
    }
}

/// Sleeps until the lock enters the danger zone, fires the callback once,
/// and exits. Release cancels it by dropping the sender.
async fn session_monitor_task(
    inner: Arc<ClientInner>,
    name: String,
    lock: Lock,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut canceled = false;
    loop {
        let remaining = match lock.time_until_danger_zone() {
            Ok(remaining) => remaining,
            Err(err) => {
                error!(error = %err, "cannot run session monitor");
                break;
            }
        };
        if remaining.is_zero() {
            if let Some(callback) = lock.session_monitor().and_then(|m| m.take_callback()) {
                debug!(partition_key = %lock.partition_key(), "lock entered the danger zone");
                tokio::spawn(async move { callback() });
            }
            break;
        }
        tokio::select! {
            _ = &mut cancel => {
                canceled = true;
                break;
            }
            _ = tokio::time::sleep(remaining) => {}
        }
    }
    // A canceled watcher was already deregistered by release; removing here
    // could clobber a successor's registration.
    if !canceled {
        inner.session_monitors.remove(&name);
    }
}

/// Random string over `[0-9a-zA-Z]` from the thread-local CSPRNG.
fn random_string(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

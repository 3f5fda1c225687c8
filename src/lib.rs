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

//! # DynaLease
//!
//! ## Purpose
//! Distributed mutual exclusion on top of DynamoDB's conditional writes.
//! Clients across processes and hosts contend for named locks; the winner
//! holds an exclusive lease for a bounded duration and must keep
//! heartbeating it or forfeit the lock to the next contender.
//!
//! ## How it works
//! Every lock is one table row carrying an owner name, a lease duration,
//! and a random record version number (RVN) that is rewritten on every
//! mutation. All writes are conditional:
//!
//! - **Fresh acquisition** requires the row to be absent or explicitly
//!   released.
//! - **Takeover** requires the RVN to still equal the one observed a full
//!   lease duration earlier, which proves the owner stopped heartbeating.
//! - **Heartbeat and release** require the row to carry the expected RVN
//!   and this client's owner name.
//!
//! A background task heartbeats every held lock each period; each refresh
//! installs a fresh RVN, so a live holder keeps breaking whatever stale
//! witnesses concurrent acquirers hold. Optional session monitors warn
//! holders shortly before their lease runs out.
//!
//! ## Key Components
//! - [`LockClient`]: lifecycle facade (acquire / get / release / heartbeat /
//!   close)
//! - [`Lock`]: in-memory lease handle with timing predicates
//! - [`LockStore`]: conditional CRUD abstraction over the backing table
//! - [`DynamoDbLockStore`]: the DynamoDB backend
//! - [`InMemoryLockStore`]: linearizable test backend
//!
//! ## Examples
//!
//! ### Leader election with a session monitor
//! ```rust,no_run
//! use dynalease::{AcquireOptions, ClientOptions, DynamoDbLockStore, LockClient};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), dynalease::LockError> {
//! let store = Arc::new(DynamoDbLockStore::connect("us-east-1", None).await);
//! let client = LockClient::new(
//!     store,
//!     "locks",
//!     "key",
//!     ClientOptions::new()
//!         .with_lease_duration(Duration::from_secs(20))
//!         .with_heartbeat_period(Duration::from_secs(5)),
//! )?;
//!
//! let lock = client
//!     .acquire_lock(
//!         "leader",
//!         AcquireOptions::new()
//!             .with_data(b"node-1".to_vec())
//!             .with_session_monitor(Duration::from_secs(6), || {
//!                 eprintln!("lease is about to expire, stepping down");
//!             }),
//!     )
//!     .await?;
//!
//! // ... lead ...
//!
//! client.release_lock(&lock).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Caveats
//! The safety of the expired-takeover protocol rests on the host clock
//! advancing roughly in step with everyone else's. Leases are wall-clock
//! bounds, not fencing tokens; pair the lock with the stored RVN if the
//! protected resource can check writes itself.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod codec;
pub mod ddb;
mod error;
mod lock;
pub mod memory;
mod store;

pub use client::{
    AcquireOptions, ClientOptions, HeartbeatOptions, LockClient, LockKey, ReleaseOptions,
    SessionMonitorConfig,
};
pub use ddb::DynamoDbLockStore;
pub use error::{LockError, LockResult, TimeoutError};
pub use lock::{Lock, SessionCallback};
pub use memory::InMemoryLockStore;
pub use store::{
    Condition, CreateTableOptions, Item, LockStore, ProvisionedThroughput, TableSchema, Update,
};

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

//! Error types for distributed lock operations.

use std::time::Duration;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// The wait budget ran out while a live contender kept refreshing the lock.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("did not acquire lock after waiting {age:?}")]
pub struct TimeoutError {
    /// Total time spent trying to acquire the lock.
    pub age: Duration,
}

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Could not obtain the lease. Retryable; the cause carries the wait age
    /// when the acquisition budget was exhausted against a live contender.
    #[error("lock not granted: {reason}")]
    LockNotGranted {
        /// Why the lock was not granted.
        reason: String,
        /// Present when the wait budget was exhausted.
        #[source]
        cause: Option<TimeoutError>,
    },

    /// Release was called on a lock owned by a different client.
    #[error("lock is owned by a different client")]
    OwnerMismatched,

    /// Release was called with an empty lock handle.
    #[error("cannot release a null lock")]
    CannotReleaseNullLock,

    /// The client was already closed.
    #[error("client already closed")]
    ClientClosed,

    /// An additional attribute collides with a reserved attribute name.
    #[error("additional attribute cannot use reserved name: {0}")]
    ReservedAttribute(String),

    /// The store rejected a conditional write.
    #[error("store rejected conditional write: {0}")]
    ConditionFailed(String),

    /// Any other store failure (network, throttling, schema, etc.).
    #[error("store error: {0}")]
    Store(String),

    /// A persisted lease duration could not be parsed.
    #[error("cannot parse lease duration {value:?}: {reason}")]
    LeaseParse {
        /// The raw attribute value found in the row.
        value: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// The lock key does not match the client's table schema.
    #[error("invalid lock key: {0}")]
    InvalidKey(String),

    /// The lock has no session monitor configured.
    #[error("session monitor is not configured for this lock")]
    SessionMonitorNotSet,

    /// Invalid client or option configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// Shorthand for a `LockNotGranted` without a timeout cause.
    pub(crate) fn not_granted(reason: impl Into<String>) -> Self {
        LockError::LockNotGranted {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Whether this error is a conditional-write rejection from the store.
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, LockError::ConditionFailed(_))
    }

    /// Whether this error means the lock could not be granted.
    pub fn is_not_granted(&self) -> bool {
        matches!(self, LockError::LockNotGranted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn not_granted_carries_timeout_cause() {
        let err = LockError::LockNotGranted {
            reason: "didn't acquire lock after sleeping".to_string(),
            cause: Some(TimeoutError {
                age: Duration::from_secs(3),
            }),
        };
        assert!(err.is_not_granted());
        let source = err.source().expect("timeout cause");
        assert!(source.to_string().contains("3s"));
    }

    #[test]
    fn condition_failure_is_distinguishable() {
        let err = LockError::ConditionFailed("put rejected".to_string());
        assert!(err.is_condition_failed());
        assert!(!err.is_not_granted());
    }
}

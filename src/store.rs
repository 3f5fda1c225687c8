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

//! Store adapter trait for conditional CRUD over lock rows.
//!
//! ## Purpose
//! Abstracts the conditional-write key-value store the lock protocol runs on.
//! The production backend is DynamoDB ([`crate::ddb::DynamoDbLockStore`]); an
//! in-memory backend ([`crate::memory::InMemoryLockStore`]) serves tests and
//! single-process scenarios.
//!
//! ## Design Decisions
//! - **Strongly consistent reads**: `get_item` must return the latest
//!   committed row; the acquisition protocol depends on it.
//! - **Condition grammar**: attribute existence, equality on named
//!   attributes, conjunction, and disjunction. This is exactly what the
//!   acquisition, heartbeat, and release protocols need, and nothing more.
//! - **Distinct condition-failure error**: a rejected conditional write is
//!   reported as [`LockError::ConditionFailed`] so callers can tell
//!   "acquisition denied" apart from infrastructure failures.

use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::HashMap;

/// A stored lock row, or a primary key: attribute name to value.
pub type Item = HashMap<String, AttributeValue>;

/// Condition evaluated by the store before applying a write.
///
/// ## Purpose
/// Expresses the compare-and-swap guards of the lock protocol: row absence
/// for initial acquisition, record-version equality for takeover and
/// refresh, and owner equality for release.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The named attribute is present on the row. On a key attribute this
    /// means "the row exists".
    AttributeExists(String),
    /// The named attribute is absent. On a key attribute this means "the row
    /// does not exist".
    AttributeNotExists(String),
    /// The named attribute equals the given value.
    Equals(String, AttributeValue),
    /// Both conditions hold.
    And(Box<Condition>, Box<Condition>),
    /// Either condition holds.
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Condition that the named attribute exists.
    pub fn exists(attribute: impl Into<String>) -> Self {
        Condition::AttributeExists(attribute.into())
    }

    /// Condition that the named attribute does not exist.
    pub fn not_exists(attribute: impl Into<String>) -> Self {
        Condition::AttributeNotExists(attribute.into())
    }

    /// Condition that the named attribute equals `value`.
    pub fn equals(attribute: impl Into<String>, value: AttributeValue) -> Self {
        Condition::Equals(attribute.into(), value)
    }

    /// Conjunction of `self` and `other`.
    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    /// Disjunction of `self` and `other`.
    pub fn or(self, other: Condition) -> Self {
        Condition::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate the condition against the current row, if any.
    ///
    /// Used by the in-memory backend; the DynamoDB backend renders the
    /// condition to a condition expression instead.
    pub fn matches(&self, row: Option<&Item>) -> bool {
        match self {
            Condition::AttributeExists(name) => {
                row.is_some_and(|item| item.contains_key(name))
            }
            Condition::AttributeNotExists(name) => {
                !row.is_some_and(|item| item.contains_key(name))
            }
            Condition::Equals(name, value) => {
                row.and_then(|item| item.get(name)) == Some(value)
            }
            Condition::And(a, b) => a.matches(row) && b.matches(row),
            Condition::Or(a, b) => a.matches(row) || b.matches(row),
        }
    }
}

/// In-place mutation of an existing row: attribute assignments and removals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    sets: Vec<(String, AttributeValue)>,
    removes: Vec<String>,
}

impl Update {
    /// Assign `value` to the named attribute.
    pub fn set(mut self, attribute: impl Into<String>, value: AttributeValue) -> Self {
        self.sets.push((attribute.into(), value));
        self
    }

    /// Remove the named attribute from the row.
    pub fn remove(mut self, attribute: impl Into<String>) -> Self {
        self.removes.push(attribute.into());
        self
    }

    /// Attribute assignments, in insertion order.
    pub fn sets(&self) -> &[(String, AttributeValue)] {
        &self.sets
    }

    /// Attribute removals, in insertion order.
    pub fn removes(&self) -> &[String] {
        &self.removes
    }

    /// Apply the mutation to a row in place (in-memory backend).
    pub fn apply(&self, row: &mut Item) {
        for (name, value) in &self.sets {
            row.insert(name.clone(), value.clone());
        }
        for name in &self.removes {
            row.remove(name);
        }
    }
}

/// Primary-key layout of a lock table. Both attributes are string-typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Hash key attribute name.
    pub partition_key_name: String,
    /// Range key attribute name, when the table uses a composite key.
    pub sort_key_name: Option<String>,
}

/// Provisioned read/write capacity; switches the table off pay-per-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionedThroughput {
    /// Read capacity units.
    pub read_capacity_units: i64,
    /// Write capacity units.
    pub write_capacity_units: i64,
}

/// Options for [`LockStore::create_table`].
///
/// The default billing mode is pay-per-request; supplying
/// `provisioned_throughput` switches the table to provisioned mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateTableOptions {
    /// Optional provisioned capacity (pay-per-request when absent).
    pub provisioned_throughput: Option<ProvisionedThroughput>,
    /// Tags applied to the table at creation.
    pub tags: Vec<(String, String)>,
}

impl CreateTableOptions {
    /// Switch the table to provisioned billing with the given capacity.
    pub fn with_provisioned_throughput(mut self, read_capacity_units: i64, write_capacity_units: i64) -> Self {
        self.provisioned_throughput = Some(ProvisionedThroughput {
            read_capacity_units,
            write_capacity_units,
        });
        self
    }

    /// Add a tag to the table.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// Conditional CRUD over lock rows.
///
/// ## Behavior
/// - All writes are conditional; a failed condition surfaces as
///   [`LockError::ConditionFailed`], never as a generic store error.
/// - Reads are strongly consistent.
/// - The store provides linearizable reads and writes per key; the lock
///   protocol requires no multi-key atomicity.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Strongly consistent point read. Returns `None` when the row is absent.
    async fn get_item(&self, table: &str, key: &Item) -> LockResult<Option<Item>>;

    /// Write a full row if `condition` holds against the current row.
    async fn put_item(&self, table: &str, item: Item, condition: Condition) -> LockResult<()>;

    /// Mutate an existing row if `condition` holds against it.
    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: Update,
        condition: Condition,
    ) -> LockResult<()>;

    /// Delete a row if `condition` holds against it.
    async fn delete_item(&self, table: &str, key: Item, condition: Condition) -> LockResult<()>;

    /// Create a lock table with the given primary-key schema.
    ///
    /// Fails if the table already exists; lock tables are expected to be
    /// provisioned ahead of time.
    async fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
        options: &CreateTableOptions,
    ) -> LockResult<()>;
}

/// Map a condition rejection into the dedicated error kind.
pub(crate) fn condition_failed(operation: &str) -> LockError {
    LockError::ConditionFailed(format!("conditional {operation} rejected by store"))
}

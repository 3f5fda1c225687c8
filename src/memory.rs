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

//! In-memory store implementation (for testing and single-process use).

use crate::error::{LockError, LockResult};
use crate::store::{
    condition_failed, Condition, CreateTableOptions, Item, LockStore, TableSchema, Update,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory [`LockStore`] backend.
///
/// ## Purpose
/// Provides the conditional-write semantics of the real store for tests and
/// single-process scenarios. A single mutex over all tables makes every
/// operation linearizable, which is stronger than the per-key guarantee the
/// lock protocol needs.
///
/// ## Limitations
/// - Not persistent (rows lost on drop)
/// - Not distributed (single process only)
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    tables: Arc<Mutex<HashMap<String, Table>>>,
}

struct Table {
    schema: TableSchema,
    rows: HashMap<String, Item>,
}

impl InMemoryLockStore {
    /// Create an empty store. Tables are added via
    /// [`LockStore::create_table`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// A copy of the raw row stored under the given key, if any.
    pub async fn raw_row(&self, table: &str, key: &Item) -> Option<Item> {
        let tables = self.tables.lock().await;
        let table = tables.get(table)?;
        table.rows.get(&canonical_key(key)).cloned()
    }
}

/// Canonical string form of a key item: sorted attribute names joined with
/// their string values. Key attributes are string-typed by schema.
fn canonical_key(key: &Item) -> String {
    let mut parts: Vec<(String, String)> = key
        .iter()
        .map(|(name, value)| {
            let text = match value {
                AttributeValue::S(s) => s.clone(),
                other => format!("{other:?}"),
            };
            (name.clone(), text)
        })
        .collect();
    parts.sort();
    parts
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Extract the key attributes of a full row according to the table schema.
fn key_of_row(schema: &TableSchema, row: &Item) -> LockResult<Item> {
    let mut key = Item::new();
    let pk = row
        .get(&schema.partition_key_name)
        .cloned()
        .ok_or_else(|| {
            LockError::Store(format!(
                "item is missing key attribute {:?}",
                schema.partition_key_name
            ))
        })?;
    key.insert(schema.partition_key_name.clone(), pk);
    if let Some(sk_name) = &schema.sort_key_name {
        let sk = row.get(sk_name).cloned().ok_or_else(|| {
            LockError::Store(format!("item is missing key attribute {sk_name:?}"))
        })?;
        key.insert(sk_name.clone(), sk);
    }
    Ok(key)
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn get_item(&self, table: &str, key: &Item) -> LockResult<Option<Item>> {
        let tables = self.tables.lock().await;
        let table = tables
            .get(table)
            .ok_or_else(|| LockError::Store(format!("table not found: {table}")))?;
        Ok(table.rows.get(&canonical_key(key)).cloned())
    }

    async fn put_item(&self, table: &str, item: Item, condition: Condition) -> LockResult<()> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(table)
            .ok_or_else(|| LockError::Store(format!("table not found: {table}")))?;
        let key = canonical_key(&key_of_row(&table.schema, &item)?);
        if !condition.matches(table.rows.get(&key)) {
            return Err(condition_failed("put"));
        }
        table.rows.insert(key, item);
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: Update,
        condition: Condition,
    ) -> LockResult<()> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(table)
            .ok_or_else(|| LockError::Store(format!("table not found: {table}")))?;
        let key = canonical_key(&key);
        if !condition.matches(table.rows.get(&key)) {
            return Err(condition_failed("update"));
        }
        if let Some(row) = table.rows.get_mut(&key) {
            update.apply(row);
        } else {
            // The real store upserts; protocol conditions always require an
            // existing row, so this path only serves odd callers.
            let mut row = Item::new();
            update.apply(&mut row);
            table.rows.insert(key, row);
        }
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: Item, condition: Condition) -> LockResult<()> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .get_mut(table)
            .ok_or_else(|| LockError::Store(format!("table not found: {table}")))?;
        let key = canonical_key(&key);
        if !condition.matches(table.rows.get(&key)) {
            return Err(condition_failed("delete"));
        }
        table.rows.remove(&key);
        Ok(())
    }

    async fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
        _options: &CreateTableOptions,
    ) -> LockResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(table) {
            return Err(LockError::Store(format!("table already exists: {table}")));
        }
        tables.insert(
            table.to_string(),
            Table {
                schema: schema.clone(),
                rows: HashMap::new(),
            },
        );
        Ok(())
    }
}

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

//! DynamoDB implementation of the store adapter.
//!
//! ## Purpose
//! Runs the conditional CRUD of the lock protocol against a DynamoDB table.
//! Conditions and updates are rendered to expression strings with `#n`/`:v`
//! placeholder maps, and `ConditionalCheckFailedException` is mapped to the
//! dedicated condition-failure error so the lock layers can tell an expected
//! CAS loss apart from an outage.
//!
//! ## Observability
//! - Histogram `dynalease_store_op_duration_seconds` per operation
//! - Counters `dynalease_store_condition_failures_total` and
//!   `dynalease_store_errors_total`

use crate::error::{LockError, LockResult};
use crate::store::{
    condition_failed, Condition, CreateTableOptions, Item, LockStore, TableSchema, Update,
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ProvisionedThroughput, ScalarAttributeType, Tag,
};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// DynamoDB-backed [`LockStore`].
///
/// ## Example
/// ```rust,no_run
/// use dynalease::DynamoDbLockStore;
///
/// # async fn example() {
/// // For DynamoDB Local testing pass an endpoint URL.
/// let store = DynamoDbLockStore::connect(
///     "us-east-1",
///     Some("http://localhost:8000".to_string()),
/// )
/// .await;
/// # }
/// ```
#[derive(Clone)]
pub struct DynamoDbLockStore {
    client: DynamoDbClient,
}

impl DynamoDbLockStore {
    /// Wrap an already-configured DynamoDB client.
    pub fn new(client: DynamoDbClient) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS configuration chain.
    ///
    /// Credentials come from the environment; `endpoint_url` overrides the
    /// endpoint for DynamoDB Local testing.
    pub async fn connect(region: impl Into<String>, endpoint_url: Option<String>) -> Self {
        let mut config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.into()));
        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }
        let config = config_builder.load().await;
        Self {
            client: DynamoDbClient::new(&config),
        }
    }

    /// The underlying SDK client.
    pub fn client(&self) -> &DynamoDbClient {
        &self.client
    }
}

/// Accumulates `#n`/`:v` placeholders shared by the update and condition
/// expressions of a single request.
#[derive(Default)]
struct ExpressionBuilder {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl ExpressionBuilder {
    fn name(&mut self, attribute: &str) -> String {
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attribute.to_string());
        placeholder
    }

    fn value(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    fn condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::AttributeExists(attribute) => {
                format!("attribute_exists({})", self.name(attribute))
            }
            Condition::AttributeNotExists(attribute) => {
                format!("attribute_not_exists({})", self.name(attribute))
            }
            Condition::Equals(attribute, value) => {
                let name = self.name(attribute);
                let value = self.value(value.clone());
                format!("{name} = {value}")
            }
            Condition::And(a, b) => {
                let left = self.condition(a);
                let right = self.condition(b);
                format!("({left}) AND ({right})")
            }
            Condition::Or(a, b) => {
                let left = self.condition(a);
                let right = self.condition(b);
                format!("({left}) OR ({right})")
            }
        }
    }

    fn update(&mut self, update: &Update) -> String {
        let mut expression = String::new();
        if !update.sets().is_empty() {
            let assignments: Vec<String> = update
                .sets()
                .iter()
                .map(|(attribute, value)| {
                    let name = self.name(attribute);
                    let value = self.value(value.clone());
                    format!("{name} = {value}")
                })
                .collect();
            expression.push_str("SET ");
            expression.push_str(&assignments.join(", "));
        }
        if !update.removes().is_empty() {
            let removals: Vec<String> = update
                .removes()
                .iter()
                .map(|attribute| self.name(attribute))
                .collect();
            if !expression.is_empty() {
                expression.push(' ');
            }
            expression.push_str("REMOVE ");
            expression.push_str(&removals.join(", "));
        }
        expression
    }

    fn into_maps(
        self,
    ) -> (
        Option<HashMap<String, String>>,
        Option<HashMap<String, AttributeValue>>,
    ) {
        let names = (!self.names.is_empty()).then_some(self.names);
        let values = (!self.values.is_empty()).then_some(self.values);
        (names, values)
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::histogram!("dynalease_store_op_duration_seconds", "op" => operation)
        .record(started.elapsed().as_secs_f64());
}

fn record_condition_failure(operation: &'static str) {
    metrics::counter!("dynalease_store_condition_failures_total", "op" => operation).increment(1);
}

fn store_error(operation: &'static str, err: impl std::fmt::Display) -> LockError {
    metrics::counter!("dynalease_store_errors_total", "op" => operation).increment(1);
    LockError::Store(format!("dynamodb {operation} failed: {err}"))
}

#[async_trait]
impl LockStore for DynamoDbLockStore {
    async fn get_item(&self, table: &str, key: &Item) -> LockResult<Option<Item>> {
        let started = Instant::now();
        let result = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key.clone()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| store_error("get_item", DisplayErrorContext(&e)))?;
        record_duration("get_item", started);
        Ok(result.item)
    }

    async fn put_item(&self, table: &str, item: Item, condition: Condition) -> LockResult<()> {
        let started = Instant::now();
        let mut builder = ExpressionBuilder::default();
        let expression = builder.condition(&condition);
        let (names, values) = builder.into_maps();

        let result = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(item))
            .condition_expression(expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .send()
            .await;
        record_duration("put_item", started);

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|svc| svc.is_conditional_check_failed_exception()) =>
            {
                record_condition_failure("put_item");
                debug!(table, "conditional put rejected");
                Err(condition_failed("put"))
            }
            Err(e) => Err(store_error("put_item", DisplayErrorContext(&e))),
        }
    }

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: Update,
        condition: Condition,
    ) -> LockResult<()> {
        let started = Instant::now();
        let mut builder = ExpressionBuilder::default();
        let update_expression = builder.update(&update);
        let condition_expression = builder.condition(&condition);
        let (names, values) = builder.into_maps();

        let result = self
            .client
            .update_item()
            .table_name(table)
            .set_key(Some(key))
            .update_expression(update_expression)
            .condition_expression(condition_expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .send()
            .await;
        record_duration("update_item", started);

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|svc| svc.is_conditional_check_failed_exception()) =>
            {
                record_condition_failure("update_item");
                debug!(table, "conditional update rejected");
                Err(condition_failed("update"))
            }
            Err(e) => Err(store_error("update_item", DisplayErrorContext(&e))),
        }
    }

    async fn delete_item(&self, table: &str, key: Item, condition: Condition) -> LockResult<()> {
        let started = Instant::now();
        let mut builder = ExpressionBuilder::default();
        let expression = builder.condition(&condition);
        let (names, values) = builder.into_maps();

        let result = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(key))
            .condition_expression(expression)
            .set_expression_attribute_names(names)
            .set_expression_attribute_values(values)
            .send()
            .await;
        record_duration("delete_item", started);

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|svc| svc.is_conditional_check_failed_exception()) =>
            {
                record_condition_failure("delete_item");
                debug!(table, "conditional delete rejected");
                Err(condition_failed("delete"))
            }
            Err(e) => Err(store_error("delete_item", DisplayErrorContext(&e))),
        }
    }

    async fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
        options: &CreateTableOptions,
    ) -> LockResult<()> {
        let started = Instant::now();
        let mut key_schema = vec![KeySchemaElement::builder()
            .attribute_name(&schema.partition_key_name)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| store_error("create_table", e))?];
        let mut attribute_definitions = vec![AttributeDefinition::builder()
            .attribute_name(&schema.partition_key_name)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| store_error("create_table", e))?];

        if let Some(sort_key_name) = &schema.sort_key_name {
            key_schema.push(
                KeySchemaElement::builder()
                    .attribute_name(sort_key_name)
                    .key_type(KeyType::Range)
                    .build()
                    .map_err(|e| store_error("create_table", e))?,
            );
            attribute_definitions.push(
                AttributeDefinition::builder()
                    .attribute_name(sort_key_name)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(|e| store_error("create_table", e))?,
            );
        }

        let mut request = self
            .client
            .create_table()
            .table_name(table)
            .set_key_schema(Some(key_schema))
            .set_attribute_definitions(Some(attribute_definitions));

        request = match options.provisioned_throughput {
            Some(capacity) => request.billing_mode(BillingMode::Provisioned).provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(capacity.read_capacity_units)
                    .write_capacity_units(capacity.write_capacity_units)
                    .build()
                    .map_err(|e| store_error("create_table", e))?,
            ),
            None => request.billing_mode(BillingMode::PayPerRequest),
        };

        for (key, value) in &options.tags {
            request = request.tags(
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(|e| store_error("create_table", e))?,
            );
        }

        request
            .send()
            .await
            .map_err(|e| store_error("create_table", DisplayErrorContext(&e)))?;
        record_duration("create_table", started);
        debug!(table, "lock table created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.to_string())
    }

    #[test]
    fn conditions_render_with_placeholder_maps() {
        let condition = Condition::not_exists("key").or(Condition::exists("key")
            .and(Condition::equals("isReleased", s("1"))));
        let mut builder = ExpressionBuilder::default();
        let expression = builder.condition(&condition);
        assert_eq!(
            expression,
            "(attribute_not_exists(#n0)) OR ((attribute_exists(#n1)) AND (#n2 = :v0))"
        );
        let (names, values) = builder.into_maps();
        let names = names.unwrap();
        assert_eq!(names.get("#n0"), Some(&"key".to_string()));
        assert_eq!(names.get("#n2"), Some(&"isReleased".to_string()));
        assert_eq!(values.unwrap().get(":v0"), Some(&s("1")));
    }

    #[test]
    fn updates_render_set_and_remove_clauses() {
        let update = Update::default()
            .set("recordVersionNumber", s("r2"))
            .set("leaseDuration", s("20s"))
            .remove("data");
        let mut builder = ExpressionBuilder::default();
        let expression = builder.update(&update);
        assert_eq!(expression, "SET #n0 = :v0, #n1 = :v1 REMOVE #n2");
    }

    #[test]
    fn update_and_condition_share_placeholder_namespaces() {
        let mut builder = ExpressionBuilder::default();
        let update_expr = builder.update(&Update::default().set("isReleased", s("1")));
        let condition_expr =
            builder.condition(&Condition::equals("recordVersionNumber", s("r1")));
        assert_eq!(update_expr, "SET #n0 = :v0");
        assert_eq!(condition_expr, "#n1 = :v1");
        let (names, values) = builder.into_maps();
        assert_eq!(names.unwrap().len(), 2);
        assert_eq!(values.unwrap().len(), 2);
    }
}

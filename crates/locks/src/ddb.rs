// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of RowLease.
//
// RowLease is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// RowLease is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with RowLease. If not, see <https://www.gnu.org/licenses/>.

//! DynamoDB lock store.
//!
//! ## Design
//! - **One table per namespace**: the namespace passed by the manager is the
//!   DynamoDB table name
//! - **Conditional writes**: acquire/renew/takeover is one `UpdateItem` with a
//!   condition expression; release is one conditional `DeleteItem`
//! - **No DynamoDB TTL**: the `ttl` attribute holds epoch *milliseconds*, which
//!   DynamoDB's expiry sweeper would misread as seconds far in the future
//!
//! ## Table Schema
//! ```text
//! Partition Key: lkey (String)
//! Attributes:
//!   - createdByUUID: String (owner id)
//!   - lockVersionNum: Number (fence, +1 per write)
//!   - lockExpireSecs: Number (lease duration)
//!   - ttl: Number (lease expiry, UNIX epoch milliseconds)
//!   - createdAt: String (RFC 3339, first acquisition)
//!   - createdByHost / createdByUser: String (diagnostics)
//! ```

use crate::store::{LockStore, UpdateCondition, WriteOutcome};
use crate::{coerce_datetime, datetime_from_millis, format_created_at, LockError, LockRecord, LockResult};
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::ProvideErrorMetadata,
    types::{AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType, ReturnValue, ScalarAttributeType},
    Client as DynamoDbClient,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

const ATTR_KEY: &str = "lkey";
const ATTR_OWNER: &str = "createdByUUID";
const ATTR_VERSION: &str = "lockVersionNum";
const ATTR_LEASE_SECS: &str = "lockExpireSecs";
const ATTR_TTL: &str = "ttl";
const ATTR_CREATED_AT: &str = "createdAt";
const ATTR_HOST: &str = "createdByHost";
const ATTR_USER: &str = "createdByUser";

const TAKEOVER_CONDITION: &str = "attribute_not_exists(createdByUUID) OR \
     (createdByUUID = :existingUUID AND lockVersionNum = :existingVersionNum AND \
     (:blockingLockExpired = :true OR createdByUUID = :newUUID))";
const ABSENT_CONDITION: &str = "attribute_not_exists(createdByUUID)";
const DELETE_CONDITION: &str = "createdByUUID = :owner";

/// DynamoDB lock store.
///
/// ## Example
/// ```rust,no_run
/// use rowlease_locks::{ddb::DynamoDbLockStore, LockManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = DynamoDbLockStore::new(
///     "us-east-1".to_string(),
///     Some("http://localhost:8000".to_string()), // For local testing
/// )
/// .await?;
/// store.ensure_table("Lock-dev").await?;
///
/// let manager = LockManager::builder().store(store).table_name("Lock-dev").build()?;
/// let outcome = manager.set_lock("job-42").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DynamoDbLockStore {
    client: DynamoDbClient,
}

impl DynamoDbLockStore {
    /// Create a store from region and optional endpoint.
    ///
    /// Credentials come from the default AWS provider chain (env, profile,
    /// instance role). `endpoint_url` points at DynamoDB Local for testing.
    #[instrument(skip(region, endpoint_url), fields(region = %region))]
    pub async fn new(region: String, endpoint_url: Option<String>) -> LockResult<Self> {
        let start_time = Instant::now();

        let mut config_builder =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).region(aws_config::Region::new(region.clone()));
        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }
        let config = config_builder.load().await;
        let client = DynamoDbClient::new(&config);

        let duration = start_time.elapsed();
        metrics::histogram!("rowlease_locks_ddb_init_duration_seconds", "backend" => "dynamodb")
            .record(duration.as_secs_f64());
        debug!(region = %region, duration_ms = duration.as_millis(), "DynamoDB lock store initialized");

        Ok(Self { client })
    }

    /// Wrap an already configured client.
    pub fn from_client(client: DynamoDbClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &DynamoDbClient {
        &self.client
    }

    /// Create the lock table if it doesn't exist and wait until it is active.
    #[instrument(skip(self), fields(table_name = %table_name))]
    pub async fn ensure_table(&self, table_name: &str) -> LockResult<()> {
        match self.client.describe_table().table_name(table_name).send().await {
            Ok(_) => {
                debug!(table_name = %table_name, "DynamoDB table already exists");
                return Ok(());
            }
            Err(e) => {
                let error_msg = format!("{}", e);
                let error_code = e.code().unwrap_or("unknown");
                let error_message = e.message().unwrap_or(&error_msg);
                if !error_msg.contains("ResourceNotFoundException") && error_code != "ResourceNotFoundException" {
                    error!(
                        table_name = %table_name,
                        error_code = %error_code,
                        error_message = %error_message,
                        "DynamoDB describe_table failed with unexpected error"
                    );
                    return Err(LockError::BackendError(format!(
                        "Failed to check table existence: {} (code: {})",
                        error_message, error_code
                    )));
                }
            }
        }

        debug!(table_name = %table_name, "Creating DynamoDB table");

        let key_schema = KeySchemaElement::builder()
            .attribute_name(ATTR_KEY)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| LockError::BackendError(format!("Failed to build key schema: {}", e)))?;
        let key_attr = AttributeDefinition::builder()
            .attribute_name(ATTR_KEY)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| LockError::BackendError(format!("Failed to build attribute definition: {}", e)))?;

        let create_table_result = self
            .client
            .create_table()
            .table_name(table_name)
            .billing_mode(BillingMode::PayPerRequest)
            .key_schema(key_schema)
            .attribute_definitions(key_attr)
            .send()
            .await;

        match create_table_result {
            Ok(_) => {
                debug!(table_name = %table_name, "DynamoDB table created successfully");
                self.wait_for_table_active(table_name).await
            }
            Err(e) => {
                if e.to_string().contains("ResourceInUseException") || e.code() == Some("ResourceInUseException") {
                    debug!(table_name = %table_name, "Table created concurrently, waiting for active");
                    self.wait_for_table_active(table_name).await
                } else {
                    Err(LockError::BackendError(format!("Failed to create DynamoDB table: {}", e)))
                }
            }
        }
    }

    async fn wait_for_table_active(&self, table_name: &str) -> LockResult<()> {
        use aws_sdk_dynamodb::types::TableStatus;

        let max_attempts = 30;
        for _ in 0..max_attempts {
            let describe_result = self
                .client
                .describe_table()
                .table_name(table_name)
                .send()
                .await
                .map_err(aws_sdk_dynamodb::Error::from)?;

            match describe_result.table().and_then(|t| t.table_status()) {
                Some(TableStatus::Active) => {
                    debug!(table_name = %table_name, "Table is now active");
                    return Ok(());
                }
                Some(TableStatus::Creating) => tokio::time::sleep(Duration::from_secs(1)).await,
                Some(status) => {
                    return Err(LockError::BackendError(format!("Table in unexpected status: {:?}", status)));
                }
                None => return Err(LockError::BackendError("Table status not available".to_string())),
            }
        }
        Err(LockError::BackendError(format!(
            "Table creation timeout after {} attempts",
            max_attempts
        )))
    }

    fn record_to_item(record: &LockRecord) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::new();
        item.insert(ATTR_KEY.to_string(), AttributeValue::S(record.key.clone()));
        item.insert(ATTR_OWNER.to_string(), AttributeValue::S(record.owner_id.clone()));
        item.insert(ATTR_VERSION.to_string(), AttributeValue::N(record.version.to_string()));
        item.insert(ATTR_LEASE_SECS.to_string(), AttributeValue::N(record.lease_duration_secs.to_string()));
        item.insert(ATTR_TTL.to_string(), AttributeValue::N(record.ttl_millis().to_string()));
        item.insert(ATTR_HOST.to_string(), AttributeValue::S(record.created_by_host.clone()));
        item.insert(ATTR_USER.to_string(), AttributeValue::S(record.created_by_user.clone()));
        if let Some(created_at) = record.created_at {
            item.insert(ATTR_CREATED_AT.to_string(), AttributeValue::S(format_created_at(created_at)));
        }
        item
    }

    fn item_to_record(item: &HashMap<String, AttributeValue>) -> LockResult<LockRecord> {
        let key = string_attr(item, ATTR_KEY)
            .ok_or_else(|| LockError::DeserializationError("lock item has no lkey".to_string()))?;
        let ttl_millis: i64 = number_attr(item, ATTR_TTL)?
            .ok_or_else(|| LockError::DeserializationError(format!("lock item \"{}\" has no ttl", key)))?;
        let ttl = datetime_from_millis(ttl_millis)
            .ok_or_else(|| LockError::DeserializationError(format!("invalid ttl {} on \"{}\"", ttl_millis, key)))?;

        // Older writers stored createdAt as a number; accept both.
        let created_at = match item.get(ATTR_CREATED_AT) {
            Some(AttributeValue::S(raw)) => coerce_datetime(raw),
            Some(AttributeValue::N(raw)) => raw.parse::<i64>().ok().and_then(datetime_from_millis),
            _ => None,
        };

        Ok(LockRecord {
            owner_id: string_attr(item, ATTR_OWNER).unwrap_or_default(),
            version: number_attr(item, ATTR_VERSION)?.unwrap_or(0),
            lease_duration_secs: number_attr(item, ATTR_LEASE_SECS)?.unwrap_or(0),
            created_by_host: string_attr(item, ATTR_HOST).unwrap_or_default(),
            created_by_user: string_attr(item, ATTR_USER).unwrap_or_default(),
            created_at,
            ttl,
            key,
        })
    }
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|v| v.as_s().ok()).cloned()
}

fn number_attr<T: std::str::FromStr>(item: &HashMap<String, AttributeValue>, name: &str) -> LockResult<Option<T>> {
    match item.get(name).and_then(|v| v.as_n().ok()) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| LockError::DeserializationError(format!("attribute {} is not a valid number: {}", name, raw))),
        None => Ok(None),
    }
}

fn is_conditional_check_failed<E: ProvideErrorMetadata + std::fmt::Display>(e: &E) -> bool {
    e.code() == Some("ConditionalCheckFailedException") || e.to_string().contains("ConditionalCheckFailedException")
}

#[async_trait]
impl LockStore for DynamoDbLockStore {
    #[instrument(skip(self), fields(table_name = %namespace, lock_key = %key))]
    async fn get(&self, namespace: &str, key: &str) -> LockResult<Option<LockRecord>> {
        let result = self
            .client
            .get_item()
            .table_name(namespace)
            .key(ATTR_KEY, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, lock_key = %key, "Failed to get lock from DynamoDB");
                aws_sdk_dynamodb::Error::from(e)
            })?;

        result.item().map(Self::item_to_record).transpose()
    }

    #[instrument(skip(self, record), fields(table_name = %namespace, lock_key = %record.key))]
    async fn put(&self, namespace: &str, record: &LockRecord) -> LockResult<()> {
        self.client
            .put_item()
            .table_name(namespace)
            .set_item(Some(Self::record_to_item(record)))
            .send()
            .await
            .map_err(aws_sdk_dynamodb::Error::from)?;
        Ok(())
    }

    #[instrument(
        skip(self, new_values, condition),
        fields(table_name = %namespace, lock_key = %new_values.key, version = new_values.version)
    )]
    async fn conditional_update(
        &self,
        namespace: &str,
        new_values: &LockRecord,
        condition: &UpdateCondition,
    ) -> LockResult<WriteOutcome<LockRecord>> {
        let start_time = Instant::now();

        let mut sets = vec![
            "createdByUUID = :newUUID",
            "lockVersionNum = :newVersionNum",
            "lockExpireSecs = :lockExpireSecs",
            "createdByHost = :createdByHost",
            "createdByUser = :createdByUser",
            "#ttl = :ttl",
        ];
        let mut request = self
            .client
            .update_item()
            .table_name(namespace)
            .key(ATTR_KEY, AttributeValue::S(new_values.key.clone()))
            .expression_attribute_names("#ttl", ATTR_TTL)
            .expression_attribute_values(":newUUID", AttributeValue::S(new_values.owner_id.clone()))
            .expression_attribute_values(":newVersionNum", AttributeValue::N(new_values.version.to_string()))
            .expression_attribute_values(
                ":lockExpireSecs",
                AttributeValue::N(new_values.lease_duration_secs.to_string()),
            )
            .expression_attribute_values(":createdByHost", AttributeValue::S(new_values.created_by_host.clone()))
            .expression_attribute_values(":createdByUser", AttributeValue::S(new_values.created_by_user.clone()))
            .expression_attribute_values(":ttl", AttributeValue::N(new_values.ttl_millis().to_string()))
            .return_values(ReturnValue::AllNew);

        if let Some(created_at) = new_values.created_at {
            sets.push("createdAt = :createdAt");
            request = request.expression_attribute_values(":createdAt", AttributeValue::S(format_created_at(created_at)));
        }

        request = match (&condition.expected_owner, condition.expected_version) {
            (Some(expected_owner), Some(expected_version)) => request
                .condition_expression(TAKEOVER_CONDITION)
                .expression_attribute_values(":existingUUID", AttributeValue::S(expected_owner.clone()))
                .expression_attribute_values(":existingVersionNum", AttributeValue::N(expected_version.to_string()))
                .expression_attribute_values(":blockingLockExpired", AttributeValue::Bool(condition.blocking_expired))
                .expression_attribute_values(":true", AttributeValue::Bool(true)),
            // `:newUUID` is already bound by the SET clause.
            _ => request.condition_expression(ABSENT_CONDITION),
        };

        let result = request.update_expression(format!("SET {}", sets.join(", "))).send().await;
        let duration = start_time.elapsed();
        metrics::histogram!("rowlease_locks_ddb_update_duration_seconds", "backend" => "dynamodb")
            .record(duration.as_secs_f64());

        match result {
            Ok(output) => {
                let row = match output.attributes() {
                    Some(attributes) => Self::item_to_record(attributes)?,
                    None => new_values.clone(),
                };
                debug!(duration_ms = duration.as_millis(), "Lock item written");
                Ok(WriteOutcome::Applied(row))
            }
            Err(e) if is_conditional_check_failed(&e) => {
                metrics::counter!(
                    "rowlease_locks_ddb_update_errors_total",
                    "backend" => "dynamodb",
                    "error_type" => "conditional_check_failed"
                )
                .increment(1);
                Ok(WriteOutcome::ConditionFailed)
            }
            Err(e) => {
                error!(error = %e, lock_key = %new_values.key, "Failed to update lock in DynamoDB");
                metrics::counter!(
                    "rowlease_locks_ddb_update_errors_total",
                    "backend" => "dynamodb",
                    "error_type" => "update_item_failed"
                )
                .increment(1);
                Err(LockError::BackendError(format!("DynamoDB update_item failed: {}", e)))
            }
        }
    }

    #[instrument(skip(self), fields(table_name = %namespace, lock_key = %key))]
    async fn conditional_delete(
        &self,
        namespace: &str,
        key: &str,
        expected_owner: &str,
    ) -> LockResult<WriteOutcome<Option<LockRecord>>> {
        let result = self
            .client
            .delete_item()
            .table_name(namespace)
            .key(ATTR_KEY, AttributeValue::S(key.to_string()))
            .condition_expression(DELETE_CONDITION)
            .expression_attribute_values(":owner", AttributeValue::S(expected_owner.to_string()))
            .return_values(ReturnValue::AllOld)
            .send()
            .await;

        match result {
            Ok(output) => {
                let row = output.attributes().map(Self::item_to_record).transpose()?;
                Ok(WriteOutcome::Applied(row))
            }
            Err(e) if is_conditional_check_failed(&e) => {
                warn!(lock_key = %key, "Lock item not owned by this owner, not deleted");
                Ok(WriteOutcome::ConditionFailed)
            }
            Err(e) => {
                error!(error = %e, lock_key = %key, "Failed to delete lock from DynamoDB");
                Err(LockError::BackendError(format!("DynamoDB delete_item failed: {}", e)))
            }
        }
    }
}

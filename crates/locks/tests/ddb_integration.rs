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

//! DynamoDB lock store integration tests.
//!
//! ## Purpose
//! Runs the lock protocol against DynamoDB Local (or a real table when AWS
//! credentials and `DYNAMODB_ENDPOINT_URL` point elsewhere). Every test skips
//! itself when no endpoint is reachable.
//!
//! ## Test Coverage
//! - Table bootstrap (idempotent `ensure_table`)
//! - Conditional update for fresh, renewal and takeover writes
//! - Owner-checked conditional delete
//! - Lock manager end to end, including contention between two managers

#[cfg(feature = "ddb-backend")]
mod tests {
    use chrono::{DateTime, Utc};
    use rowlease_common::test_helpers::{dynamodb_local_available, setup_aws_local_env};
    use rowlease_common::DynamoDBConfig;
    use rowlease_locks::{
        datetime_from_millis, ddb::DynamoDbLockStore, LockManager, LockRecord, LockStore, UpdateCondition,
        WriteOutcome,
    };
    use tokio::time::{sleep, Duration};
    use ulid::Ulid;

    /// Generate a unique lock key for testing
    fn unique_lock_key(prefix: &str) -> String {
        format!("{}-{}", prefix, Ulid::new())
    }

    /// Create the store and its table, or `None` when DynamoDB is unreachable.
    async fn create_store() -> Option<(DynamoDbLockStore, String)> {
        setup_aws_local_env();
        if !dynamodb_local_available().await {
            eprintln!("DynamoDB endpoint not reachable, skipping");
            return None;
        }

        let config = DynamoDBConfig::from_env();
        let table_name = config.table_name("locks-test");
        let store = DynamoDbLockStore::new(config.region.clone(), config.endpoint_url.clone())
            .await
            .expect("Failed to create DynamoDB lock store");
        store.ensure_table(&table_name).await.expect("Failed to create lock table");
        Some((store, table_name))
    }

    fn now_millis() -> DateTime<Utc> {
        datetime_from_millis(Utc::now().timestamp_millis()).unwrap()
    }

    fn record(key: &str, owner: &str, version: u64, ttl: DateTime<Utc>) -> LockRecord {
        LockRecord {
            key: key.to_string(),
            owner_id: owner.to_string(),
            version,
            lease_duration_secs: 10,
            created_by_host: "host".to_string(),
            created_by_user: "user".to_string(),
            created_at: Some(now_millis()),
            ttl,
        }
    }

    #[tokio::test]
    async fn test_ddb_ensure_table_is_idempotent() {
        let Some((store, table_name)) = create_store().await else { return };
        store.ensure_table(&table_name).await.unwrap();
    }

    #[tokio::test]
    async fn test_ddb_fresh_write_only_on_absent_row() {
        let Some((store, table)) = create_store().await else { return };
        let key = unique_lock_key("fresh");
        let ttl = now_millis() + chrono::Duration::seconds(10);

        let first = record(&key, "me", 1, ttl);
        let outcome = store
            .conditional_update(&table, &first, &UpdateCondition::absent("me"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(first.clone()));

        let outcome = store
            .conditional_update(&table, &record(&key, "other", 1, ttl), &UpdateCondition::absent("other"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);
        assert_eq!(store.get(&table, &key).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_ddb_renewal_and_takeover_conditions() {
        let Some((store, table)) = create_store().await else { return };
        let key = unique_lock_key("fence");
        let theirs = record(&key, "other", 3, now_millis() - chrono::Duration::seconds(1));
        store.put(&table, &theirs).await.unwrap();

        let mine = record(&key, "me", 4, now_millis() + chrono::Duration::seconds(10));
        let live = UpdateCondition::from_baseline(&theirs, false, "me");
        assert_eq!(
            store.conditional_update(&table, &mine, &live).await.unwrap(),
            WriteOutcome::ConditionFailed
        );

        let expired = UpdateCondition::from_baseline(&theirs, true, "me");
        assert_eq!(
            store.conditional_update(&table, &mine, &expired).await.unwrap(),
            WriteOutcome::Applied(mine.clone())
        );

        // Renewal on our own row.
        let renewed = record(&key, "me", 5, now_millis() + chrono::Duration::seconds(20));
        let renewal = UpdateCondition::from_baseline(&mine, false, "me");
        assert!(store.conditional_update(&table, &renewed, &renewal).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_ddb_delete_checks_owner() {
        let Some((store, table)) = create_store().await else { return };
        let key = unique_lock_key("delete");
        let row = record(&key, "me", 1, now_millis() + chrono::Duration::seconds(10));
        store.put(&table, &row).await.unwrap();

        assert_eq!(
            store.conditional_delete(&table, &key, "other").await.unwrap(),
            WriteOutcome::ConditionFailed
        );
        assert_eq!(
            store.conditional_delete(&table, &key, "me").await.unwrap(),
            WriteOutcome::Applied(Some(row))
        );
        assert!(store.get(&table, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ddb_manager_end_to_end() {
        let Some((store, table)) = create_store().await else { return };
        let key = unique_lock_key("job");
        let a = LockManager::builder()
            .store(store.clone())
            .table_name(&table)
            .lease_duration_secs(2)
            .release_grace(Duration::from_millis(100))
            .build()
            .unwrap();
        let b = LockManager::builder()
            .store(store.clone())
            .table_name(&table)
            .lease_duration_secs(2)
            .build()
            .unwrap();

        let first = a.set_lock(&key).await.unwrap().into_record().unwrap();
        assert_eq!(first.version, 1);
        let blocked = b.set_lock(&key).await.unwrap();
        assert!(blocked.is_blocked());
        assert_eq!(blocked.record().unwrap().owner_id, a.owner_id());

        sleep(Duration::from_millis(1500)).await;
        let stored = store.get(&table, &key).await.unwrap().unwrap();
        assert_eq!(stored.owner_id, a.owner_id());
        assert!(stored.version >= 2);

        a.release_my_lock(&key).await.unwrap();
        assert!(store.get(&table, &key).await.unwrap().is_none());
        assert!(b.set_lock(&key).await.unwrap().is_acquired());
        b.release_all().await.unwrap();
    }
}

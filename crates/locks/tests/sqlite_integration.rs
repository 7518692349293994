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

//! SQLite lock store integration tests.
//!
//! These tests verify:
//! - The conditional upsert for fresh, renewal and takeover writes
//! - Owner-checked deletes
//! - The lock manager end to end on SQLite
//! - Database queries to verify row state

#[cfg(feature = "sqlite-backend")]
mod tests {
    use chrono::{DateTime, Utc};
    use rowlease_locks::{
        datetime_from_millis, format_created_at, sql::SqliteLockStore, LockManager, LockRecord, LockStore, UpdateCondition, WriteOutcome,
    };
    use sqlx::Row;
    use tokio::time::{sleep, Duration};

    const TABLE: &str = "Lock-test";

    /// Create a new SQLite lock store with in-memory database
    async fn create_store() -> SqliteLockStore {
        SqliteLockStore::new("sqlite::memory:").await.unwrap()
    }

    fn now_millis() -> DateTime<Utc> {
        // Stored timestamps have millisecond precision.
        datetime_from_millis(Utc::now().timestamp_millis()).unwrap()
    }

    fn record(owner: &str, version: u64, ttl: DateTime<Utc>) -> LockRecord {
        LockRecord {
            key: "job".to_string(),
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
    async fn test_sqlite_fresh_write_only_on_absent_row() {
        let store = create_store().await;
        let ttl = now_millis() + chrono::Duration::seconds(10);
        let first = record("me", 1, ttl);

        let outcome = store
            .conditional_update(TABLE, &first, &UpdateCondition::absent("me"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(first.clone()));

        let second = record("other", 1, ttl);
        let outcome = store
            .conditional_update(TABLE, &second, &UpdateCondition::absent("other"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);
        assert_eq!(store.get(TABLE, "job").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_sqlite_renewal_requires_matching_version() {
        let store = create_store().await;
        let ttl = now_millis() + chrono::Duration::seconds(10);
        let v1 = record("me", 1, ttl);
        store.put(TABLE, &v1).await.unwrap();

        let v2 = record("me", 2, ttl + chrono::Duration::seconds(5));
        let outcome = store
            .conditional_update(TABLE, &v2, &UpdateCondition::from_baseline(&v1, false, "me"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(v2.clone()));

        // Stale baseline.
        let outcome = store
            .conditional_update(TABLE, &record("me", 2, ttl), &UpdateCondition::from_baseline(&v1, false, "me"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);
        assert_eq!(store.get(TABLE, "job").await.unwrap(), Some(v2));
    }

    #[tokio::test]
    async fn test_sqlite_takeover_requires_expired_flag() {
        let store = create_store().await;
        let theirs = record("other", 4, now_millis() - chrono::Duration::seconds(1));
        store.put(TABLE, &theirs).await.unwrap();
        let mine = record("me", 5, now_millis() + chrono::Duration::seconds(10));

        let outcome = store
            .conditional_update(TABLE, &mine, &UpdateCondition::from_baseline(&theirs, false, "me"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);

        let outcome = store
            .conditional_update(TABLE, &mine, &UpdateCondition::from_baseline(&theirs, true, "me"))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(mine));
    }

    #[tokio::test]
    async fn test_sqlite_delete_checks_owner() {
        let store = create_store().await;
        let row = record("me", 1, now_millis() + chrono::Duration::seconds(10));
        store.put(TABLE, &row).await.unwrap();

        let outcome = store.conditional_delete(TABLE, "job", "other").await.unwrap();
        assert_eq!(outcome, WriteOutcome::ConditionFailed);

        let outcome = store.conditional_delete(TABLE, "job", "me").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(Some(row)));

        // Verify row is gone in database
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM locks")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_sqlite_created_at_stored_as_text() {
        let store = create_store().await;
        let row = record("me", 1, now_millis() + chrono::Duration::seconds(10));
        store.put(TABLE, &row).await.unwrap();

        let stored: String = sqlx::query("SELECT created_at FROM locks WHERE lock_key = 'job'")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("created_at");
        assert_eq!(stored, format_created_at(row.created_at.unwrap()));
        assert_eq!(store.get(TABLE, "job").await.unwrap().unwrap().created_at, row.created_at);
    }

    #[tokio::test]
    async fn test_sqlite_namespaces_are_isolated() {
        let store = create_store().await;
        let row = record("me", 1, now_millis() + chrono::Duration::seconds(10));
        store.put("table-a", &row).await.unwrap();

        assert!(store.get("table-a", "job").await.unwrap().is_some());
        assert!(store.get("table-b", "job").await.unwrap().is_none());
        let outcome = store
            .conditional_update("table-b", &row, &UpdateCondition::absent("me"))
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[tokio::test]
    async fn test_sqlite_manager_end_to_end() {
        let store = create_store().await;
        let a = LockManager::builder()
            .store(store.clone())
            .table_name(TABLE)
            .lease_duration_secs(1)
            .release_grace(Duration::from_millis(50))
            .build()
            .unwrap();
        let b = LockManager::builder()
            .store(store.clone())
            .table_name(TABLE)
            .lease_duration_secs(1)
            .build()
            .unwrap();

        let first = a.set_lock("job").await.unwrap().into_record().unwrap();
        assert_eq!(first.version, 1);
        assert!(b.set_lock("job").await.unwrap().is_blocked());

        // Heartbeat at half lease keeps A's row alive past its first ttl.
        sleep(Duration::from_millis(1200)).await;
        let stored = store.get(TABLE, "job").await.unwrap().unwrap();
        assert_eq!(stored.owner_id, a.owner_id());
        assert!(stored.version >= 2);
        assert_eq!(stored.created_at, first.created_at);

        a.release_my_lock("job").await.unwrap();
        assert!(store.get(TABLE, "job").await.unwrap().is_none());
        assert!(b.set_lock("job").await.unwrap().is_acquired());
        b.release_all().await.unwrap();
    }
}

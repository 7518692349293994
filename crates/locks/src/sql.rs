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

//! SQLite lock store.
//!
//! One `locks` table holds every namespace:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS locks (
//!   namespace TEXT NOT NULL,
//!   lock_key TEXT NOT NULL,
//!   owner_id TEXT NOT NULL,
//!   version INTEGER NOT NULL,
//!   lease_duration_secs INTEGER NOT NULL,
//!   created_by_host TEXT NOT NULL DEFAULT '',
//!   created_by_user TEXT NOT NULL DEFAULT '',
//!   created_at TEXT,
//!   ttl INTEGER NOT NULL,
//!   PRIMARY KEY (namespace, lock_key)
//! );
//! ```
//!
//! - `ttl` is stored as UNIX epoch milliseconds, `created_at` as RFC 3339 text
//! - the conditional update is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE`
//!   statement, so the predicate and the write are one atomic step

use crate::store::{LockStore, UpdateCondition, WriteOutcome};
use crate::{coerce_datetime, datetime_from_millis, format_created_at, LockError, LockRecord, LockResult};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Instant;
use tracing::{debug, instrument};

const RECORD_COLUMNS: &str =
    "lock_key, owner_id, version, lease_duration_secs, created_by_host, created_by_user, created_at, ttl";

/// SQLite-based lock store.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    /// Connect and create the schema.
    ///
    /// `database_url` is any valid `sqlx` SQLite URL, e.g.:
    /// - `sqlite::memory:` (in-memory, single connection)
    /// - `sqlite://locks.db?mode=rwc`
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> LockResult<Self> {
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| LockError::BackendError(format!("failed to connect SQLite: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool; the schema is created if missing.
    pub async fn from_pool(pool: SqlitePool) -> LockResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
              namespace TEXT NOT NULL,
              lock_key TEXT NOT NULL,
              owner_id TEXT NOT NULL,
              version INTEGER NOT NULL,
              lease_duration_secs INTEGER NOT NULL,
              created_by_host TEXT NOT NULL DEFAULT '',
              created_by_user TEXT NOT NULL DEFAULT '',
              created_at TEXT,
              ttl INTEGER NOT NULL,
              PRIMARY KEY (namespace, lock_key)
            );
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::BackendError(format!("failed to create locks table: {e}")))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn record_from_row(row: &SqliteRow) -> LockResult<LockRecord> {
        let version: i64 = row.try_get("version")?;
        let lease_duration_secs: i64 = row.try_get("lease_duration_secs")?;
        let created_at: Option<String> = row.try_get("created_at")?;
        let ttl: i64 = row.try_get("ttl")?;

        Ok(LockRecord {
            key: row.try_get("lock_key")?,
            owner_id: row.try_get("owner_id")?,
            version: u64::try_from(version)
                .map_err(|_| LockError::DeserializationError(format!("negative lock version {version}")))?,
            lease_duration_secs: u32::try_from(lease_duration_secs).map_err(|_| {
                LockError::DeserializationError(format!("invalid lease duration {lease_duration_secs}"))
            })?,
            created_by_host: row.try_get("created_by_host")?,
            created_by_user: row.try_get("created_by_user")?,
            created_at: created_at.as_deref().and_then(coerce_datetime),
            ttl: datetime_from_millis(ttl)
                .ok_or_else(|| LockError::DeserializationError(format!("invalid lock ttl {ttl}")))?,
        })
    }
}

fn version_param(version: u64) -> LockResult<i64> {
    i64::try_from(version).map_err(|_| LockError::SerializationError(format!("lock version {version} overflows")))
}

#[async_trait]
impl LockStore for SqliteLockStore {
    #[instrument(skip(self), fields(namespace = %namespace, lock_key = %key))]
    async fn get(&self, namespace: &str, key: &str) -> LockResult<Option<LockRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM locks WHERE namespace = ?1 AND lock_key = ?2"
        ))
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("select lock: {e}")))?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(namespace = %namespace, lock_key = %record.key))]
    async fn put(&self, namespace: &str, record: &LockRecord) -> LockResult<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO locks
               (namespace, lock_key, owner_id, version, lease_duration_secs,
                created_by_host, created_by_user, created_at, ttl)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(namespace)
        .bind(&record.key)
        .bind(&record.owner_id)
        .bind(version_param(record.version)?)
        .bind(i64::from(record.lease_duration_secs))
        .bind(&record.created_by_host)
        .bind(&record.created_by_user)
        .bind(record.created_at.map(format_created_at))
        .bind(record.ttl_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("put lock: {e}")))?;
        Ok(())
    }

    #[instrument(
        skip(self, new_values, condition),
        fields(namespace = %namespace, lock_key = %new_values.key, version = new_values.version)
    )]
    async fn conditional_update(
        &self,
        namespace: &str,
        new_values: &LockRecord,
        condition: &UpdateCondition,
    ) -> LockResult<WriteOutcome<LockRecord>> {
        let start_time = Instant::now();
        // A NULL expected owner/version never matches, so an existing row
        // always blocks a write without a baseline.
        let expected_version = condition.expected_version.map(version_param).transpose()?;

        let row = sqlx::query(&format!(
            r#"INSERT INTO locks
               (namespace, lock_key, owner_id, version, lease_duration_secs,
                created_by_host, created_by_user, created_at, ttl)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(namespace, lock_key) DO UPDATE SET
                 owner_id = excluded.owner_id,
                 version = excluded.version,
                 lease_duration_secs = excluded.lease_duration_secs,
                 created_by_host = excluded.created_by_host,
                 created_by_user = excluded.created_by_user,
                 created_at = excluded.created_at,
                 ttl = excluded.ttl
               WHERE locks.owner_id = ?10
                 AND locks.version = ?11
                 AND (?12 OR locks.owner_id = ?13)
               RETURNING {RECORD_COLUMNS}"#
        ))
        .bind(namespace)
        .bind(&new_values.key)
        .bind(&new_values.owner_id)
        .bind(version_param(new_values.version)?)
        .bind(i64::from(new_values.lease_duration_secs))
        .bind(&new_values.created_by_host)
        .bind(&new_values.created_by_user)
        .bind(new_values.created_at.map(format_created_at))
        .bind(new_values.ttl_millis())
        .bind(condition.expected_owner.as_deref())
        .bind(expected_version)
        .bind(condition.blocking_expired)
        .bind(&condition.new_owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("upsert lock: {e}")))?;

        let duration = start_time.elapsed();
        metrics::histogram!("rowlease_locks_sqlite_update_duration_seconds").record(duration.as_secs_f64());

        match row {
            Some(row) => {
                debug!(duration_ms = duration.as_millis(), "Lock row written");
                Ok(WriteOutcome::Applied(Self::record_from_row(&row)?))
            }
            None => {
                metrics::counter!("rowlease_locks_sqlite_condition_failed_total").increment(1);
                Ok(WriteOutcome::ConditionFailed)
            }
        }
    }

    #[instrument(skip(self), fields(namespace = %namespace, lock_key = %key))]
    async fn conditional_delete(
        &self,
        namespace: &str,
        key: &str,
        expected_owner: &str,
    ) -> LockResult<WriteOutcome<Option<LockRecord>>> {
        let row = sqlx::query(&format!(
            "DELETE FROM locks WHERE namespace = ?1 AND lock_key = ?2 AND owner_id = ?3 RETURNING {RECORD_COLUMNS}"
        ))
        .bind(namespace)
        .bind(key)
        .bind(expected_owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("delete lock: {e}")))?;

        match row {
            Some(row) => Ok(WriteOutcome::Applied(Some(Self::record_from_row(&row)?))),
            None => Ok(WriteOutcome::ConditionFailed),
        }
    }
}

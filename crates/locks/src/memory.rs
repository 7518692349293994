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

//! In-memory lock store (for testing).

use crate::store::{LockStore, UpdateCondition, WriteOutcome};
use crate::{LockRecord, LockResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type RowKey = (String, String);

/// In-memory lock store (for testing).
///
/// ## Purpose
/// Stands in for a shared table in tests and single-process setups. Clones
/// share the same rows, so several managers built on clones of one store
/// contend exactly as they would on a real table.
///
/// ## Limitations
/// - Not persistent (rows lost on restart)
/// - Not distributed (single process only)
/// - No TTL cleanup (expired rows remain until taken over or deleted)
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    rows: Arc<RwLock<HashMap<RowKey, LockRecord>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in `namespace`.
    pub async fn len(&self, namespace: &str) -> usize {
        self.rows.read().await.keys().filter(|(ns, _)| ns == namespace).count()
    }

    pub async fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace).await == 0
    }
}

fn row_key(namespace: &str, key: &str) -> RowKey {
    (namespace.to_string(), key.to_string())
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn get(&self, namespace: &str, key: &str) -> LockResult<Option<LockRecord>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&row_key(namespace, key)).cloned())
    }

    async fn put(&self, namespace: &str, record: &LockRecord) -> LockResult<()> {
        let mut rows = self.rows.write().await;
        rows.insert(row_key(namespace, &record.key), record.clone());
        Ok(())
    }

    async fn conditional_update(
        &self,
        namespace: &str,
        new_values: &LockRecord,
        condition: &UpdateCondition,
    ) -> LockResult<WriteOutcome<LockRecord>> {
        let mut rows = self.rows.write().await;
        let id = row_key(namespace, &new_values.key);
        if !condition.holds(rows.get(&id)) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        rows.insert(id, new_values.clone());
        Ok(WriteOutcome::Applied(new_values.clone()))
    }

    async fn conditional_delete(
        &self,
        namespace: &str,
        key: &str,
        expected_owner: &str,
    ) -> LockResult<WriteOutcome<Option<LockRecord>>> {
        let mut rows = self.rows.write().await;
        let id = row_key(namespace, key);
        match rows.get(&id) {
            Some(row) if row.owner_id == expected_owner => Ok(WriteOutcome::Applied(rows.remove(&id))),
            _ => Ok(WriteOutcome::ConditionFailed),
        }
    }
}

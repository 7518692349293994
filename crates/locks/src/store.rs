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

//! Backing store adapter for lock records.
//!
//! The lock manager needs exactly four operations from a store: read a row,
//! write a row, conditionally update a row (returning the new row), and
//! conditionally delete a row. The conditional operations must evaluate
//! their predicate atomically against the stored row as part of the same
//! write; that single-row atomicity is the only synchronization the lock
//! protocol relies on.

use crate::{LockRecord, LockResult};
use async_trait::async_trait;

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    /// The condition held and the write was applied.
    Applied(T),
    /// The stored row did not satisfy the condition; nothing was written.
    ConditionFailed,
}

impl<T> WriteOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }
}

/// Predicate guarding an acquire/renew write.
///
/// The update applies when the row does not exist yet, or when
/// - the stored owner is still `expected_owner`, and
/// - the stored version is still `expected_version`, and
/// - either the blocking lease was observed as expired, or the stored owner
///   is `new_owner` (a renewal of our own lease).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCondition {
    /// Owner of the baseline record; `None` for a first-time acquisition.
    pub expected_owner: Option<String>,
    /// Version of the baseline record; `None` for a first-time acquisition.
    pub expected_version: Option<u64>,
    /// Whether the baseline (someone else's lease) was seen as expired.
    pub blocking_expired: bool,
    /// Owner id the caller is writing.
    pub new_owner: String,
}

impl UpdateCondition {
    /// Condition for a write with no baseline: only succeeds on an absent row.
    pub fn absent(new_owner: impl Into<String>) -> Self {
        Self {
            expected_owner: None,
            expected_version: None,
            blocking_expired: false,
            new_owner: new_owner.into(),
        }
    }

    /// Condition for a write that builds on `baseline`.
    pub fn from_baseline(baseline: &LockRecord, blocking_expired: bool, new_owner: impl Into<String>) -> Self {
        Self {
            expected_owner: Some(baseline.owner_id.clone()),
            expected_version: Some(baseline.version),
            blocking_expired,
            new_owner: new_owner.into(),
        }
    }

    /// Evaluate the predicate against the currently stored row.
    ///
    /// Stores without a native condition language call this while holding
    /// their own write lock.
    pub fn holds(&self, stored: Option<&LockRecord>) -> bool {
        match stored {
            None => true,
            Some(row) => {
                self.expected_owner.as_deref() == Some(row.owner_id.as_str())
                    && self.expected_version == Some(row.version)
                    && (self.blocking_expired || row.owner_id == self.new_owner)
            }
        }
    }
}

/// Store operations consumed by [`LockManager`](crate::LockManager).
///
/// `namespace` is the lock table (or collection) name; keys are unique
/// within a namespace.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Read the row for `key`, if any.
    async fn get(&self, namespace: &str, key: &str) -> LockResult<Option<LockRecord>>;

    /// Unconditionally write `record`. Bootstrap and tooling only; the lock
    /// protocol itself never calls it.
    async fn put(&self, namespace: &str, record: &LockRecord) -> LockResult<()>;

    /// Atomically write `new_values` if `condition` holds for the stored row,
    /// returning the row as stored after the write.
    async fn conditional_update(
        &self,
        namespace: &str,
        new_values: &LockRecord,
        condition: &UpdateCondition,
    ) -> LockResult<WriteOutcome<LockRecord>>;

    /// Atomically delete the row for `key` if it is owned by `expected_owner`,
    /// returning the deleted row when the store reports it. An absent row
    /// fails the condition.
    async fn conditional_delete(
        &self,
        namespace: &str,
        key: &str,
        expected_owner: &str,
    ) -> LockResult<WriteOutcome<Option<LockRecord>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(owner: &str, version: u64) -> LockRecord {
        LockRecord {
            key: "k".to_string(),
            owner_id: owner.to_string(),
            version,
            lease_duration_secs: 10,
            created_by_host: String::new(),
            created_by_user: String::new(),
            created_at: None,
            ttl: Utc::now(),
        }
    }

    #[test]
    fn test_absent_condition() {
        let cond = UpdateCondition::absent("me");
        assert!(cond.holds(None));
        assert!(!cond.holds(Some(&row("me", 0))));
        assert!(!cond.holds(Some(&row("other", 1))));
    }

    #[test]
    fn test_renewal_condition() {
        let baseline = row("me", 4);
        let cond = UpdateCondition::from_baseline(&baseline, false, "me");
        assert!(cond.holds(Some(&row("me", 4))));
        assert!(cond.holds(None));
        // someone bumped the version
        assert!(!cond.holds(Some(&row("me", 5))));
        // someone took over
        assert!(!cond.holds(Some(&row("other", 4))));
    }

    #[test]
    fn test_takeover_condition() {
        let baseline = row("other", 7);
        let live = UpdateCondition::from_baseline(&baseline, false, "me");
        assert!(!live.holds(Some(&row("other", 7))));

        let expired = UpdateCondition::from_baseline(&baseline, true, "me");
        assert!(expired.holds(Some(&row("other", 7))));
        // the other owner renewed after we looked
        assert!(!expired.holds(Some(&row("other", 8))));
    }
}

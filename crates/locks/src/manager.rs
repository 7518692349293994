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

//! Lease-based lock manager.
//!
//! ## Protocol
//! Every acquire, renewal and takeover is a single conditional update of the
//! lock row, fenced by the `(owner, version)` pair this instance last
//! observed. The store's atomic conditional write is the only serialization
//! point between processes, so at most one writer succeeds per
//! `(key, version)`.
//!
//! - **Acquire**: no local knowledge of the key; only succeeds if the row is absent.
//! - **Renew**: key is owned; writes `version + 1` over our own row.
//! - **Takeover**: key is watched (held by someone else); succeeds only once
//!   the watched lease has expired by this instance's clock and the row has
//!   not changed since we looked.
//!
//! A lost race is not an error: the current row is read back, recorded in the
//! watch list, and handed to the caller as [`AcquireOutcome::Blocked`].
//!
//! ## Local State
//! - `owned`: locks this instance believes it holds, each with a heartbeat task
//! - `watched`: last observed state of locks held by other owners
//! - `releasing`: owned keys whose release is in flight; purged after the
//!   configured grace delay so a concurrently running renewal does not
//!   resurrect them
//!
//! ## Clock Assumption
//! Lease expiry is computed and checked with the local wall clock of each
//! participant. Significant clock skew between processes can let a lease be
//! taken over early.

use crate::config::LockManagerConfig;
use crate::renewal::{self, Heartbeat, RenewalEvent};
use crate::store::{LockStore, UpdateCondition, WriteOutcome};
use crate::{new_owner_id, LockError, LockRecord, LockResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of [`LockManager::set_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This instance owns the lock; the record is the row as stored.
    Acquired(LockRecord),
    /// Someone else holds a lease; the record describes the holder.
    /// Retry once [`AcquireOutcome::retry_after`] has elapsed.
    Blocked(LockRecord),
    /// A renewal raced with a release of the same key and was dropped.
    Cancelled,
}

impl AcquireOutcome {
    pub fn record(&self) -> Option<&LockRecord> {
        match self {
            AcquireOutcome::Acquired(record) | AcquireOutcome::Blocked(record) => Some(record),
            AcquireOutcome::Cancelled => None,
        }
    }

    pub fn into_record(self) -> Option<LockRecord> {
        match self {
            AcquireOutcome::Acquired(record) | AcquireOutcome::Blocked(record) => Some(record),
            AcquireOutcome::Cancelled => None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, AcquireOutcome::Blocked(_))
    }

    /// For a blocked outcome, how long until the holder's lease runs out.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            AcquireOutcome::Blocked(record) => Some(record.remaining_at(now)),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AcquireOutcome::Acquired(_) => "acquired",
            AcquireOutcome::Blocked(_) => "blocked",
            AcquireOutcome::Cancelled => "cancelled",
        }
    }
}

/// Builder for [`LockManager`].
///
/// ## Example
/// ```rust,no_run
/// use rowlease_locks::{memory::MemoryLockStore, LockManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = LockManager::builder()
///     .store(MemoryLockStore::new())
///     .table_name("Lock-dev")
///     .build()?;
///
/// let outcome = manager.set_lock("job-42").await?;
/// if outcome.is_acquired() {
///     // ... do the work, the heartbeat keeps the lease alive ...
///     manager.release_my_lock("job-42").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct LockManagerBuilder {
    store: Option<Arc<dyn LockStore>>,
    config: LockManagerConfig,
}

impl LockManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store<S: LockStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the whole configuration (e.g. one loaded with
    /// [`LockManagerConfig::from_env`]).
    pub fn config(mut self, config: LockManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.config.table_name = table_name.into();
        self
    }

    pub fn lease_duration_secs(mut self, secs: u32) -> Self {
        self.config.lease_duration_secs = secs;
        self
    }

    pub fn release_grace(mut self, grace: Duration) -> Self {
        self.config.release_grace = grace;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    /// Validate the configuration and create the manager.
    ///
    /// Fails with [`LockError::ConfigError`] if no store was given, the
    /// table name is empty, or the lease duration is zero.
    pub fn build(self) -> LockResult<LockManager> {
        let store = self
            .store
            .ok_or_else(|| LockError::ConfigError("a lock store is required".to_string()))?;
        if self.config.table_name.trim().is_empty() {
            return Err(LockError::ConfigError("a lock table name is required".to_string()));
        }
        if self.config.lease_duration_secs == 0 {
            return Err(LockError::ConfigError("lease duration must be at least one second".to_string()));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let owner_id = new_owner_id();
        debug!(
            owner_id = %owner_id,
            table_name = %self.config.table_name,
            lease_duration_secs = self.config.lease_duration_secs,
            "Lock manager created"
        );

        Ok(LockManager {
            inner: Arc::new(Inner {
                store,
                config: self.config,
                owner_id,
                state: Mutex::new(LockState::default()),
                events,
            }),
        })
    }
}

/// Distributed lock manager for one process.
///
/// Cloning is cheap and every clone shares the same owner id and local
/// state. Dropping the last clone stops all heartbeats; held leases then
/// lapse after their time-to-live.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("owner_id", &self.inner.owner_id)
            .field("table_name", &self.inner.config.table_name)
            .finish()
    }
}

impl LockManager {
    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::new()
    }

    /// Create a manager with default lease settings.
    ///
    /// `host` and `user` only feed the diagnostic `createdByHost` /
    /// `createdByUser` fields; `None` falls back to the local hostname and
    /// login name.
    pub fn new(
        store: Arc<dyn LockStore>,
        table_name: impl Into<String>,
        host: Option<String>,
        user: Option<String>,
    ) -> LockResult<Self> {
        let mut builder = Self::builder().shared_store(store).table_name(table_name);
        if let Some(host) = host {
            builder = builder.host(host);
        }
        if let Some(user) = user {
            builder = builder.user(user);
        }
        builder.build()
    }

    /// Unique id of this manager instance, written as the lock owner.
    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.inner.config
    }

    /// Acquire `key`, or extend the lease if this instance already owns it.
    ///
    /// ## Returns
    /// - `Ok(Acquired)`: this instance owns the lock and a heartbeat keeps it alive
    /// - `Ok(Blocked)`: another owner holds an unexpired lease
    /// - `Ok(Cancelled)`: a renewal raced with [`LockManager::release_my_lock`]
    /// - `Err(LockError::BackendError)`: the store failed; local state is unchanged
    #[instrument(skip(self), fields(owner_id = %self.inner.owner_id, table_name = %self.inner.config.table_name))]
    pub async fn set_lock(&self, key: &str) -> LockResult<AcquireOutcome> {
        validate_key(key)?;
        self.inner.set_lock(key).await
    }

    /// Renew `key` only if this instance currently owns it.
    #[instrument(skip(self), fields(owner_id = %self.inner.owner_id))]
    pub async fn refresh_lock(&self, key: &str) -> LockResult<Option<AcquireOutcome>> {
        if !self.inner.is_actively_owned(key) {
            return Ok(None);
        }
        self.inner.set_lock(key).await.map(Some)
    }

    /// Release a lock this instance owns.
    ///
    /// Stops the heartbeat immediately and deletes the row if it is still
    /// ours. Returns the record that was held, or `None` when the key is not
    /// owned (never acquired, or already released).
    ///
    /// A store error is returned to the caller, but the lock stays abandoned
    /// locally: the heartbeat is not restarted.
    #[instrument(skip(self), fields(owner_id = %self.inner.owner_id, table_name = %self.inner.config.table_name))]
    pub async fn release_my_lock(&self, key: &str) -> LockResult<Option<LockRecord>> {
        self.inner.release_my_lock(key).await
    }

    /// Release every lock this instance owns.
    ///
    /// Attempts all releases and reports the first failure, if any.
    pub async fn release_all(&self) -> LockResult<Vec<LockRecord>> {
        let mut released = Vec::new();
        let mut first_error = None;
        for key in self.owned_keys() {
            match self.inner.release_my_lock(&key).await {
                Ok(Some(record)) => released.push(record),
                Ok(None) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// The record for `key` if this instance owns it (releases in flight excluded).
    pub fn owned_lock(&self, key: &str) -> Option<LockRecord> {
        let state = self.inner.state();
        if state.releasing.contains_key(key) {
            return None;
        }
        state.owned.get(key).cloned()
    }

    /// Last observed record of a lock held by another owner.
    pub fn watched_lock(&self, key: &str) -> Option<LockRecord> {
        self.inner.state().watched.get(key).cloned()
    }

    /// Keys this instance owns (releases in flight excluded), sorted.
    pub fn owned_keys(&self) -> Vec<String> {
        let state = self.inner.state();
        let mut keys: Vec<String> = state
            .owned
            .keys()
            .filter(|key| !state.releasing.contains_key(*key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Whether a heartbeat task is registered for `key`.
    pub fn has_heartbeat(&self, key: &str) -> bool {
        self.inner.state().heartbeats.contains_key(key)
    }

    /// Subscribe to the outcome of timer-driven renewals.
    pub fn subscribe(&self) -> broadcast::Receiver<RenewalEvent> {
        self.inner.events.subscribe()
    }
}

fn validate_key(key: &str) -> LockResult<()> {
    if key.is_empty() {
        return Err(LockError::InvalidKey("lock key must not be empty".to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub(crate) struct LockState {
    owned: HashMap<String, LockRecord>,
    watched: HashMap<String, LockRecord>,
    heartbeats: HashMap<String, Heartbeat>,
    releasing: HashMap<String, u64>,
    next_heartbeat_id: u64,
    next_release_id: u64,
}

impl LockState {
    fn is_actively_owned(&self, key: &str) -> bool {
        self.owned.contains_key(key) && !self.releasing.contains_key(key)
    }
}

/// Write planned for one acquisition attempt.
struct UpdatePlan {
    new_values: LockRecord,
    condition: UpdateCondition,
    renewal: bool,
}

/// What the conflict read found.
enum Observed {
    /// The row disappeared after our write lost: try again from scratch.
    Vanished,
    /// The row is ours and we hold it: a concurrent renewal got there first.
    Mine(LockRecord),
    /// Someone else's row (or ours while a release is in flight).
    Blocking(LockRecord),
}

pub(crate) struct Inner {
    store: Arc<dyn LockStore>,
    config: LockManagerConfig,
    owner_id: String,
    state: Mutex<LockState>,
    events: broadcast::Sender<RenewalEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, heartbeat) in state.heartbeats.drain() {
            heartbeat.abort();
        }
    }
}

impl Inner {
    /// Local state is never held across an await.
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_actively_owned(&self, key: &str) -> bool {
        self.state().is_actively_owned(key)
    }

    pub(crate) fn emit(&self, event: RenewalEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) async fn set_lock(self: &Arc<Self>, key: &str) -> LockResult<AcquireOutcome> {
        let start_time = Instant::now();
        let result = self.set_lock_inner(key).await;

        let duration = start_time.elapsed();
        metrics::histogram!("rowlease_locks_acquire_duration_seconds").record(duration.as_secs_f64());
        match &result {
            Ok(outcome) => {
                metrics::counter!("rowlease_locks_acquire_total", "result" => outcome.label()).increment(1);
                debug!(key = %key, result = outcome.label(), duration_ms = duration.as_millis(), "set_lock finished");
            }
            Err(e) => {
                metrics::counter!("rowlease_locks_acquire_errors_total").increment(1);
                error!(key = %key, error = %e, "set_lock failed");
            }
        }
        result
    }

    async fn set_lock_inner(self: &Arc<Self>, key: &str) -> LockResult<AcquireOutcome> {
        // Baseline already retried in this call, so an expired row is taken
        // over at most once per observation.
        let mut retried: Option<(String, u64)> = None;

        loop {
            let plan = self.plan_update(key, Utc::now());

            // A release may have happened since the baseline was chosen.
            if plan.renewal && !self.is_actively_owned(key) {
                debug!(key = %key, "Renewal cancelled by a concurrent release");
                return Ok(AcquireOutcome::Cancelled);
            }

            let outcome = self
                .store
                .conditional_update(&self.config.table_name, &plan.new_values, &plan.condition)
                .await?;

            match outcome {
                WriteOutcome::Applied(row) => {
                    let outcome = self.record_my_updated_lock(key, row, plan.renewal);
                    if outcome == AcquireOutcome::Cancelled {
                        self.discard_late_renewal(key).await;
                    }
                    return Ok(outcome);
                }
                WriteOutcome::ConditionFailed => {
                    debug!(key = %key, "Conditional update rejected, reading current holder");
                    match self.get_and_watch_blocking_lock(key, plan.renewal).await? {
                        Observed::Vanished => continue,
                        Observed::Mine(row) => return Ok(AcquireOutcome::Acquired(row)),
                        Observed::Blocking(row) => {
                            let marker = (row.owner_id.clone(), row.version);
                            let reclaimable = row.owner_id.is_empty()
                                || row.owner_id == self.owner_id
                                || row.is_expired_at(Utc::now());
                            if reclaimable && retried.as_ref() != Some(&marker) {
                                retried = Some(marker);
                                continue;
                            }
                            return Ok(AcquireOutcome::Blocked(row));
                        }
                    }
                }
            }
        }
    }

    fn plan_update(&self, key: &str, now: DateTime<Utc>) -> UpdatePlan {
        let state = self.state();
        let ttl = now + chrono::Duration::seconds(i64::from(self.config.lease_duration_secs));
        let mut new_values = LockRecord {
            key: key.to_string(),
            owner_id: self.owner_id.clone(),
            version: 1,
            lease_duration_secs: self.config.lease_duration_secs,
            created_by_host: self.config.host.clone(),
            created_by_user: self.config.user.clone(),
            created_at: Some(now),
            ttl,
        };

        if state.is_actively_owned(key) {
            if let Some(mine) = state.owned.get(key) {
                new_values.version = mine.version + 1;
                // First acquisition time survives renewals.
                new_values.created_at = mine.created_at.or(Some(now));
                return UpdatePlan {
                    condition: UpdateCondition::from_baseline(mine, false, &self.owner_id),
                    new_values,
                    renewal: true,
                };
            }
        }

        if let Some(blocking) = state.watched.get(key) {
            let blocking_expired = blocking.owner_id.is_empty() || blocking.is_expired_at(now);
            new_values.version = blocking.version + 1;
            return UpdatePlan {
                condition: UpdateCondition::from_baseline(blocking, blocking_expired, &self.owner_id),
                new_values,
                renewal: false,
            };
        }

        UpdatePlan {
            condition: UpdateCondition::absent(&self.owner_id),
            new_values,
            renewal: false,
        }
    }

    /// Record a row we just wrote as owned and make sure it has a heartbeat.
    fn record_my_updated_lock(self: &Arc<Self>, key: &str, row: LockRecord, renewal: bool) -> AcquireOutcome {
        let mut state = self.state();
        if renewal && !state.is_actively_owned(key) {
            debug!(key = %key, version = row.version, "Renewal landed after release, not recording");
            return AcquireOutcome::Cancelled;
        }

        state.watched.remove(key);
        state.releasing.remove(key);
        state.owned.insert(key.to_string(), row.clone());

        if !state.heartbeats.contains_key(key) {
            state.next_heartbeat_id += 1;
            let id = state.next_heartbeat_id;
            debug!(
                key = %key,
                period_ms = self.config.renewal_period().as_millis(),
                "Starting lock heartbeat"
            );
            let heartbeat = renewal::spawn_heartbeat(Arc::downgrade(self), key.to_string(), id, self.config.renewal_period());
            state.heartbeats.insert(key.to_string(), heartbeat);
        }

        AcquireOutcome::Acquired(row)
    }

    /// A renewal write that landed after its release re-created our row.
    /// Delete it again so other owners are not blocked for a full lease.
    async fn discard_late_renewal(&self, key: &str) {
        if self.is_actively_owned(key) {
            return;
        }
        match self
            .store
            .conditional_delete(&self.config.table_name, key, &self.owner_id)
            .await
        {
            Ok(WriteOutcome::Applied(_)) => {
                metrics::counter!("rowlease_locks_release_total", "result" => "late_renewal_deleted").increment(1);
                debug!(key = %key, "Deleted row re-created by a renewal racing release");
            }
            Ok(WriteOutcome::ConditionFailed) => {
                debug!(key = %key, "Row from late renewal already gone or taken over");
            }
            Err(e) => {
                metrics::counter!("rowlease_locks_release_errors_total").increment(1);
                warn!(key = %key, error = %e, "Failed to delete row re-created by a late renewal, it lapses with its lease");
            }
        }
    }

    /// Read the current row after a lost race and decide what it means.
    async fn get_and_watch_blocking_lock(&self, key: &str, renewal: bool) -> LockResult<Observed> {
        let row = self.store.get(&self.config.table_name, key).await.map_err(|e| {
            LockError::BackendError(format!("failed to read conflicting lock \"{}\": {}", key, e))
        })?;

        let Some(row) = row else {
            debug!(key = %key, "Conflicting lock is gone, retrying as a fresh acquisition");
            return Ok(Observed::Vanished);
        };

        let mut state = self.state();
        if row.owner_id == self.owner_id && state.is_actively_owned(key) {
            let fresher = state.owned.get(key).map_or(true, |mine| row.version >= mine.version);
            if fresher {
                state.owned.insert(key.to_string(), row.clone());
            }
            return Ok(Observed::Mine(row));
        }

        if renewal && state.is_actively_owned(key) {
            warn!(
                key = %key,
                holder = %row.owner_id,
                version = row.version,
                "Lock lost to another owner, dropping it"
            );
            metrics::counter!("rowlease_locks_lost_total").increment(1);
            state.owned.remove(key);
            // The heartbeat notices it was deregistered on its next tick.
            state.heartbeats.remove(key);
        }

        debug!(key = %key, holder = %row.owner_id, version = row.version, "Watching blocking lock");
        state.watched.insert(key.to_string(), row.clone());
        Ok(Observed::Blocking(row))
    }

    /// Stop and forget the heartbeat for `key`.
    fn kill_lock_heartbeat(state: &mut LockState, key: &str) {
        if let Some(heartbeat) = state.heartbeats.remove(key) {
            debug!(key = %key, "Stopping lock heartbeat");
            heartbeat.abort();
        }
    }

    /// Heartbeat `id` is still the one registered for `key`.
    pub(crate) fn heartbeat_is_current(&self, key: &str, id: u64) -> bool {
        self.state().heartbeats.get(key).map_or(false, |hb| hb.id() == id)
    }

    /// Called by a heartbeat that found its key no longer owned.
    pub(crate) fn retire_heartbeat(&self, key: &str, id: u64) {
        let mut state = self.state();
        if state.heartbeats.get(key).map_or(false, |hb| hb.id() == id) {
            // Dropping the handle detaches; the caller exits on its own.
            state.heartbeats.remove(key);
        }
    }

    async fn release_my_lock(self: &Arc<Self>, key: &str) -> LockResult<Option<LockRecord>> {
        let start_time = Instant::now();
        let (record, release_id) = {
            let mut state = self.state();
            let Some(record) = state.owned.get(key).cloned() else {
                return Ok(None);
            };
            if state.releasing.contains_key(key) {
                return Ok(None);
            }
            Self::kill_lock_heartbeat(&mut state, key);
            state.next_release_id += 1;
            let release_id = state.next_release_id;
            state.releasing.insert(key.to_string(), release_id);
            (record, release_id)
        };

        self.schedule_purge(key, release_id);

        let outcome = self
            .store
            .conditional_delete(&self.config.table_name, key, &self.owner_id)
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Failed to delete lock");
                metrics::counter!("rowlease_locks_release_errors_total").increment(1);
                LockError::BackendError(format!("failed to delete lock \"{}\": {}", key, e))
            })?;

        let duration = start_time.elapsed();
        metrics::histogram!("rowlease_locks_release_duration_seconds").record(duration.as_secs_f64());
        match outcome {
            WriteOutcome::Applied(_) => {
                metrics::counter!("rowlease_locks_release_total", "result" => "deleted").increment(1);
                debug!(key = %key, version = record.version, duration_ms = duration.as_millis(), "Lock released");
            }
            WriteOutcome::ConditionFailed => {
                metrics::counter!("rowlease_locks_release_total", "result" => "not_owner").increment(1);
                warn!(key = %key, "Lock row was no longer ours at release, nothing deleted");
            }
        }
        Ok(Some(record))
    }

    /// Remove the owned entry once the release grace delay has passed,
    /// unless a fresh acquisition superseded the release meanwhile.
    fn schedule_purge(self: &Arc<Self>, key: &str, release_id: u64) {
        let grace = self.config.release_grace;
        if grace.is_zero() {
            self.purge_released(key, release_id);
            return;
        }
        let weak = Arc::downgrade(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.purge_released(&key, release_id);
            }
        });
    }

    fn purge_released(&self, key: &str, release_id: u64) {
        let mut state = self.state();
        if state.releasing.get(key) == Some(&release_id) {
            state.releasing.remove(key);
            state.owned.remove(key);
            debug!(key = %key, "Purged released lock");
        }
    }
}

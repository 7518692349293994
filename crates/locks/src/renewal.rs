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

//! Lock heartbeats.
//!
//! One background task per owned key re-runs the acquire path every half
//! lease. The task holds only a weak reference to the manager, so dropping
//! the manager ends every heartbeat.

use crate::manager::{AcquireOutcome, Inner};
use crate::LockRecord;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Outcome of a timer-driven renewal, published to
/// [`crate::LockManager::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalEvent {
    /// The lease was extended.
    Renewed(LockRecord),
    /// Another owner holds the row now; the key is no longer owned here.
    Lost { key: String, holder: LockRecord },
    /// The store failed. The lease is retried on the next tick.
    Failed { key: String, error: String },
}

impl RenewalEvent {
    pub fn key(&self) -> &str {
        match self {
            RenewalEvent::Renewed(record) => &record.key,
            RenewalEvent::Lost { key, .. } | RenewalEvent::Failed { key, .. } => key,
        }
    }
}

/// Registered heartbeat task for one key.
pub(crate) struct Heartbeat {
    id: u64,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

/// Spawn the heartbeat for `key`. The first renewal happens one full
/// `period` after the lock was acquired.
pub(crate) fn spawn_heartbeat(inner: Weak<Inner>, key: String, id: u64, period: Duration) -> Heartbeat {
    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !inner.heartbeat_is_current(&key, id) {
                debug!(key = %key, "Heartbeat superseded, exiting");
                break;
            }
            if !inner.is_actively_owned(&key) {
                inner.retire_heartbeat(&key, id);
                break;
            }

            match inner.set_lock(&key).await {
                Ok(AcquireOutcome::Acquired(record)) => {
                    metrics::counter!("rowlease_locks_renewal_total", "result" => "renewed").increment(1);
                    debug!(key = %key, version = record.version, "Lock renewed");
                    inner.emit(RenewalEvent::Renewed(record));
                }
                Ok(AcquireOutcome::Blocked(holder)) => {
                    metrics::counter!("rowlease_locks_renewal_total", "result" => "lost").increment(1);
                    warn!(key = %key, holder = %holder.owner_id, "Renewal found the lock held elsewhere");
                    inner.emit(RenewalEvent::Lost { key: key.clone(), holder });
                }
                Ok(AcquireOutcome::Cancelled) => {
                    debug!(key = %key, "Renewal cancelled by release");
                }
                Err(e) => {
                    metrics::counter!("rowlease_locks_renewal_total", "result" => "failed").increment(1);
                    error!(key = %key, error = %e, "Lock renewal failed, retrying next tick");
                    inner.emit(RenewalEvent::Failed {
                        key: key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    });

    Heartbeat { id, handle }
}

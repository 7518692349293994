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

//! Lock manager configuration.
//!
//! ## Environment Variables
//! - `ROWLEASE_LOCK_TABLE` - lock namespace / table name
//! - `ROWLEASE_LEASE_SECS` - lease duration in seconds (default: 10)
//! - `ROWLEASE_RELEASE_GRACE_MS` - delay before a released lock is purged
//!   from the owned list (default: 1000)

use std::env;
use std::time::Duration;

/// Default lease length in seconds.
pub const DEFAULT_LEASE_DURATION_SECS: u32 = 10;

/// Default delay between a release and purging the owned entry.
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(1);

/// Settings for one [`LockManager`](crate::LockManager) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockManagerConfig {
    /// Lock namespace (table/collection name). Required.
    pub table_name: String,
    /// Lease length written into every record.
    pub lease_duration_secs: u32,
    /// Grace delay before a released key leaves the owned list.
    pub release_grace: Duration,
    /// Diagnostic metadata written as `createdByHost`.
    pub host: String,
    /// Diagnostic metadata written as `createdByUser`.
    pub user: String,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            release_grace: DEFAULT_RELEASE_GRACE,
            host: default_host(),
            user: default_user(),
        }
    }
}

impl LockManagerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let table_name = env::var("ROWLEASE_LOCK_TABLE").unwrap_or_default();

        let lease_duration_secs = env::var("ROWLEASE_LEASE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs: &u32| *secs > 0)
            .unwrap_or(defaults.lease_duration_secs);

        let release_grace = env::var("ROWLEASE_RELEASE_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.release_grace);

        Self {
            table_name,
            lease_duration_secs,
            release_grace,
            ..defaults
        }
    }

    /// Lease length as a `Duration`.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_duration_secs))
    }

    /// Heartbeat period: renew at the lease's mid-life.
    pub fn renewal_period(&self) -> Duration {
        self.lease_duration() / 2
    }
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

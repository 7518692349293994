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

//! Lock Record: the persistent and in-memory state of one named lock.
//!
//! A record is a value: it is never mutated after it comes back from the
//! store, the store replaces it wholesale on every successful write.
//!
//! ## Row Schema
//! ```text
//! lkey                  String  (primary key)
//! createdByUUID         String  (owner id)
//! lockVersionNum        Number  (optimistic concurrency fence)
//! lockExpireSecs        Number  (lease duration)
//! createdByHost         String
//! createdByUser         String
//! createdAt             String  (RFC 3339, optional)
//! ttl                   Number  (epoch milliseconds, client computed)
//! ```
//!
//! `ttl` is computed from the writer's local clock and is advisory: the store
//! never enforces it. Correctness therefore assumes roughly synchronized
//! clocks between all participating processes.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// State of one named lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Resource being protected, the store's primary key.
    #[serde(rename = "lkey")]
    pub key: String,
    /// Manager instance that holds (or most recently held) the lease.
    #[serde(rename = "createdByUUID")]
    pub owner_id: String,
    /// Incremented by one on every successful write.
    #[serde(rename = "lockVersionNum")]
    pub version: u64,
    #[serde(rename = "lockExpireSecs")]
    pub lease_duration_secs: u32,
    #[serde(rename = "createdByHost", default)]
    pub created_by_host: String,
    #[serde(rename = "createdByUser", default)]
    pub created_by_user: String,
    /// When the current owner first acquired the lease. Renewals keep it.
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Absolute lease expiry, computed by the writer's clock.
    #[serde(rename = "ttl", with = "chrono::serde::ts_milliseconds")]
    pub ttl: DateTime<Utc>,
}

impl LockRecord {
    /// True once `now` is past the lease expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl < now
    }

    /// Time left on the lease, zero if it already lapsed.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.ttl - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Epoch milliseconds of the lease expiry, as stored.
    pub fn ttl_millis(&self) -> i64 {
        self.ttl.timestamp_millis()
    }
}

/// Generate a new owner id.
///
/// ULIDs sort by creation time, so ids from later manager instances compare
/// greater, which keeps store dumps readable.
pub fn new_owner_id() -> String {
    Ulid::new().to_string()
}

/// Convert an epoch-millisecond value into a UTC instant.
pub fn datetime_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Text form of `createdAt` as stores persist it (RFC 3339, millisecond UTC).
pub fn format_created_at(created_at: DateTime<Utc>) -> String {
    created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Best-effort conversion of a stored timestamp.
///
/// Accepts RFC 3339 text or an epoch-millisecond integer. Empty or
/// unparsable input yields `None` rather than an error, since `createdAt` is
/// descriptive only.
pub fn coerce_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<i64>().ok().and_then(datetime_from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ttl: DateTime<Utc>) -> LockRecord {
        LockRecord {
            key: "job-42".to_string(),
            owner_id: "owner-a".to_string(),
            version: 3,
            lease_duration_secs: 10,
            created_by_host: "host-a".to_string(),
            created_by_user: "alice".to_string(),
            created_at: None,
            ttl,
        }
    }

    #[test]
    fn test_expiry_and_remaining() {
        let now = Utc::now();
        let live = sample(now + chrono::Duration::seconds(5));
        assert!(!live.is_expired_at(now));
        assert!(live.remaining_at(now) > Duration::from_secs(4));

        let lapsed = sample(now - chrono::Duration::seconds(1));
        assert!(lapsed.is_expired_at(now));
        assert_eq!(lapsed.remaining_at(now), Duration::ZERO);
    }

    #[test]
    fn test_owner_ids_are_unique_and_time_ordered() {
        let first = new_owner_id();
        std::thread::sleep(Duration::from_millis(2));
        let second = new_owner_id();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_created_at_text_round_trips() {
        let created_at = datetime_from_millis(1_709_294_400_123).unwrap();
        let text = format_created_at(created_at);
        assert_eq!(text, "2024-03-01T12:00:00.123Z");
        assert_eq!(coerce_datetime(&text), Some(created_at));
    }

    #[test]
    fn test_coerce_datetime() {
        let parsed = coerce_datetime("2024-03-01T12:00:00Z").unwrap();
        assert_eq!(parsed.timestamp(), 1_709_294_400);

        let from_millis = coerce_datetime("1709294400000").unwrap();
        assert_eq!(from_millis, parsed);

        assert!(coerce_datetime("").is_none());
        assert!(coerce_datetime("   ").is_none());
        assert!(coerce_datetime("yesterday").is_none());
    }

    #[test]
    fn test_serde_uses_row_attribute_names() {
        let ttl = datetime_from_millis(1_709_294_400_123).unwrap();
        let json = serde_json::to_value(sample(ttl)).unwrap();
        assert_eq!(json["lkey"], "job-42");
        assert_eq!(json["createdByUUID"], "owner-a");
        assert_eq!(json["lockVersionNum"], 3);
        assert_eq!(json["ttl"], 1_709_294_400_123i64);

        let back: LockRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.ttl, ttl);
    }
}

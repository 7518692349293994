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

//! # RowLease Distributed Locks
//!
//! ## Purpose
//! Lease-based distributed locks on top of a single shared table. Any number
//! of processes contend for named locks; the holder keeps its lease alive
//! with a background heartbeat, and a crashed holder's lease lapses so
//! another process can take it over.
//!
//! ## Design Decisions
//! - **Version-fenced optimistic locking**: every write is a conditional
//!   update on the `(owner, version)` pair last observed, so concurrent
//!   writers never both succeed
//! - **Client-computed expiry**: each row carries an absolute expiry
//!   timestamp written by its owner; takeover is allowed once it has passed
//! - **Heartbeat mechanism**: an owned lock is re-written every half lease
//! - **Backend-agnostic**: the protocol only needs [`LockStore`]
//!
//! ## Backend Support
//!
//! - **InMemory**: HashMap-based (feature: `memory-backend`, default)
//! - **SQLite**: Persistent, single-node (feature: `sqlite-backend`)
//! - **DynamoDB**: Distributed, managed (feature: `ddb-backend`)
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust,no_run
//! use rowlease_locks::{memory::MemoryLockStore, AcquireOutcome, LockManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = LockManager::builder()
//!     .store(MemoryLockStore::new())
//!     .table_name("Lock-dev")
//!     .lease_duration_secs(10)
//!     .build()?;
//!
//! match manager.set_lock("job-42").await? {
//!     AcquireOutcome::Acquired(lock) => {
//!         println!("holding {} at version {}", lock.key, lock.version);
//!         manager.release_my_lock("job-42").await?;
//!     }
//!     AcquireOutcome::Blocked(holder) => {
//!         println!("held by {} until {}", holder.owner_id, holder.ttl);
//!     }
//!     AcquireOutcome::Cancelled => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod record;
pub mod renewal;
pub mod store;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "sqlite-backend")]
pub mod sql;

#[cfg(feature = "ddb-backend")]
pub mod ddb;

pub use config::LockManagerConfig;
pub use error::{LockError, LockResult};
pub use manager::{AcquireOutcome, LockManager, LockManagerBuilder};
pub use record::{coerce_datetime, datetime_from_millis, format_created_at, new_owner_id, LockRecord};
pub use renewal::RenewalEvent;
pub use store::{LockStore, UpdateCondition, WriteOutcome};

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

//! # RowLease Common
//!
//! Shared plumbing for the RowLease crates:
//! - [`aws_config`]: DynamoDB connection settings loaded from the environment
//! - [`tracing_setup`]: `tracing-subscriber` initialisation driven by `RUST_LOG`
//! - [`test_helpers`]: detection of local services for integration tests

pub mod aws_config;
pub mod test_helpers;
pub mod tracing_setup;

pub use aws_config::DynamoDBConfig;
pub use tracing_setup::{init_test_tracing, init_tracing};

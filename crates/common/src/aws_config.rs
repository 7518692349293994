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

//! AWS configuration helpers.
//!
//! ## Configuration Precedence
//! 1. Environment variables (highest priority)
//! 2. Defaults (lowest priority)
//!
//! ## Environment Variables
//! - `AWS_REGION` - AWS region (e.g., "us-east-1")
//! - `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` - picked up by the AWS SDK itself
//! - `DYNAMODB_ENDPOINT_URL` - DynamoDB endpoint URL (for DynamoDB Local)
//! - `ROWLEASE_DDB_TABLE_PREFIX` - table name prefix

use std::env;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_TABLE_PREFIX: &str = "rowlease-";

/// DynamoDB configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoDBConfig {
    /// AWS region
    pub region: String,
    /// Table name prefix (default: "rowlease-")
    pub table_prefix: String,
    /// Endpoint URL (for local testing)
    pub endpoint_url: Option<String>,
}

impl Default for DynamoDBConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            endpoint_url: None,
        }
    }
}

impl DynamoDBConfig {
    /// Load DynamoDB configuration from environment variables.
    ///
    /// ## Environment Variables
    /// - `AWS_REGION` / `ROWLEASE_AWS_REGION` - AWS region (default: "us-east-1")
    /// - `DYNAMODB_ENDPOINT_URL` / `ROWLEASE_DDB_ENDPOINT_URL` - Endpoint URL for local testing
    /// - `ROWLEASE_DDB_TABLE_PREFIX` - Table name prefix (default: "rowlease-")
    pub fn from_env() -> Self {
        let region = env::var("AWS_REGION")
            .or_else(|_| env::var("ROWLEASE_AWS_REGION"))
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let table_prefix = env::var("ROWLEASE_DDB_TABLE_PREFIX")
            .unwrap_or_else(|_| DEFAULT_TABLE_PREFIX.to_string());

        let endpoint_url = env::var("DYNAMODB_ENDPOINT_URL")
            .or_else(|_| env::var("ROWLEASE_DDB_ENDPOINT_URL"))
            .ok()
            .filter(|s| !s.is_empty());

        Self {
            region,
            table_prefix,
            endpoint_url,
        }
    }

    /// Get full table name for a component.
    ///
    /// ## Returns
    /// Full table name: `{table_prefix}{component_name}`
    pub fn table_name(&self, component_name: &str) -> String {
        format!("{}{}", self.table_prefix, component_name)
    }
}

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

//! Test helpers for integration tests with local services.
//!
//! Integration tests that need DynamoDB Local call
//! [`dynamodb_local_available`] first and skip when it is not reachable.

use std::time::Duration;
use tokio::time::timeout;

/// Get DynamoDB endpoint URL (from env or default)
pub fn get_dynamodb_endpoint() -> String {
    std::env::var("DYNAMODB_ENDPOINT_URL")
        .or_else(|_| std::env::var("ROWLEASE_DDB_ENDPOINT_URL"))
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "http://localhost:8000".to_string())
}

/// Check if DynamoDB Local is answering on the configured endpoint.
pub async fn dynamodb_local_available() -> bool {
    check_service_reachable(&get_dynamodb_endpoint(), Duration::from_secs(2)).await
}

/// A service counts as reachable if it answers HTTP at all. DynamoDB Local
/// rejects an unauthenticated `GET /` with 400, which still proves it is up.
async fn check_service_reachable(url: &str, timeout_duration: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout_duration).build() {
        Ok(c) => c,
        Err(_) => return false,
    };

    match timeout(timeout_duration, client.get(url).send()).await {
        Ok(Ok(resp)) => !resp.status().is_server_error(),
        _ => false,
    }
}

/// Setup AWS environment variables for local testing
pub fn setup_aws_local_env() {
    if std::env::var("AWS_REGION").is_err() {
        std::env::set_var("AWS_REGION", "us-east-1");
    }
    if std::env::var("AWS_ACCESS_KEY_ID").is_err() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "test");
    }
    if std::env::var("AWS_SECRET_ACCESS_KEY").is_err() {
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "test");
    }
    if std::env::var("DYNAMODB_ENDPOINT_URL").is_err() {
        std::env::set_var("DYNAMODB_ENDPOINT_URL", "http://localhost:8000");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_service_reports_false() {
        // Port 9 (discard) is essentially never serving HTTP.
        assert!(!check_service_reachable("http://127.0.0.1:9", Duration::from_millis(200)).await);
    }
}

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

//! Error types for distributed lock operations.
//!
//! Condition failures are not errors: the store reports them through
//! [`WriteOutcome::ConditionFailed`](crate::store::WriteOutcome) and the
//! manager turns them into a blocking record for the caller.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Invalid lock key
    #[error("Invalid lock key: {0}")]
    InvalidKey(String),

    /// Backend error (database, network, throttling, permissions)
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error (malformed row in the store)
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::BackendError(format!("SQL error: {}", err))
    }
}

#[cfg(feature = "ddb-backend")]
impl From<aws_sdk_dynamodb::Error> for LockError {
    fn from(err: aws_sdk_dynamodb::Error) -> Self {
        LockError::BackendError(format!("DynamoDB error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LockError::ConfigError("table name is required".to_string());
        assert_eq!(err.to_string(), "Configuration error: table name is required");

        let err = LockError::InvalidKey("".to_string());
        assert_eq!(err.to_string(), "Invalid lock key: ");
    }

    #[cfg(feature = "ddb-backend")]
    #[test]
    fn test_from_dynamodb_error() {
        use aws_sdk_dynamodb::types::error::ResourceNotFoundException;

        let sdk_err = aws_sdk_dynamodb::Error::ResourceNotFoundException(
            ResourceNotFoundException::builder().message("no such table").build(),
        );
        let err: LockError = sdk_err.into();
        assert!(matches!(err, LockError::BackendError(ref msg) if msg.starts_with("DynamoDB error")));
    }
}

// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Failures reported by a backing store (lease store or coordination service).
///
/// Stores must keep "the thing is gone" (`NotFound`, `SessionExpired`) apart from
/// "the store cannot be reached" (`Connection`, `Protocol`): the first is retried
/// transparently by the lock layer, the second fails the current call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached
    #[error("connection failure: {0}")]
    Connection(String),

    /// The session owning ephemeral state has ended
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The addressed node or key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The addressed node already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed request or response
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// True when the failure means the distributed handle itself disappeared
    pub fn is_vanished(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::SessionExpired(_))
    }
}

/// Lock operation related error types
#[derive(Error, Debug)]
pub enum LockError {
    /// The distributed handle backing an acquisition disappeared (node deleted, session lost)
    #[error("Lock handle vanished for resource '{resource}'")]
    HandleVanished { resource: String },

    /// Backend connectivity or protocol failure
    #[error("Backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Key rejected by the active backend
    #[error("Invalid lock key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LockError {
    /// Create vanished handle error
    pub fn handle_vanished(resource: impl Into<String>) -> Self {
        Self::HandleVanished {
            resource: resource.into(),
        }
    }

    /// Create backend error
    pub fn backend(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Create invalid key error
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Wrap a store failure observed while working on `resource`.
    ///
    /// Vanished handles become [`LockError::HandleVanished`], everything else is a backend error.
    pub fn from_store(resource: &str, err: StoreError) -> Self {
        if err.is_vanished() {
            Self::handle_vanished(resource)
        } else {
            Self::backend(format!("store operation failed for '{resource}'"), err)
        }
    }

    /// Check if it is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HandleVanished { .. })
    }

    /// Check if it is a fatal error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidKey { .. } | Self::Configuration { .. })
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

/// Store operation Result type
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Convert from serde_json::Error
impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("invalid lock configuration: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let vanished = LockError::handle_vanished("orders");
        assert!(matches!(vanished, LockError::HandleVanished { .. }));

        let config_err = LockError::configuration("bad separator");
        assert!(matches!(config_err, LockError::Configuration { .. }));

        let key_err = LockError::invalid_key("a_lock_b", "contains separator");
        assert_eq!(key_err.to_string(), "Invalid lock key 'a_lock_b': contains separator");
    }

    #[test]
    fn test_error_retryable() {
        assert!(LockError::handle_vanished("k").is_retryable());

        let backend_err = LockError::backend("connection failed", StoreError::Connection("refused".into()));
        assert!(!backend_err.is_retryable());
        assert!(!backend_err.is_fatal());
    }

    #[test]
    fn test_error_fatal() {
        assert!(LockError::configuration("x").is_fatal());
        assert!(LockError::invalid_key("k", "r").is_fatal());
        assert!(!LockError::internal("x").is_fatal());
    }

    #[test]
    fn test_store_error_mapping() {
        let err = LockError::from_store("jobs", StoreError::SessionExpired("session 7".into()));
        assert!(matches!(err, LockError::HandleVanished { ref resource } if resource == "jobs"));

        let err = LockError::from_store("jobs", StoreError::Connection("down".into()));
        assert!(matches!(err, LockError::Backend { .. }));

        let err = LockError::from_store("jobs", StoreError::NotFound("/locks/jobs".into()));
        assert!(err.is_retryable());

        let err = LockError::from_store("jobs", StoreError::Protocol("garbled".into()));
        assert!(matches!(err, LockError::Backend { .. }));
    }
}

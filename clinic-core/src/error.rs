//! Error types for clinic data-access operations

use std::time::Duration;
use thiserror::Error;

/// Authentication errors raised before a repository call reaches storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication required for {operation} on {table}")]
    NotAuthenticated { table: String, operation: String },

    #[error("Session expired for user {user_id}")]
    SessionExpired { user_id: String },
}

/// Anti-forgery token errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF token missing for {operation} on {table}")]
    Missing { table: String, operation: String },

    #[error("CSRF token rejected for {operation} on {table}")]
    Invalid { table: String, operation: String },
}

/// Failures of the terminal persistence call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found in {table} with id {id}")]
    NotFound { table: String, id: String },

    #[error("{operation} on {table} failed: {reason}")]
    QueryFailed {
        table: String,
        operation: String,
        reason: String,
    },

    #[error("Result decoding failed for {table}: {reason}")]
    Decode { table: String, reason: String },

    #[error("Data source unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Persistent mirror errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MirrorError {
    #[error("Persistent mirror quota exceeded writing {key} ({bytes} bytes)")]
    QuotaExceeded { key: String, bytes: usize },

    #[error("Persistent mirror backend error: {reason}")]
    Backend { reason: String },
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache key: {key:?}")]
    InvalidKey { key: String },

    #[error("Mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClinicError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("CSRF error: {0}")]
    Csrf(#[from] CsrfError),

    #[error("Rate limit exceeded for {user_id}, retry after {retry_after:?}")]
    RateLimited {
        user_id: String,
        retry_after: Duration,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{label} timed out after {after:?}")]
    Timeout { label: String, after: Duration },
}

impl ClinicError {
    /// Whether this error belongs to the primary path and must reach the caller.
    ///
    /// Cache and timeout errors only ever come from best-effort side paths.
    pub fn is_primary_path(&self) -> bool {
        !matches!(self, ClinicError::Cache(_) | ClinicError::Timeout { .. })
    }

    /// Retry hint carried by rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClinicError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<MirrorError> for ClinicError {
    fn from(e: MirrorError) -> Self {
        ClinicError::Cache(CacheError::Mirror(e))
    }
}

/// Result type alias for pipeline operations.
pub type ClinicResult<T> = Result<T, ClinicError>;

/// Result type alias for cache store operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display_not_authenticated() {
        let err = AuthError::NotAuthenticated {
            table: "patients".to_string(),
            operation: "findAll".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Authentication required"));
        assert!(msg.contains("patients"));
        assert!(msg.contains("findAll"));
    }

    #[test]
    fn test_rate_limited_display_and_hint() {
        let err = ClinicError::RateLimited {
            user_id: "u-1".to_string(),
            retry_after: Duration::from_secs(12),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Rate limit exceeded"));
        assert!(msg.contains("u-1"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_mirror_error_display_quota() {
        let err = MirrorError::QuotaExceeded {
            key: "clinic-cache:patients:findAll:{}".to_string(),
            bytes: 2048,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("quota exceeded"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_clinic_error_from_variants() {
        let auth = ClinicError::from(AuthError::SessionExpired {
            user_id: "u".to_string(),
        });
        assert!(matches!(auth, ClinicError::Auth(_)));

        let csrf = ClinicError::from(CsrfError::Missing {
            table: "clinics".to_string(),
            operation: "create".to_string(),
        });
        assert!(matches!(csrf, ClinicError::Csrf(_)));

        let storage = ClinicError::from(StorageError::Unavailable {
            reason: "down".to_string(),
        });
        assert!(matches!(storage, ClinicError::Storage(_)));

        let mirror = ClinicError::from(MirrorError::Backend {
            reason: "io".to_string(),
        });
        assert!(matches!(mirror, ClinicError::Cache(CacheError::Mirror(_))));

        let config = ClinicError::from(ConfigError::MissingRequired {
            field: "default_ttl".to_string(),
        });
        assert!(matches!(config, ClinicError::Config(_)));
    }

    #[test]
    fn test_primary_path_classification() {
        assert!(ClinicError::from(AuthError::NotAuthenticated {
            table: "t".into(),
            operation: "o".into(),
        })
        .is_primary_path());
        assert!(ClinicError::RateLimited {
            user_id: "u".into(),
            retry_after: Duration::from_secs(1),
        }
        .is_primary_path());
        assert!(!ClinicError::from(CacheError::Unavailable {
            reason: "x".into()
        })
        .is_primary_path());
        assert!(!ClinicError::Timeout {
            label: "cache write-back".into(),
            after: Duration::from_secs(2),
        }
        .is_primary_path());
    }
}

//! Error types for fundcache operations

use thiserror::Error;

/// Key codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Invalid key format '{key}': {reason}")]
    InvalidKeyFormat { key: String, reason: String },
}

/// Storage tier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Read failed for key {key}: {reason}")]
    Read { key: String, reason: String },

    #[error("Write failed for key {key}: {reason}")]
    Write { key: String, reason: String },

    #[error("Delete failed for key {key}: {reason}")]
    Delete { key: String, reason: String },

    #[error("Encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("Decoding failed: {reason}")]
    Decoding { reason: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Migration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Migration of {old_key} -> {new_key} failed: {reason}")]
    MigrationKeyError {
        old_key: String,
        new_key: String,
        reason: String,
    },

    #[error("Backup failed: {reason}")]
    BackupFailure { reason: String },

    #[error("Rollback partially failed: {restored} restored, {failed} failed")]
    RollbackPartialFailure { restored: usize, failed: usize },

    #[error("{count} blocking conflicts detected")]
    ConflictDetected { count: usize },

    #[error("Operation {operation} not allowed while migration is {status}")]
    InvalidState { operation: String, status: String },

    #[error("Backup not found: {id}")]
    BackupNotFound { id: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all fundcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for fundcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Storage(StorageError::Decoding {
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

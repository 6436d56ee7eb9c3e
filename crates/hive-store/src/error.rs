//! Error types for record storage.

use hive_proto::ErrorKind;
use thiserror::Error;

/// Errors returned by a [`RecordStore`](crate::RecordStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record under the key.
    #[error("record not found: {key}")]
    NotFound {
        /// Missing key.
        key: String,
    },

    /// Insert found an existing record.
    #[error("record already exists: {key}")]
    AlreadyExists {
        /// Existing key.
        key: String,
    },

    /// Conditional write lost a race.
    #[error("version mismatch on {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        /// Contended key.
        key: String,
        /// Version the writer read.
        expected: u64,
        /// Version in the store.
        actual: u64,
    },
}

impl StoreError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::UnknownEntity,
            Self::AlreadyExists { .. } | Self::VersionMismatch { .. } => ErrorKind::Conflict,
        }
    }
}

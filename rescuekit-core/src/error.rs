//! Error types for the backup vault resolver.
//!
//! One taxonomy covers the whole core: structural failures of mandatory
//! containers (index schema, keybag header, property-list trailer) are
//! unrecoverable and surfaced immediately; per-entry failures are isolated
//! so that processing of other entries continues.

use thiserror::Error;

use crate::manifest::{FileId, ProtectionClass};

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors that can occur while resolving a backup vault.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VaultError {
    /// The manifest index store is missing, unreadable, or has an
    /// unrecognized schema.
    #[error("corrupt manifest index: {context}")]
    CorruptIndex {
        /// Description of what failed during load.
        context: String,
    },

    /// No manifest entry matches the requested identity.
    #[error("no manifest entry for {domain}/{relative_path}")]
    NotFound {
        /// Backup domain that was searched.
        domain: String,
        /// Relative path that was searched.
        relative_path: String,
    },

    /// The keybag container is missing required fields or structurally
    /// invalid.
    #[error("malformed keybag: {context}")]
    MalformedKeybag {
        /// Description of the structural problem.
        context: String,
    },

    /// The supplied backup password failed keybag validation.
    #[error("backup password is incorrect")]
    WrongPassword,

    /// The addressed blob is absent from the backup store.
    #[error("blob {file_id} missing from backup store")]
    MissingBlob {
        /// Content identity of the missing blob.
        file_id: FileId,
    },

    /// The entry is protected but no password was supplied for the session.
    #[error("entry {file_id} is protected and no backup password was supplied")]
    ProtectedNoPassword {
        /// Content identity of the protected entry.
        file_id: FileId,
    },

    /// The class key needed for this entry was not recoverable.
    #[error("class key for {class:?} is unavailable (entry {file_id})")]
    UnavailableClassKey {
        /// Protection class whose key is missing.
        class: ProtectionClass,
        /// Content identity of the affected entry.
        file_id: FileId,
    },

    /// Per-file key unwrap or content decryption failed.
    #[error("decryption failed for {file_id}: {context}")]
    DecryptionFailed {
        /// Content identity of the affected entry.
        file_id: FileId,
        /// Description of the failing step.
        context: String,
    },

    /// Decrypted content length does not match the manifest entry size.
    /// Signals either a wrong key or a corrupted blob.
    #[error("truncated data for {file_id}: expected {expected} bytes, got {actual}")]
    TruncatedData {
        /// Content identity of the affected entry.
        file_id: FileId,
        /// Size recorded in the manifest metadata.
        expected: u64,
        /// Size actually produced by decryption.
        actual: u64,
    },

    /// The buffer does not start with the binary property-list magic.
    /// Callers may fall back to a plain-text property-list parser.
    #[error("buffer is not binary property-list data")]
    NotBinaryFormat,

    /// The property-list trailer, offset table, or a mandatory object is
    /// structurally invalid.
    #[error("malformed property-list object: {context}")]
    MalformedObject {
        /// Description of the structural problem.
        context: String,
    },

    /// An extracted record store could not be read with any supported
    /// schema.
    #[error("unsupported record store: {context}")]
    UnsupportedRecordStore {
        /// Description of the schema problem.
        context: String,
    },

    /// An I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl VaultError {
    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a corrupt-index error.
    pub fn corrupt_index<S: Into<String>>(context: S) -> Self {
        Self::CorruptIndex {
            context: context.into(),
        }
    }

    /// Creates a malformed-keybag error.
    pub fn malformed_keybag<S: Into<String>>(context: S) -> Self {
        Self::MalformedKeybag {
            context: context.into(),
        }
    }

    /// Creates a malformed-object error.
    pub fn malformed_object<S: Into<String>>(context: S) -> Self {
        Self::MalformedObject {
            context: context.into(),
        }
    }

    /// Creates an unsupported-record-store error.
    pub fn record_store<S: Into<String>>(context: S) -> Self {
        Self::UnsupportedRecordStore {
            context: context.into(),
        }
    }

    /// Creates a decryption-failed error for an entry.
    pub fn decryption<S: Into<String>>(file_id: FileId, context: S) -> Self {
        Self::DecryptionFailed {
            file_id,
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::NotFound {
            domain: "HomeDomain".to_string(),
            relative_path: "Library/sms.db".to_string(),
        };
        assert_eq!(format!("{err}"), "no manifest entry for HomeDomain/Library/sms.db");

        let err = VaultError::WrongPassword;
        assert!(format!("{err}").contains("incorrect"));

        let err = VaultError::corrupt_index("no Files table");
        assert!(format!("{err}").contains("no Files table"));
    }
}

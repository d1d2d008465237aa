//! File accessor: locating and decrypting addressed blobs.
//!
//! Blobs live under the backup root at a path derived deterministically
//! from the content identity (first two hex characters as a subdirectory,
//! full hash as the filename). Protected blobs are encrypted with a
//! per-file AES-256 key, itself wrapped (RFC 3394) under the entry's class
//! key; content encryption is AES-256-CBC with a zero IV per the backup
//! file convention, PKCS#7 padded.
//!
//! Every call is all-or-nothing: partially decrypted bytes are never
//! returned, and decrypted content is not cached beyond the call
//! (protected-content minimization).

use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes::Aes256;
use tracing::debug;

use crate::error::{VaultError, VaultResult};
use crate::keybag::UnlockedKeyBag;
use crate::manifest::{EntryMetadata, FileId, ManifestEntry, ProtectionClass};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Expected length of an unwrapped per-file AES-256 key.
const FILE_KEY_LEN: usize = 32;

/// Reads entry content from a backup's content-addressed blob store.
#[derive(Debug, Clone)]
pub struct FileAccessor {
    root: PathBuf,
}

impl FileAccessor {
    /// Creates an accessor over the backup directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the on-disk path of the blob addressed by `file_id`.
    #[must_use]
    pub fn blob_path(&self, file_id: &FileId) -> PathBuf {
        self.root.join(file_id.blob_relative_path())
    }

    /// Reads (and if protected, decrypts) the content of a manifest entry.
    ///
    /// Entries of protection class `NoProtection` never require `keys`.
    ///
    /// # Errors
    ///
    /// [`VaultError::MissingBlob`] when the addressed blob is absent,
    /// [`VaultError::ProtectedNoPassword`] when the entry is protected and
    /// `keys` is `None`, [`VaultError::UnavailableClassKey`] when the class
    /// key (or the per-file key record) is unavailable,
    /// [`VaultError::DecryptionFailed`] on unwrap or cipher failure, and
    /// [`VaultError::TruncatedData`] when the decrypted length does not
    /// match the manifest size.
    pub fn read_entry(
        &self,
        entry: &ManifestEntry,
        keys: Option<&UnlockedKeyBag>,
    ) -> VaultResult<Vec<u8>> {
        let metadata = if entry.metadata_blob.is_empty() {
            None
        } else {
            Some(entry.metadata()?)
        };
        self.read_with(entry, metadata.as_ref(), keys)
    }

    fn read_with(
        &self,
        entry: &ManifestEntry,
        metadata: Option<&EntryMetadata>,
        keys: Option<&UnlockedKeyBag>,
    ) -> VaultResult<Vec<u8>> {
        let blob = self.read_blob(&entry.file_id)?;

        let Some(metadata) = metadata else {
            // No metadata recorded; the blob is stored as-is.
            return Ok(blob);
        };
        if metadata.protection_class == ProtectionClass::NoProtection {
            return Ok(blob);
        }

        let Some(keys) = keys else {
            return Err(VaultError::ProtectedNoPassword {
                file_id: entry.file_id,
            });
        };
        let Some(class_key) = keys.class_key(metadata.protection_class) else {
            return Err(VaultError::UnavailableClassKey {
                class: metadata.protection_class,
                file_id: entry.file_id,
            });
        };
        // Absence of a per-file key record is treated like a missing class
        // key: unavailable, not malformed.
        let Some(wrapped_file_key) = metadata.wrapped_file_key.as_deref() else {
            return Err(VaultError::UnavailableClassKey {
                class: metadata.protection_class,
                file_id: entry.file_id,
            });
        };

        let file_key = class_key.unwrap_key(wrapped_file_key).ok_or_else(|| {
            VaultError::decryption(entry.file_id, "per-file key failed its unwrap check")
        })?;
        if file_key.len() != FILE_KEY_LEN {
            return Err(VaultError::decryption(
                entry.file_id,
                format!("per-file key has unexpected length {}", file_key.len()),
            ));
        }

        let plaintext = decrypt_cbc(&file_key, &blob)
            .map_err(|context| VaultError::decryption(entry.file_id, context))?;

        let actual = plaintext.len() as u64;
        if actual != metadata.size {
            return Err(VaultError::TruncatedData {
                file_id: entry.file_id,
                expected: metadata.size,
                actual,
            });
        }

        debug!(file_id = %entry.file_id, bytes = plaintext.len(), "entry decrypted");
        Ok(plaintext)
    }

    /// Reads the raw addressed blob.
    fn read_blob(&self, file_id: &FileId) -> VaultResult<Vec<u8>> {
        let path = self.blob_path(file_id);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::MissingBlob { file_id: *file_id }
            } else {
                VaultError::io(format!("reading blob {}", path.display()), e)
            }
        })
    }

    /// Returns the backup root this accessor reads from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// AES-256-CBC decryption with a zero IV and PKCS#7 padding removal.
fn decrypt_cbc(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, String> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err("ciphertext is not block aligned".to_string());
    }
    let iv = [0u8; 16];
    let cipher = Aes256CbcDec::new_from_slices(key, &iv)
        .map_err(|_| "invalid key length".to_string())?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| "padding check failed".to_string())
}

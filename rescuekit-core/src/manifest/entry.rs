//! Manifest entry types: content identity, protection class, per-entry
//! metadata.

use std::fmt;

use sha1::{Digest, Sha1};

/// A 20-byte content identity.
///
/// The file ID is the SHA-1 hash of `"<domain>-<relativePath>"` and doubles
/// as the blob's storage filename inside the backup directory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub [u8; 20]);

impl FileId {
    /// Creates a `FileId` from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derives the content identity for a domain and relative path.
    #[must_use]
    pub fn derive(domain: &str, relative_path: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(domain.as_bytes());
        hasher.update(b"-");
        hasher.update(relative_path.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Returns the raw bytes of the file ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Renders the file ID as a 40-character lowercase hex string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a `FileId` from a hex string.
    ///
    /// # Errors
    /// Returns an error if the string is not valid hex or not exactly
    /// 20 bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Returns the blob's path relative to the backup root: the first two
    /// hex characters as a subdirectory, the full hash as the filename.
    #[must_use]
    pub fn blob_relative_path(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}", &hex[..2], hex)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.to_hex())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for FileId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Policy describing under what device-lock state a file's key is
/// obtainable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionClass {
    /// The file is stored unencrypted in the backup.
    NoProtection,
    /// Key only obtainable while the device is unlocked.
    Complete,
    /// Key obtainable while the file is held open.
    CompleteUnlessOpen,
    /// Key obtainable after first unlock since boot.
    OpenOnly,
    /// A class this core does not interpret (keychain classes and future
    /// additions). Carries the raw class number.
    Other(u32),
}

impl ProtectionClass {
    /// Maps a raw class number from manifest metadata or a keybag entry.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::NoProtection,
            1 => Self::Complete,
            2 => Self::CompleteUnlessOpen,
            3 => Self::OpenOnly,
            other => Self::Other(other),
        }
    }

    /// Returns the raw class number.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::NoProtection => 0,
            Self::Complete => 1,
            Self::CompleteUnlessOpen => 2,
            Self::OpenOnly => 3,
            Self::Other(raw) => raw,
        }
    }

    /// Returns `true` for the file protection classes (as opposed to
    /// keychain classes), which are what manifest-indexed files use.
    #[must_use]
    pub const fn is_file_class(self) -> bool {
        matches!(self.raw(), 1..=4)
    }
}

// Flag bits of the manifest `flags` column.
const FLAG_FILE: u8 = 1;
const FLAG_DIR: u8 = 2;
const FLAG_SYMLINK: u8 = 4;

/// One row of the manifest index.
///
/// Created once when the index is loaded and immutable afterward. The
/// serialized metadata blob is decoded on demand via
/// [`ManifestEntry::metadata`], never eagerly.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Content identity, unique across the backup.
    pub file_id: FileId,
    /// Backup domain (e.g. `HomeDomain`).
    pub domain: String,
    /// Path relative to the domain root.
    pub relative_path: String,
    /// Raw entry-kind flags.
    pub flags: u8,
    /// Serialized keyed-archive metadata (size, mode, protection class,
    /// wrapped per-file key).
    pub metadata_blob: Vec<u8>,
}

impl ManifestEntry {
    /// Returns `true` if this entry is a regular file.
    #[must_use]
    pub const fn is_file(&self) -> bool {
        self.flags & FLAG_FILE != 0
    }

    /// Returns `true` if this entry is a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.flags & FLAG_DIR != 0
    }

    /// Returns `true` if this entry is a symlink.
    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        self.flags & FLAG_SYMLINK != 0
    }

    /// Decodes the entry's metadata blob.
    ///
    /// # Errors
    ///
    /// Propagates decode failures from the binary property-list layer; an
    /// entry without a metadata blob yields
    /// [`VaultError::NotBinaryFormat`](crate::VaultError::NotBinaryFormat).
    pub fn metadata(&self) -> crate::VaultResult<super::EntryMetadata> {
        super::EntryMetadata::from_blob(&self.metadata_blob)
    }
}

//! Backup session facade.
//!
//! [`BackupVault`] ties the layers together for one backup directory: the
//! manifest index, the keybag from `Manifest.plist`, and the blob
//! accessor. Key material is derived lazily on [`BackupVault::unlock`] and
//! discarded on [`BackupVault::lock`] or drop.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use tracing::{debug, info};

use crate::access::FileAccessor;
use crate::bplist::{self, DecodedValue};
use crate::error::{VaultError, VaultResult};
use crate::keybag::{KeyBag, UnlockedKeyBag};
use crate::manifest::{ManifestEntry, ManifestIndex};

/// Filename of the manifest index inside a backup directory.
const MANIFEST_DB: &str = "Manifest.db";
/// Filename of the backup descriptor carrying the keybag.
const MANIFEST_PLIST: &str = "Manifest.plist";

/// One open backup.
#[derive(Debug)]
pub struct BackupVault {
    root: PathBuf,
    manifest: ManifestIndex,
    accessor: FileAccessor,
    keybag: Option<KeyBag>,
    is_encrypted: bool,
    unlocked: Option<UnlockedKeyBag>,
}

impl BackupVault {
    /// Opens the backup directory at `root`: loads the manifest index and,
    /// when the descriptor carries one, parses the keybag. No key material
    /// is derived here.
    ///
    /// # Errors
    ///
    /// [`VaultError::CorruptIndex`] if the index store is missing or
    /// unreadable, [`VaultError::MalformedKeybag`] if a keybag is present
    /// but structurally invalid.
    pub fn open(root: impl Into<PathBuf>) -> VaultResult<Self> {
        let root = root.into();
        let manifest = ManifestIndex::load(&root.join(MANIFEST_DB))?;

        let (keybag, is_encrypted) = match read_descriptor(&root)? {
            Some(descriptor) => (descriptor.keybag, descriptor.is_encrypted),
            None => (None, false),
        };

        info!(
            root = %root.display(),
            entries = manifest.len(),
            encrypted = is_encrypted,
            "backup opened"
        );
        Ok(Self {
            accessor: FileAccessor::new(&root),
            root,
            manifest,
            keybag,
            is_encrypted,
            unlocked: None,
        })
    }

    /// Returns the backup directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the manifest index.
    #[must_use]
    pub const fn manifest(&self) -> &ManifestIndex {
        &self.manifest
    }

    /// Returns `true` when the backup descriptor declares encryption.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Returns `true` once class keys have been derived for this session.
    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        self.unlocked.is_some()
    }

    /// Derives and unwraps the class keys from the backup password.
    ///
    /// Idempotent per session: a second call with the keys already derived
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// [`VaultError::MalformedKeybag`] if the backup carries no keybag,
    /// [`VaultError::WrongPassword`] if validation fails.
    pub fn unlock(&mut self, password: &SecretString) -> VaultResult<()> {
        if self.unlocked.is_some() {
            return Ok(());
        }
        let keybag = self
            .keybag
            .as_ref()
            .ok_or_else(|| VaultError::malformed_keybag("backup carries no keybag"))?;
        self.unlocked = Some(keybag.unlock(password)?);
        debug!("vault unlocked");
        Ok(())
    }

    /// Discards the session's derived key material. Unprotected entries
    /// remain readable.
    pub fn lock(&mut self) {
        // ClassKey zeroes itself on drop.
        self.unlocked = None;
        debug!("vault locked");
    }

    /// Reads (and if protected, decrypts) one entry's content.
    ///
    /// # Errors
    ///
    /// See [`FileAccessor::read_entry`].
    pub fn read_entry(&self, entry: &ManifestEntry) -> VaultResult<Vec<u8>> {
        self.accessor.read_entry(entry, self.unlocked.as_ref())
    }

    /// Looks up `(domain, relative_path)` and reads the entry's content.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] for an unknown path, plus the
    /// [`Self::read_entry`] failures.
    pub fn read_path(&self, domain: &str, relative_path: &str) -> VaultResult<Vec<u8>> {
        let entry = self.manifest.lookup(domain, relative_path)?;
        self.read_entry(entry)
    }

    /// Extracts one entry's content to `dest`, creating parent directories.
    ///
    /// # Errors
    ///
    /// The [`Self::read_entry`] failures, plus [`VaultError::Io`] on write.
    pub fn extract_entry(&self, entry: &ManifestEntry, dest: &Path) -> VaultResult<()> {
        let bytes = self.read_entry(entry)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VaultError::io(format!("creating {}", parent.display()), e))?;
        }
        std::fs::write(dest, bytes)
            .map_err(|e| VaultError::io(format!("writing {}", dest.display()), e))?;
        debug!(file_id = %entry.file_id, dest = %dest.display(), "entry extracted");
        Ok(())
    }
}

struct Descriptor {
    keybag: Option<KeyBag>,
    is_encrypted: bool,
}

/// Reads `Manifest.plist` when present. The descriptor is a plain binary
/// property list whose root dictionary carries the serialized keybag under
/// `BackupKeyBag` and the `IsEncrypted` flag.
fn read_descriptor(root: &Path) -> VaultResult<Option<Descriptor>> {
    let path = root.join(MANIFEST_PLIST);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VaultError::io(format!("reading {}", path.display()), e)),
    };

    let graph = bplist::decode(&bytes)?;
    let root_value = graph.root();

    let keybag = graph
        .dict_get(root_value, "BackupKeyBag")
        .and_then(DecodedValue::as_bytes)
        .map(KeyBag::parse)
        .transpose()?;

    let is_encrypted = graph
        .dict_get(root_value, "IsEncrypted")
        .map_or(keybag.is_some(), |v| {
            matches!(v, DecodedValue::Bool(true)) || v.as_i64() == Some(1)
        });

    Ok(Some(Descriptor {
        keybag,
        is_encrypted,
    }))
}

//! Manifest index: the path → content-identity mapping of a backup.
//!
//! `Manifest.db` is a SQLite database whose `Files` table maps
//! `(domain, relativePath)` pairs to 40-character hex file IDs plus a
//! serialized metadata blob per entry. The index is loaded once per backup
//! session into an immutable in-memory structure; all lookups afterwards
//! are pure reads, safe to share across threads.

mod entry;
mod metadata;

pub use entry::{FileId, ManifestEntry, ProtectionClass};
pub use metadata::EntryMetadata;

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

/// Read-only lookup structure over the manifest rows.
#[derive(Debug)]
pub struct ManifestIndex {
    entries: Vec<ManifestEntry>,
    by_file_id: HashMap<FileId, usize>,
    by_path: HashMap<(String, String), usize>,
}

impl ManifestIndex {
    /// Loads the index database at `path`.
    ///
    /// Validates that the store exposes the expected `Files` schema
    /// (`fileID`, `domain`, `relativePath`, `flags`, `file`).
    ///
    /// # Errors
    ///
    /// [`VaultError::CorruptIndex`] if the store cannot be opened or the
    /// schema is absent.
    pub fn load(path: &Path) -> VaultResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| VaultError::corrupt_index(format!("cannot open index store: {e}")))?;

        let mut stmt = conn
            .prepare("SELECT fileID, domain, relativePath, flags, file FROM Files")
            .map_err(|e| {
                VaultError::corrupt_index(format!("index schema missing Files table: {e}"))
            })?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                ))
            })
            .map_err(|e| VaultError::corrupt_index(format!("index query failed: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (file_id_hex, domain, relative_path, flags, metadata_blob) =
                row.map_err(|e| VaultError::corrupt_index(format!("index row unreadable: {e}")))?;
            let Ok(file_id) = FileId::from_hex(&file_id_hex) else {
                warn!(file_id = %file_id_hex, "skipping row with malformed fileID");
                continue;
            };
            entries.push(ManifestEntry {
                file_id,
                domain,
                relative_path,
                flags: u8::try_from(flags & 0xFF).unwrap_or(0),
                metadata_blob: metadata_blob.unwrap_or_default(),
            });
        }

        let mut by_file_id = HashMap::with_capacity(entries.len());
        let mut by_path = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            by_file_id.insert(entry.file_id, index);
            by_path.insert(
                (entry.domain.clone(), entry.relative_path.clone()),
                index,
            );
        }

        debug!(entries = entries.len(), "manifest index loaded");
        Ok(Self {
            entries,
            by_file_id,
            by_path,
        })
    }

    /// Looks up an entry by `(domain, relativePath)`.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if no entry matches.
    pub fn lookup(&self, domain: &str, relative_path: &str) -> VaultResult<&ManifestEntry> {
        self.by_path
            .get(&(domain.to_string(), relative_path.to_string()))
            .map(|index| &self.entries[*index])
            .ok_or_else(|| VaultError::NotFound {
                domain: domain.to_string(),
                relative_path: relative_path.to_string(),
            })
    }

    /// Resolves an entry by its content identity.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotFound`] if no entry matches.
    pub fn resolve_file_id(&self, file_id: &FileId) -> VaultResult<&ManifestEntry> {
        self.by_file_id
            .get(file_id)
            .map(|index| &self.entries[*index])
            .ok_or_else(|| VaultError::NotFound {
                domain: String::new(),
                relative_path: file_id.to_hex(),
            })
    }

    /// Iterates entries whose domain starts with `domain_prefix`.
    ///
    /// The iterator is finite and restartable: each call returns a fresh
    /// iterator borrowed from the immutable index.
    pub fn entries_under_domain<'a>(
        &'a self,
        domain_prefix: &'a str,
    ) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.domain.starts_with(domain_prefix))
    }

    /// Iterates all entries.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    /// Number of entries in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Core library for recovering personal data from device-backup archives.
//!
//! A backup directory is a content-addressed blob store described by a
//! manifest index and, for encrypted backups, a keybag of wrapped class
//! keys. The layers here mirror that structure:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  vault     — per-backup session facade       │
//! ├──────────┬──────────┬────────────────────────┤
//! │ manifest │  keybag  │  access                │
//! │  (index) │  (keys)  │  (blob read + decrypt) │
//! ├──────────┴──────────┴────────────────────────┤
//! │  bplist    — binary property-list decoding   │
//! ├──────────────────────────────────────────────┤
//! │  records   — Contact/Message/Note/Calendar   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Typical use goes through [`BackupVault`]: open a backup directory,
//! unlock it with the backup password when it is encrypted, then read or
//! extract entries and normalize the extracted stores with [`records`].

pub mod access;
pub mod bplist;
mod error;
pub mod keybag;
pub mod manifest;
pub mod records;
mod vault;

pub use access::FileAccessor;
pub use error::{VaultError, VaultResult};
pub use keybag::{KeyBag, UnlockedKeyBag};
pub use manifest::{EntryMetadata, FileId, ManifestEntry, ManifestIndex, ProtectionClass};
pub use vault::BackupVault;

// Callers hand the backup password over as a `SecretString`.
pub use secrecy::SecretString;

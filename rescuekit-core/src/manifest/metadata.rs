//! On-demand decoding of the per-entry metadata blob.
//!
//! Each manifest row carries a keyed-archive property list describing the
//! file: size, mode, protection class, and (for protected entries) the
//! class-wrapped per-file key. The blob is decoded only when an accessor
//! needs it, keeping index load cheap and reentrant.

use crate::bplist::{self, DecodedValue};
use crate::error::{VaultError, VaultResult};

use super::ProtectionClass;

/// Decoded metadata of one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// POSIX mode bits.
    pub mode: u32,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Protection class governing the entry's key.
    pub protection_class: ProtectionClass,
    /// Class-wrapped per-file AES key (RFC 3394 wrapped, 40 bytes), when
    /// the entry is protected and the backup recorded one.
    pub wrapped_file_key: Option<Vec<u8>>,
}

/// Leading bytes of the archived `EncryptionKey` payload: a 4-byte
/// little-endian protection class precedes the wrapped key material.
const FILE_KEY_CLASS_PREFIX: usize = 4;

impl EntryMetadata {
    /// Decodes entry metadata from the serialized keyed-archive blob.
    ///
    /// # Errors
    ///
    /// [`VaultError::NotBinaryFormat`] or [`VaultError::MalformedObject`]
    /// if the blob is not a decodable archive of the expected shape.
    pub fn from_blob(blob: &[u8]) -> VaultResult<Self> {
        let graph = bplist::decode(blob)?;
        let root = graph.root();
        if graph.follow(root).as_dict().is_none() {
            return Err(VaultError::malformed_object(
                "entry metadata root is not a dictionary",
            ));
        }

        let size = graph
            .dict_get(root, "Size")
            .and_then(DecodedValue::as_i64)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0);

        let mode = graph
            .dict_get(root, "Mode")
            .and_then(DecodedValue::as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);

        let raw_class = graph
            .dict_get(root, "ProtectionClass")
            .and_then(DecodedValue::as_i64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);

        let wrapped_file_key = graph
            .dict_get(root, "EncryptionKey")
            .and_then(DecodedValue::as_bytes)
            .filter(|payload| payload.len() > FILE_KEY_CLASS_PREFIX)
            .map(|payload| payload[FILE_KEY_CLASS_PREFIX..].to_vec());

        Ok(Self {
            mode,
            size,
            protection_class: ProtectionClass::from_raw(raw_class),
            wrapped_file_key,
        })
    }
}

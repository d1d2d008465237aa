//! Keybag engine: parsing and unlocking the backup key hierarchy.
//!
//! The keybag is a length-prefixed tagged binary container:
//!
//! ```text
//! ┌──────┬──────────────┬─────────────┐
//! │ tag  │ length (BE)  │ payload     │   repeated
//! │ 4 B  │ 4 B          │ length B    │
//! └──────┴──────────────┴─────────────┘
//! ```
//!
//! Header tags (`VERS`, `TYPE`, `UUID`, `HMCK`, `WRAP`, `SALT`, `ITER`,
//! `DPWT`, `DPIC`, `DPSL`) come first; each subsequent `UUID` tag opens a
//! per-class key block (`CLAS`, `WRAP`, `KTYP`, `WPKY`, `PBKY`). Unknown
//! tags are skipped for forward compatibility.
//!
//! Class-based keys partition the data by when it is accessible: keys
//! wrapped with the device's own secrets are unrecoverable off-device and
//! are reported as unavailable rather than silently skipped.

mod unlock;

pub use unlock::{ClassKey, UnlockedKeyBag};

use std::collections::BTreeMap;

use crate::error::{VaultError, VaultResult};

/// Wrap-source bit: key is wrapped with the device's UID key.
pub const WRAP_DEVICE: u32 = 1;

/// Wrap-source bit: key is wrapped with the passcode-derived key.
pub const WRAP_PASSCODE: u32 = 2;

/// A per-class wrapped key as stored in the keybag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Protection class number this key serves.
    pub class: u32,
    /// Wrap-source flags ([`WRAP_DEVICE`] / [`WRAP_PASSCODE`]).
    pub wrap_flags: u32,
    /// Key type tag (`KTYP`), zero when absent.
    pub key_type: u32,
    /// RFC 3394 wrapped key bytes.
    pub wrapped: Vec<u8>,
}

/// Parsed keybag container. Loaded once per backup; immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBag {
    /// Keybag format version.
    pub version: u32,
    /// Keybag type tag (`TYPE`), zero when absent.
    pub bag_type: u32,
    /// Bag identity.
    pub uuid: [u8; 16],
    /// Salt of the outer PBKDF2-SHA1 derivation.
    pub salt: Vec<u8>,
    /// Iteration count of the outer derivation.
    pub iterations: u32,
    /// Salt of the inner PBKDF2-SHA256 stage (`DPSL`), present on newer
    /// bags that use double derivation.
    pub double_salt: Option<Vec<u8>>,
    /// Iteration count of the inner stage (`DPIC`).
    pub double_iterations: Option<u32>,
    /// Wrapped class keys, by raw class number.
    pub class_keys: BTreeMap<u32, WrappedKey>,
}

/// Incrementally assembled class block during parsing.
#[derive(Default)]
struct ClassBlock {
    class: Option<u32>,
    wrap_flags: u32,
    key_type: u32,
    wrapped: Option<Vec<u8>>,
}

impl ClassBlock {
    fn finish(self, class_keys: &mut BTreeMap<u32, WrappedKey>) {
        if let (Some(class), Some(wrapped)) = (self.class, self.wrapped) {
            class_keys.insert(
                class,
                WrappedKey {
                    class,
                    wrap_flags: self.wrap_flags,
                    key_type: self.key_type,
                    wrapped,
                },
            );
        }
    }
}

impl KeyBag {
    /// Parses a keybag container.
    ///
    /// # Errors
    ///
    /// [`VaultError::MalformedKeybag`] if the tag structure is truncated or
    /// a required field (version, uuid, salt, iterations, at least one
    /// wrapped class key) is missing.
    #[allow(clippy::too_many_lines)]
    pub fn parse(bytes: &[u8]) -> VaultResult<Self> {
        let mut version = None;
        let mut bag_type = 0;
        let mut uuid = None;
        let mut salt = None;
        let mut iterations = None;
        let mut double_salt = None;
        let mut double_iterations = None;
        let mut class_keys = BTreeMap::new();
        let mut current: Option<ClassBlock> = None;

        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let (tag, payload) = read_item(bytes, &mut cursor)?;
            match (&tag, current.is_none()) {
                // A UUID after the header opens a new class block.
                (b"UUID", true) if uuid.is_some() => current = Some(ClassBlock::default()),
                (b"UUID", true) => {
                    uuid = Some(payload_uuid(payload)?);
                }
                (b"UUID", false) => {
                    if let Some(block) = current.take() {
                        block.finish(&mut class_keys);
                    }
                    current = Some(ClassBlock::default());
                }

                (b"VERS", true) => version = Some(be_u32(payload, "VERS")?),
                (b"TYPE", true) => bag_type = be_u32(payload, "TYPE")?,
                (b"SALT", true) => salt = Some(payload.to_vec()),
                (b"ITER", true) => iterations = Some(be_u32(payload, "ITER")?),
                (b"DPSL", true) => double_salt = Some(payload.to_vec()),
                (b"DPIC", true) => double_iterations = Some(be_u32(payload, "DPIC")?),

                (b"CLAS", false) => {
                    if let Some(block) = current.as_mut() {
                        block.class = Some(be_u32(payload, "CLAS")?);
                    }
                }
                (b"WRAP", false) => {
                    if let Some(block) = current.as_mut() {
                        block.wrap_flags = be_u32(payload, "WRAP")?;
                    }
                }
                (b"KTYP", false) => {
                    if let Some(block) = current.as_mut() {
                        block.key_type = be_u32(payload, "KTYP")?;
                    }
                }
                (b"WPKY", false) => {
                    if let Some(block) = current.as_mut() {
                        block.wrapped = Some(payload.to_vec());
                    }
                }

                // Unknown tags (HMCK, WRAP in header, DPWT, PBKY, ...) are
                // skipped for forward compatibility.
                _ => {}
            }
        }
        if let Some(block) = current.take() {
            block.finish(&mut class_keys);
        }

        let bag = Self {
            version: version
                .ok_or_else(|| VaultError::malformed_keybag("missing VERS tag"))?,
            bag_type,
            uuid: uuid.ok_or_else(|| VaultError::malformed_keybag("missing UUID tag"))?,
            salt: salt.ok_or_else(|| VaultError::malformed_keybag("missing SALT tag"))?,
            iterations: iterations
                .ok_or_else(|| VaultError::malformed_keybag("missing ITER tag"))?,
            double_salt,
            double_iterations,
            class_keys,
        };

        if bag.salt.is_empty() || bag.iterations == 0 {
            return Err(VaultError::malformed_keybag("empty derivation parameters"));
        }
        if bag.class_keys.is_empty() {
            return Err(VaultError::malformed_keybag("no wrapped class keys"));
        }
        Ok(bag)
    }
}

/// Reads one `(tag, payload)` item, advancing the cursor.
fn read_item<'a>(bytes: &'a [u8], cursor: &mut usize) -> VaultResult<([u8; 4], &'a [u8])> {
    let header_end = cursor
        .checked_add(8)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| VaultError::malformed_keybag("truncated tag header"))?;
    let tag: [u8; 4] = bytes[*cursor..*cursor + 4].try_into().expect("4 bytes");
    let len = u32::from_be_bytes(bytes[*cursor + 4..header_end].try_into().expect("4 bytes"));
    let payload_end = header_end
        .checked_add(len as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| VaultError::malformed_keybag("tag payload past end of container"))?;
    let payload = &bytes[header_end..payload_end];
    *cursor = payload_end;
    Ok((tag, payload))
}

/// Interprets a payload as a big-endian u32.
fn be_u32(payload: &[u8], tag: &str) -> VaultResult<u32> {
    payload
        .try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| VaultError::malformed_keybag(format!("{tag} payload is not 4 bytes")))
}

/// Interprets a payload as a 16-byte UUID.
fn payload_uuid(payload: &[u8]) -> VaultResult<[u8; 16]> {
    payload
        .try_into()
        .map_err(|_| VaultError::malformed_keybag("UUID payload is not 16 bytes"))
}

#[cfg(test)]
pub(crate) fn push_item(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(
        &u32::try_from(payload.len())
            .expect("payload fits u32")
            .to_be_bytes(),
    );
    out.extend_from_slice(payload);
}

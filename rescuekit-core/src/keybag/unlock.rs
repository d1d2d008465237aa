//! Password unlock: key derivation and class-key unwrap.
//!
//! Unlocking derives the passcode key from the user-supplied backup
//! password and the bag's derivation parameters, then attempts an RFC 3394
//! authenticated unwrap of every passcode-wrapped class key. The unwrap
//! runs over the full wrapped payload before its trailing integrity value
//! is checked, so validation does not bail on the first differing byte.
//!
//! A wrong password makes every passcode-wrapped unwrap fail its integrity
//! check; failure on a file class is therefore reported as
//! [`VaultError::WrongPassword`] for the whole bag (cheap fail-fast, spares
//! a per-file error cascade). Classes wrapped with the device's own secrets
//! are recorded as unavailable instead.

use std::collections::BTreeMap;
use std::fmt;

use aes_kw::KekAes256;
use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{VaultError, VaultResult};
use crate::manifest::ProtectionClass;

use super::{KeyBag, WRAP_DEVICE, WRAP_PASSCODE};

/// An unwrapped 256-bit class key. Zeroed on drop; never logged.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ClassKey([u8; 32]);

impl ClassKey {
    /// Creates a class key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Unwraps an RFC 3394 wrapped per-file key under this class key.
    ///
    /// Returns `None` when the payload length is invalid or the integrity
    /// check fails. The result is zeroed on drop.
    #[must_use]
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        let kek = KekAes256::from(self.0);
        kek.unwrap_vec(wrapped).ok().map(Zeroizing::new)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassKey").field("key", &"[REDACTED]").finish()
    }
}

/// The unwrapped key hierarchy for one session.
///
/// Derived lazily on first protected-file access, held only in memory,
/// zeroed on drop, never persisted. Safe for concurrent read-only use once
/// constructed.
#[derive(Debug)]
pub struct UnlockedKeyBag {
    class_keys: BTreeMap<u32, ClassKey>,
    unavailable: Vec<u32>,
}

impl UnlockedKeyBag {
    /// Builds a bag directly from unwrapped class keys.
    #[cfg(test)]
    pub(crate) fn with_class_keys(class_keys: BTreeMap<u32, ClassKey>) -> Self {
        Self {
            class_keys,
            unavailable: Vec::new(),
        }
    }

    /// Returns the unwrapped key for a protection class, if recoverable.
    #[must_use]
    pub fn class_key(&self, class: ProtectionClass) -> Option<&ClassKey> {
        self.class_keys.get(&class.raw())
    }

    /// Raw class numbers whose keys were present but not recoverable
    /// without the device's own secrets.
    #[must_use]
    pub fn unavailable_classes(&self) -> &[u32] {
        &self.unavailable
    }

    /// Number of recovered class keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.class_keys.len()
    }

    /// Returns `true` if no class key was recovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.class_keys.is_empty()
    }
}

impl KeyBag {
    /// Derives the passcode key and unwraps the class keys.
    ///
    /// # Errors
    ///
    /// [`VaultError::WrongPassword`] if a passcode-wrapped file-class key
    /// fails its unwrap integrity check.
    pub fn unlock(&self, password: &SecretString) -> VaultResult<UnlockedKeyBag> {
        let passcode_key = self.derive_passcode_key(password);
        let kek = KekAes256::from(*passcode_key);

        let mut class_keys = BTreeMap::new();
        let mut unavailable = Vec::new();

        for (class, wrapped) in &self.class_keys {
            // Device-wrapped keys (alone or stacked under the passcode
            // wrap) need the device's UID key and cannot be recovered from
            // the backup alone.
            if wrapped.wrap_flags & WRAP_PASSCODE == 0
                || wrapped.wrap_flags & WRAP_DEVICE != 0
            {
                unavailable.push(*class);
                continue;
            }

            match kek.unwrap_vec(&wrapped.wrapped) {
                Ok(mut key_bytes) if key_bytes.len() == 32 => {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&key_bytes);
                    key_bytes.zeroize();
                    class_keys.insert(*class, ClassKey::from_bytes(key));
                }
                _ => {
                    if ProtectionClass::from_raw(*class).is_file_class() {
                        // One file class validates the password for the
                        // whole bag.
                        return Err(VaultError::WrongPassword);
                    }
                    warn!(class, "class key failed to unwrap; marked unavailable");
                    unavailable.push(*class);
                }
            }
        }

        if class_keys.is_empty() {
            // Nothing unwrapped at all: with no file class present to
            // validate against, surface this as a wrong password rather
            // than an empty bag.
            return Err(VaultError::WrongPassword);
        }

        debug!(
            recovered = class_keys.len(),
            unavailable = unavailable.len(),
            "keybag unlocked"
        );
        Ok(UnlockedKeyBag {
            class_keys,
            unavailable,
        })
    }

    /// Derives the 256-bit passcode key from the password and the bag's
    /// derivation parameters.
    ///
    /// Newer bags carry an inner PBKDF2-SHA256 stage (`DPSL`/`DPIC`) whose
    /// output feeds the outer PBKDF2-SHA1 stage; older bags use the SHA-1
    /// stage alone. Deterministic for fixed password, salt, and iteration
    /// count.
    fn derive_passcode_key(&self, password: &SecretString) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        let password_bytes = password.expose_secret().as_bytes();

        match (&self.double_salt, self.double_iterations) {
            (Some(double_salt), Some(double_iterations)) => {
                let mut intermediate = Zeroizing::new([0u8; 32]);
                pbkdf2_hmac::<Sha256>(
                    password_bytes,
                    double_salt,
                    double_iterations,
                    intermediate.as_mut_slice(),
                );
                pbkdf2_hmac::<Sha1>(
                    intermediate.as_slice(),
                    &self.salt,
                    self.iterations,
                    out.as_mut_slice(),
                );
            }
            _ => {
                pbkdf2_hmac::<Sha1>(
                    password_bytes,
                    &self.salt,
                    self.iterations,
                    out.as_mut_slice(),
                );
            }
        }
        out
    }
}

//! Canonical record normalizers.
//!
//! Thin adapters from the relational stores a backup carries (address book,
//! message store, note store, calendar store) to canonical [`Contact`],
//! [`Message`], [`Note`], and [`CalendarEvent`] records. The heavy lifting — locating, decrypting, and
//! extracting the store files — is done by the vault layers; this module
//! is field mapping over an already-extracted database plus the timestamp
//! conversions those stores need.
//!
//! Schema drift across OS generations is handled per store: each
//! normalizer tries the schemas it knows, newest first, and degrades to a
//! reduced field set before giving up with
//! [`crate::VaultError::UnsupportedRecordStore`].

mod calendar;
mod contacts;
mod messages;
mod notes;

pub use calendar::{events_from_db, CalendarEvent};
pub use contacts::{contacts_from_db, Contact};
pub use messages::{messages_from_db, Message};
pub use notes::{notes_from_db, Note};

use chrono::{DateTime, Utc};

/// Where a well-known artifact lives inside a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactLocation {
    /// Backup domain of the artifact.
    pub domain: &'static str,
    /// Path relative to the domain root.
    pub relative_path: &'static str,
}

/// The address book store.
pub const ADDRESS_BOOK: ArtifactLocation = ArtifactLocation {
    domain: "HomeDomain",
    relative_path: "Library/AddressBook/AddressBook.sqlitedb",
};

/// The message store.
pub const MESSAGE_STORE: ArtifactLocation = ArtifactLocation {
    domain: "HomeDomain",
    relative_path: "Library/SMS/sms.db",
};

/// The calendar store.
pub const CALENDAR_STORE: ArtifactLocation = ArtifactLocation {
    domain: "HomeDomain",
    relative_path: "Library/Calendar/Calendar.sqlitedb",
};

/// Note store candidates, newest first. Older OS generations keep notes
/// under the home domain; newer ones in the Notes app group.
pub const NOTE_STORES: [ArtifactLocation; 2] = [
    ArtifactLocation {
        domain: "AppDomainGroup-group.com.apple.notes",
        relative_path: "NoteStore.sqlite",
    },
    ArtifactLocation {
        domain: "HomeDomain",
        relative_path: "Library/Notes/notes.sqlite",
    },
];

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// Converts a store timestamp to UTC.
///
/// Stores disagree on the unit: some record seconds since the 2001-01-01
/// epoch, others milliseconds or nanoseconds. Magnitude disambiguates —
/// second counts stay below 10^9 for any plausible date, nanosecond counts
/// above 10^12.
#[must_use]
pub fn apple_time_to_utc(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let seconds = if raw.abs() > 1e12 {
        raw / 1e9
    } else if raw.abs() > 1e9 {
        raw / 1e3
    } else {
        raw
    };

    #[allow(clippy::cast_possible_truncation)]
    let whole = seconds.trunc() as i64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let nanos = (seconds.fract().abs() * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(whole.checked_add(APPLE_EPOCH_OFFSET)?, nanos)
}

//! Message-store normalization.
//!
//! The message store joins the `message` table against `handle` (remote
//! party) and the attachment join table. Newer stores record timestamps in
//! nanoseconds, older ones in seconds; [`super::apple_time_to_utc`]
//! disambiguates. Stores whose join tables are missing fall back to a
//! bodies-only read.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

use super::apple_time_to_utc;

/// A normalized message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Row identity in the source store.
    pub id: i64,
    /// Delivery timestamp, when the store recorded one.
    pub timestamp: Option<DateTime<Utc>>,
    /// `true` for messages sent from this device.
    pub is_from_me: bool,
    /// Remote party identifier (phone number or account).
    pub handle: Option<String>,
    /// Message body.
    pub text: Option<String>,
    /// Attachment display name or filename, when one is joined.
    pub attachment: Option<String>,
}

const JOINED_QUERY: &str = "\
    SELECT m.ROWID, m.date, m.is_from_me, m.text, h.id,
           a.transfer_name, a.filename
    FROM message m
    LEFT JOIN handle h ON m.handle_id = h.ROWID
    LEFT JOIN message_attachment_join maj ON maj.message_id = m.ROWID
    LEFT JOIN attachment a ON a.ROWID = maj.attachment_id
    ORDER BY m.date ASC";

const BODIES_ONLY_QUERY: &str =
    "SELECT ROWID, date, is_from_me, text FROM message ORDER BY date ASC";

/// Normalizes every message in an extracted message store, oldest first.
///
/// # Errors
///
/// [`VaultError::UnsupportedRecordStore`] if the store has no readable
/// `message` table.
pub fn messages_from_db(conn: &Connection) -> VaultResult<Vec<Message>> {
    match joined(conn) {
        Ok(messages) => {
            debug!(messages = messages.len(), "message store read");
            Ok(messages)
        }
        Err(first_err) => {
            warn!("message store joins unavailable; reading bodies only");
            bodies_only(conn).map_err(|_| first_err)
        }
    }
}

fn joined(conn: &Connection) -> VaultResult<Vec<Message>> {
    let mut stmt = conn.prepare(JOINED_QUERY).map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            let transfer_name: Option<String> = row.get(5)?;
            let filename: Option<String> = row.get(6)?;
            Ok(Message {
                id: row.get(0)?,
                timestamp: row
                    .get::<_, Option<f64>>(1)?
                    .and_then(apple_time_to_utc),
                is_from_me: row.get::<_, i64>(2)? != 0,
                handle: row.get(4)?,
                text: row.get(3)?,
                attachment: transfer_name.or_else(|| filename.map(basename)),
            })
        })
        .map_err(store_err)?;
    rows.collect::<Result<_, _>>().map_err(store_err)
}

fn bodies_only(conn: &Connection) -> VaultResult<Vec<Message>> {
    let mut stmt = conn.prepare(BODIES_ONLY_QUERY).map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Message {
                id: row.get(0)?,
                timestamp: row
                    .get::<_, Option<f64>>(1)?
                    .and_then(apple_time_to_utc),
                is_from_me: row.get::<_, i64>(2)? != 0,
                handle: None,
                text: row.get(3)?,
                attachment: None,
            })
        })
        .map_err(store_err)?;
    rows.collect::<Result<_, _>>().map_err(store_err)
}

fn basename(path: String) -> String {
    path.rsplit('/').next().unwrap_or(&path).to_string()
}

fn store_err(e: rusqlite::Error) -> VaultError {
    VaultError::record_store(format!("message store query failed: {e}"))
}

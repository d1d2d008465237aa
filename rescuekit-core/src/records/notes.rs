//! Note-store normalization.
//!
//! The modern store keeps note bodies in `ZNOTEBODY` joined to `ZNOTE` by
//! owner; bare `ZNOTE` tables (very old stores) still yield titles.

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

/// A normalized note record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    /// Row identity in the source store.
    pub id: i64,
    /// Note title.
    pub title: Option<String>,
    /// Full note body, when the store carries one.
    pub content: Option<String>,
}

const JOINED_QUERY: &str = "\
    SELECT ZNOTE.Z_PK, ZNOTE.ZTITLE, ZNOTEBODY.ZCONTENT
    FROM ZNOTE
    LEFT JOIN ZNOTEBODY ON ZNOTE.Z_PK = ZNOTEBODY.ZOWNER
    ORDER BY ZNOTE.Z_PK";

const TITLES_ONLY_QUERY: &str = "SELECT Z_PK, ZTITLE FROM ZNOTE ORDER BY Z_PK";

/// Normalizes every note in an extracted note store.
///
/// # Errors
///
/// [`VaultError::UnsupportedRecordStore`] if the store has no readable
/// `ZNOTE` table.
pub fn notes_from_db(conn: &Connection) -> VaultResult<Vec<Note>> {
    match with_bodies(conn) {
        Ok(notes) => {
            debug!(notes = notes.len(), "note store read");
            Ok(notes)
        }
        Err(first_err) => {
            warn!("note store has no body table; reading titles only");
            titles_only(conn).map_err(|_| first_err)
        }
    }
}

fn with_bodies(conn: &Connection) -> VaultResult<Vec<Note>> {
    let mut stmt = conn.prepare(JOINED_QUERY).map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Note {
                id: row.get(0)?,
                title: row.get(1)?,
                content: row.get(2)?,
            })
        })
        .map_err(store_err)?;
    rows.collect::<Result<_, _>>().map_err(store_err)
}

fn titles_only(conn: &Connection) -> VaultResult<Vec<Note>> {
    let mut stmt = conn.prepare(TITLES_ONLY_QUERY).map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Note {
                id: row.get(0)?,
                title: row.get(1)?,
                content: None,
            })
        })
        .map_err(store_err)?;
    rows.collect::<Result<_, _>>().map_err(store_err)
}

fn store_err(e: rusqlite::Error) -> VaultError {
    VaultError::record_store(format!("note store query failed: {e}"))
}

//! Calendar-store normalization.
//!
//! Events live in `Event`, joined to `Calendar` for the owning calendar's
//! title; stores without a readable `Calendar` table still yield bare
//! events. Start and end times are stored on the 2001 epoch.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

use super::apple_time_to_utc;

/// A normalized calendar event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEvent {
    /// Row identity in the source store.
    pub id: i64,
    /// Event title.
    pub title: Option<String>,
    /// Longer event description, when present.
    pub description: Option<String>,
    /// Event start, in UTC.
    pub start: Option<DateTime<Utc>>,
    /// Event end, in UTC.
    pub end: Option<DateTime<Utc>>,
    /// Title of the calendar the event belongs to.
    pub calendar: Option<String>,
}

const JOINED_QUERY: &str = "\
    SELECT e.ROWID, e.summary, e.description, e.start_date, e.end_date, c.title
    FROM Event e
    LEFT JOIN Calendar c ON e.calendar_id = c.ROWID
    ORDER BY e.ROWID";

const EVENTS_ONLY_QUERY: &str = "\
    SELECT ROWID, summary, start_date, end_date FROM Event ORDER BY ROWID";

/// Normalizes every event in an extracted calendar store.
///
/// # Errors
///
/// [`VaultError::UnsupportedRecordStore`] if the store has no readable
/// `Event` table.
pub fn events_from_db(conn: &Connection) -> VaultResult<Vec<CalendarEvent>> {
    match with_calendars(conn) {
        Ok(events) => {
            debug!(events = events.len(), "calendar store read");
            Ok(events)
        }
        Err(first_err) => {
            warn!("calendar store has no calendar table; reading bare events");
            events_only(conn).map_err(|_| first_err)
        }
    }
}

fn with_calendars(conn: &Connection) -> VaultResult<Vec<CalendarEvent>> {
    let mut stmt = conn.prepare(JOINED_QUERY).map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CalendarEvent {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                start: event_time(row.get(3)?),
                end: event_time(row.get(4)?),
                calendar: row.get(5)?,
            })
        })
        .map_err(store_err)?;
    rows.collect::<Result<_, _>>().map_err(store_err)
}

fn events_only(conn: &Connection) -> VaultResult<Vec<CalendarEvent>> {
    let mut stmt = conn.prepare(EVENTS_ONLY_QUERY).map_err(store_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CalendarEvent {
                id: row.get(0)?,
                title: row.get(1)?,
                description: None,
                start: event_time(row.get(2)?),
                end: event_time(row.get(3)?),
                calendar: None,
            })
        })
        .map_err(store_err)?;
    rows.collect::<Result<_, _>>().map_err(store_err)
}

fn event_time(raw: Option<f64>) -> Option<DateTime<Utc>> {
    raw.and_then(apple_time_to_utc)
}

fn store_err(e: rusqlite::Error) -> VaultError {
    VaultError::record_store(format!("calendar store query failed: {e}"))
}

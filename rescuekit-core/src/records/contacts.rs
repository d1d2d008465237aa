//! Address-book normalization.
//!
//! Two schema generations are supported: the legacy `ABPerson` /
//! `ABMultiValue` layout and the newer CoreData `ZABCDRECORD` layout with
//! phone and email rows in their own tables.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::error::{VaultError, VaultResult};

/// `ABMultiValue.property` value for phone numbers.
const AB_PROPERTY_PHONE: i64 = 3;
/// `ABMultiValue.property` value for email addresses.
const AB_PROPERTY_EMAIL: i64 = 4;

/// A normalized address-book record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    /// Row identity in the source store.
    pub id: i64,
    /// Given name.
    pub first: Option<String>,
    /// Family name.
    pub last: Option<String>,
    /// Organization name.
    pub organization: Option<String>,
    /// Phone numbers, in store order.
    pub phones: Vec<String>,
    /// Email addresses, in store order.
    pub emails: Vec<String>,
}

/// Normalizes every contact in an extracted address-book store.
///
/// # Errors
///
/// [`VaultError::UnsupportedRecordStore`] if neither known schema is
/// present.
pub fn contacts_from_db(conn: &Connection) -> VaultResult<Vec<Contact>> {
    if let Some(contacts) = legacy_schema(conn)? {
        debug!(contacts = contacts.len(), "address book read (legacy schema)");
        return Ok(contacts);
    }
    if let Some(contacts) = coredata_schema(conn)? {
        debug!(contacts = contacts.len(), "address book read (CoreData schema)");
        return Ok(contacts);
    }
    Err(VaultError::record_store(
        "address book has neither ABPerson nor ZABCDRECORD",
    ))
}

/// Legacy `ABPerson` layout. Returns `None` when the table is absent.
fn legacy_schema(conn: &Connection) -> VaultResult<Option<Vec<Contact>>> {
    let Ok(mut stmt) =
        conn.prepare("SELECT ROWID, First, Last, Organization FROM ABPerson ORDER BY ROWID")
    else {
        return Ok(None);
    };

    let mut people: BTreeMap<i64, Contact> = stmt
        .query_map([], |row| {
            Ok(Contact {
                id: row.get(0)?,
                first: row.get(1)?,
                last: row.get(2)?,
                organization: row.get(3)?,
                phones: Vec::new(),
                emails: Vec::new(),
            })
        })
        .map_err(store_err)?
        .map(|person| person.map(|p| (p.id, p)))
        .collect::<Result<_, _>>()
        .map_err(store_err)?;

    // Phones and emails live in one multi-value table, tagged by property.
    if let Ok(mut stmt) =
        conn.prepare("SELECT record_id, property, value FROM ABMultiValue WHERE value IS NOT NULL")
    {
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(store_err)?;
        for row in rows {
            let (record_id, property, value) = row.map_err(store_err)?;
            if let Some(person) = people.get_mut(&record_id) {
                match property {
                    AB_PROPERTY_PHONE => person.phones.push(value),
                    AB_PROPERTY_EMAIL => person.emails.push(value),
                    _ => {}
                }
            }
        }
    }

    Ok(Some(people.into_values().collect()))
}

/// CoreData `ZABCDRECORD` layout. Returns `None` when the table is absent.
fn coredata_schema(conn: &Connection) -> VaultResult<Option<Vec<Contact>>> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT Z_PK, ZFIRSTNAME, ZLASTNAME, ZORGANIZATION FROM ZABCDRECORD ORDER BY Z_PK",
    ) else {
        return Ok(None);
    };

    let mut people: BTreeMap<i64, Contact> = stmt
        .query_map([], |row| {
            Ok(Contact {
                id: row.get(0)?,
                first: row.get(1)?,
                last: row.get(2)?,
                organization: row.get(3)?,
                phones: Vec::new(),
                emails: Vec::new(),
            })
        })
        .map_err(store_err)?
        .map(|person| person.map(|p| (p.id, p)))
        .collect::<Result<_, _>>()
        .map_err(store_err)?;

    if let Ok(mut stmt) = conn
        .prepare("SELECT ZOWNER, ZFULLNUMBER FROM ZABCDPHONENUMBER WHERE ZFULLNUMBER IS NOT NULL")
    {
        collect_multivalue(&mut stmt, &mut people, |person| &mut person.phones)?;
    }
    if let Ok(mut stmt) = conn
        .prepare("SELECT ZOWNER, ZADDRESS FROM ZABCDEMAILADDRESS WHERE ZADDRESS IS NOT NULL")
    {
        collect_multivalue(&mut stmt, &mut people, |person| &mut person.emails)?;
    }

    Ok(Some(people.into_values().collect()))
}

/// Folds `(owner, value)` rows into the owner's phone or email list.
fn collect_multivalue(
    stmt: &mut rusqlite::Statement<'_>,
    people: &mut BTreeMap<i64, Contact>,
    select: impl Fn(&mut Contact) -> &mut Vec<String>,
) -> VaultResult<()> {
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(store_err)?;
    for row in rows {
        let (owner, value) = row.map_err(store_err)?;
        if let Some(person) = people.get_mut(&owner) {
            select(person).push(value);
        }
    }
    Ok(())
}

fn store_err(e: rusqlite::Error) -> VaultError {
    VaultError::record_store(format!("address book query failed: {e}"))
}

//! Developer CLI for RescueKit.
//!
//! Opens a local device backup, optionally unlocks it with the backup
//! password, and exports normalized records as JSON. Export formatting and
//! argument parsing live here; everything backup-shaped is in
//! `rescuekit-core`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rescuekit_core::records::{
    self, contacts_from_db, events_from_db, messages_from_db, notes_from_db, ArtifactLocation,
};
use rescuekit_core::{BackupVault, SecretString};

/// Recover contacts, messages, and notes from a local device backup.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backup directory (the one containing Manifest.db)
    #[arg(short, long)]
    source: PathBuf,

    /// Backup password for encrypted backups
    #[arg(short, long, env = "RESCUEKIT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Directory for exported JSON files; omitted = print to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize the backup: entry counts per domain, encryption status
    Analyze,
    /// Export normalized address-book records
    Contacts,
    /// Export normalized message records
    Messages,
    /// Export normalized note records
    Notes,
    /// Export normalized calendar events
    Calendar,
}

#[derive(Serialize)]
struct AnalyzeReport {
    entries: usize,
    encrypted: bool,
    unlocked: bool,
    domains: BTreeMap<String, usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let cli = Cli::parse();

    let mut vault = BackupVault::open(&cli.source)
        .wrap_err_with(|| format!("failed to open backup at {}", cli.source.display()))?;

    if vault.is_encrypted() {
        match &cli.password {
            Some(password) => {
                vault
                    .unlock(&SecretString::from(password.clone()))
                    .wrap_err("failed to unlock backup")?;
                info!("backup unlocked");
            }
            None => warn!("backup is encrypted and no password was supplied"),
        }
    }

    match cli.command {
        Command::Analyze => analyze(&vault),
        Command::Contacts => {
            let records = with_artifact(&vault, &[records::ADDRESS_BOOK], |conn| {
                contacts_from_db(conn).map_err(Into::into)
            })?;
            export(&records, cli.output.as_deref(), "contacts.json")
        }
        Command::Messages => {
            let records = with_artifact(&vault, &[records::MESSAGE_STORE], |conn| {
                messages_from_db(conn).map_err(Into::into)
            })?;
            export(&records, cli.output.as_deref(), "messages.json")
        }
        Command::Notes => {
            let records = with_artifact(&vault, &records::NOTE_STORES, |conn| {
                notes_from_db(conn).map_err(Into::into)
            })?;
            export(&records, cli.output.as_deref(), "notes.json")
        }
        Command::Calendar => {
            let records = with_artifact(&vault, &[records::CALENDAR_STORE], |conn| {
                events_from_db(conn).map_err(Into::into)
            })?;
            export(&records, cli.output.as_deref(), "calendar.json")
        }
    }
}

fn analyze(vault: &BackupVault) -> Result<()> {
    let mut domains: BTreeMap<String, usize> = BTreeMap::new();
    for entry in vault.manifest().entries() {
        *domains.entry(entry.domain.clone()).or_default() += 1;
    }
    let report = AnalyzeReport {
        entries: vault.manifest().len(),
        encrypted: vault.is_encrypted(),
        unlocked: vault.is_unlocked(),
        domains,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Extracts the first present artifact candidate to a scratch directory
/// and runs `read` over it.
fn with_artifact<T>(
    vault: &BackupVault,
    candidates: &[ArtifactLocation],
    read: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let Some((location, entry)) = candidates.iter().find_map(|location| {
        vault
            .manifest()
            .lookup(location.domain, location.relative_path)
            .ok()
            .map(|entry| (location, entry))
    }) else {
        bail!(
            "no artifact found in backup (looked for {})",
            candidates
                .iter()
                .map(|c| format!("{}/{}", c.domain, c.relative_path))
                .collect::<Vec<_>>()
                .join(", ")
        );
    };

    let scratch = tempfile::tempdir().wrap_err("failed to create scratch directory")?;
    let dest = scratch.path().join(entry.file_id.to_hex());
    vault.extract_entry(entry, &dest).wrap_err_with(|| {
        format!(
            "failed to extract {}/{}",
            location.domain, location.relative_path
        )
    })?;
    let conn = Connection::open_with_flags(
        &dest,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err("extracted artifact is not a readable database")?;
    read(&conn)
}

fn export<T: Serialize>(values: &[T], output: Option<&Path>, filename: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(values)?;
    match output {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
            let path = dir.join(filename);
            std::fs::write(&path, json)
                .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            info!(records = values.len(), path = %path.display(), "exported");
            println!("{}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

//! Shared fixture builder: a complete encrypted backup directory generated
//! from scratch, so end-to-end tests exercise the real read path.

use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use aes_kw::KekAes256;
use pbkdf2::pbkdf2_hmac;
use rusqlite::Connection;
use sha1::Sha1;
use sha2::Sha256;
use tempfile::TempDir;

use rescuekit_core::FileId;

pub const PASSWORD: &str = "correct-horse";

pub const SALT: [u8; 20] = [0x5A; 20];
pub const ITERATIONS: u32 = 1000;
pub const DOUBLE_SALT: [u8; 20] = [0xC3; 20];
pub const DOUBLE_ITERATIONS: u32 = 100;

/// Protection class used for every protected fixture entry.
pub const FIXTURE_CLASS: u32 = 1;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// One seeded artifact: where it lives and what its store contains.
pub struct Artifact {
    pub domain: &'static str,
    pub relative_path: &'static str,
    pub content: Vec<u8>,
}

/// A generated encrypted backup directory plus the secrets used to build
/// it.
pub struct FixtureBackup {
    pub dir: TempDir,
    pub class_key: [u8; 32],
}

impl FixtureBackup {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

// ---- property-list encoding -------------------------------------------

/// Minimal value tree for building fixture property lists.
pub enum Plist {
    Bool(bool),
    Int(u64),
    Bytes(Vec<u8>),
    Str(&'static str),
    Dict(Vec<(&'static str, Plist)>),
}

enum Encoded {
    Leaf(Vec<u8>),
    Dict(Vec<(u8, u8)>),
}

/// Serializes a value tree as a `bplist00` buffer with one-byte object
/// references and two-byte offsets.
pub fn encode_bplist(root: &Plist) -> Vec<u8> {
    let mut nodes: Vec<Encoded> = Vec::new();
    let root_index = assign(root, &mut nodes);
    assert_eq!(root_index, 0);

    let mut buf = b"bplist00".to_vec();
    let mut offsets: Vec<u16> = Vec::new();
    for node in &nodes {
        offsets.push(u16::try_from(buf.len()).expect("fixture fits 2-byte offsets"));
        match node {
            Encoded::Leaf(bytes) => buf.extend_from_slice(bytes),
            Encoded::Dict(pairs) => {
                assert!(pairs.len() < 15);
                buf.push(0xD0 | u8::try_from(pairs.len()).unwrap());
                buf.extend(pairs.iter().map(|(k, _)| *k));
                buf.extend(pairs.iter().map(|(_, v)| *v));
            }
        }
    }
    let table_offset = buf.len() as u64;
    for offset in &offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    let mut trailer = [0u8; 32];
    trailer[6] = 2; // offset int size
    trailer[7] = 1; // object ref size
    trailer[8..16].copy_from_slice(&(nodes.len() as u64).to_be_bytes());
    // root index 0
    trailer[24..32].copy_from_slice(&table_offset.to_be_bytes());
    buf.extend_from_slice(&trailer);
    buf
}

fn assign(value: &Plist, nodes: &mut Vec<Encoded>) -> u8 {
    let index = u8::try_from(nodes.len()).expect("fixture fits 1-byte refs");
    nodes.push(Encoded::Leaf(Vec::new())); // reserve the slot
    let encoded = match value {
        Plist::Bool(b) => Encoded::Leaf(vec![if *b { 0x09 } else { 0x08 }]),
        Plist::Int(v) => {
            let mut bytes = vec![0x13];
            bytes.extend_from_slice(&v.to_be_bytes());
            Encoded::Leaf(bytes)
        }
        Plist::Bytes(data) => Encoded::Leaf(with_count(0x40, data)),
        Plist::Str(s) => Encoded::Leaf(with_count(0x50, s.as_bytes())),
        Plist::Dict(pairs) => {
            let mut encoded_pairs = Vec::with_capacity(pairs.len());
            for (key, child) in pairs {
                let key_index = assign(&Plist::Str(key), nodes);
                let value_index = assign(child, nodes);
                encoded_pairs.push((key_index, value_index));
            }
            Encoded::Dict(encoded_pairs)
        }
    };
    nodes[index as usize] = encoded;
    index
}

/// Marker byte plus count (inline nibble below 15, integer escape above).
fn with_count(marker_high: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + 4);
    if payload.len() < 15 {
        bytes.push(marker_high | u8::try_from(payload.len()).unwrap());
    } else {
        let len = u16::try_from(payload.len()).expect("fixture payload fits u16");
        bytes.push(marker_high | 0x0F);
        bytes.push(0x11);
        bytes.extend_from_slice(&len.to_be_bytes());
    }
    bytes.extend_from_slice(payload);
    bytes
}

// ---- keybag -----------------------------------------------------------

fn push_item(buf: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    buf.extend_from_slice(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Derives the passcode key the way backups do: an inner SHA-256 stage
/// over the raw password, then the outer SHA-1 stage.
pub fn derive_passcode_key(password: &str) -> [u8; 32] {
    let mut intermediate = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        &DOUBLE_SALT,
        DOUBLE_ITERATIONS,
        &mut intermediate,
    );
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha1>(&intermediate, &SALT, ITERATIONS, &mut out);
    out
}

/// Serializes a keybag whose single class key is wrapped under the key
/// derived from `password`.
pub fn build_keybag(password: &str, class: u32, class_key: &[u8; 32]) -> Vec<u8> {
    const WRAP_PASSCODE: u32 = 2;

    let kek = KekAes256::from(derive_passcode_key(password));
    let wrapped = kek.wrap_vec(class_key).unwrap();

    let mut buf = Vec::new();
    push_item(&mut buf, b"VERS", &3u32.to_be_bytes());
    push_item(&mut buf, b"TYPE", &1u32.to_be_bytes());
    push_item(&mut buf, b"UUID", &[0xAB; 16]);
    push_item(&mut buf, b"WRAP", &WRAP_PASSCODE.to_be_bytes());
    push_item(&mut buf, b"SALT", &SALT);
    push_item(&mut buf, b"ITER", &ITERATIONS.to_be_bytes());
    push_item(&mut buf, b"DPSL", &DOUBLE_SALT);
    push_item(&mut buf, b"DPIC", &DOUBLE_ITERATIONS.to_be_bytes());
    // class block
    push_item(&mut buf, b"UUID", &[0xCD; 16]);
    push_item(&mut buf, b"CLAS", &class.to_be_bytes());
    push_item(&mut buf, b"WRAP", &WRAP_PASSCODE.to_be_bytes());
    push_item(&mut buf, b"KTYP", &0u32.to_be_bytes());
    push_item(&mut buf, b"WPKY", &wrapped);
    buf
}

// ---- artifact stores --------------------------------------------------

/// Builds a small address-book store and returns its raw bytes.
pub fn address_book_bytes() -> Vec<u8> {
    sqlite_bytes(
        "CREATE TABLE ABPerson (ROWID INTEGER PRIMARY KEY, First TEXT, Last TEXT, Organization TEXT);
         CREATE TABLE ABMultiValue (UID INTEGER PRIMARY KEY, record_id INTEGER, property INTEGER, value TEXT);
         INSERT INTO ABPerson VALUES (1, 'Ada', 'Lovelace', NULL);
         INSERT INTO ABMultiValue VALUES (1, 1, 3, '+44 20 0001');
         INSERT INTO ABMultiValue VALUES (2, 1, 4, 'ada@engines.example');",
    )
}

/// Builds a small message store and returns its raw bytes.
pub fn message_store_bytes() -> Vec<u8> {
    sqlite_bytes(
        "CREATE TABLE message (ROWID INTEGER PRIMARY KEY, date REAL, is_from_me INTEGER, text TEXT, handle_id INTEGER);
         CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT);
         CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY, transfer_name TEXT, filename TEXT);
         CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
         INSERT INTO handle VALUES (1, '+1 555 0100');
         INSERT INTO message VALUES (1, 680000000, 0, 'fixture message', 1);",
    )
}

/// Builds a small note store and returns its raw bytes.
pub fn note_store_bytes() -> Vec<u8> {
    sqlite_bytes(
        "CREATE TABLE ZNOTE (Z_PK INTEGER PRIMARY KEY, ZTITLE TEXT);
         CREATE TABLE ZNOTEBODY (Z_PK INTEGER PRIMARY KEY, ZOWNER INTEGER, ZCONTENT TEXT);
         INSERT INTO ZNOTE VALUES (1, 'fixture note');
         INSERT INTO ZNOTEBODY VALUES (1, 1, 'fixture body');",
    )
}

/// Builds a small calendar store and returns its raw bytes.
pub fn calendar_store_bytes() -> Vec<u8> {
    sqlite_bytes(
        "CREATE TABLE Calendar (ROWID INTEGER PRIMARY KEY, title TEXT);
         CREATE TABLE Event (ROWID INTEGER PRIMARY KEY, summary TEXT, description TEXT, start_date REAL, end_date REAL, calendar_id INTEGER);
         INSERT INTO Calendar VALUES (1, 'Home');
         INSERT INTO Event VALUES (1, 'fixture event', NULL, 680000000.0, 680003600.0, 1);",
    )
}

fn sqlite_bytes(schema: &str) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(schema).unwrap();
    drop(conn);
    std::fs::read(&path).unwrap()
}

// ---- backup assembly --------------------------------------------------

fn encrypt_blob(file_key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let iv = [0u8; 16];
    Aes256CbcEnc::new_from_slices(file_key, &iv)
        .unwrap()
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Builds a complete encrypted backup holding `artifacts`, protected under
/// [`PASSWORD`].
pub fn build_encrypted_backup(artifacts: &[Artifact]) -> FixtureBackup {
    let dir = TempDir::new().unwrap();
    let class_key = [0x42u8; 32];

    // Manifest.plist with the serialized keybag.
    let keybag = build_keybag(PASSWORD, FIXTURE_CLASS, &class_key);
    let descriptor = encode_bplist(&Plist::Dict(vec![
        ("BackupKeyBag", Plist::Bytes(keybag)),
        ("IsEncrypted", Plist::Bool(true)),
    ]));
    std::fs::write(dir.path().join("Manifest.plist"), descriptor).unwrap();

    // Manifest.db plus one encrypted blob per artifact.
    let conn = Connection::open(dir.path().join("Manifest.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT, flags INTEGER, file BLOB);",
    )
    .unwrap();

    let kek = KekAes256::from(class_key);
    for (n, artifact) in artifacts.iter().enumerate() {
        let mut file_key = [0u8; 32];
        file_key[0] = u8::try_from(n + 1).unwrap();
        file_key[31] = 0x77;

        let mut encryption_key = FIXTURE_CLASS.to_le_bytes().to_vec();
        encryption_key.extend_from_slice(&kek.wrap_vec(&file_key).unwrap());

        let metadata = encode_bplist(&Plist::Dict(vec![
            ("Size", Plist::Int(artifact.content.len() as u64)),
            ("Mode", Plist::Int(0o100_644)),
            ("ProtectionClass", Plist::Int(u64::from(FIXTURE_CLASS))),
            ("EncryptionKey", Plist::Bytes(encryption_key)),
        ]));

        let file_id = FileId::derive(artifact.domain, artifact.relative_path);
        conn.execute(
            "INSERT INTO Files VALUES (?1, ?2, ?3, 1, ?4)",
            (
                file_id.to_hex(),
                artifact.domain,
                artifact.relative_path,
                metadata,
            ),
        )
        .unwrap();

        let blob_path = dir.path().join(file_id.blob_relative_path());
        std::fs::create_dir_all(blob_path.parent().unwrap()).unwrap();
        std::fs::write(blob_path, encrypt_blob(&file_key, &artifact.content)).unwrap();
    }
    drop(conn);

    FixtureBackup { dir, class_key }
}

/// The standard fixture artifacts: one store per normalizer.
pub fn standard_artifacts() -> Vec<Artifact> {
    vec![
        Artifact {
            domain: "HomeDomain",
            relative_path: "Library/AddressBook/AddressBook.sqlitedb",
            content: address_book_bytes(),
        },
        Artifact {
            domain: "HomeDomain",
            relative_path: "Library/SMS/sms.db",
            content: message_store_bytes(),
        },
        Artifact {
            domain: "AppDomainGroup-group.com.apple.notes",
            relative_path: "NoteStore.sqlite",
            content: note_store_bytes(),
        },
        Artifact {
            domain: "HomeDomain",
            relative_path: "Library/Calendar/Calendar.sqlitedb",
            content: calendar_store_bytes(),
        },
    ]
}

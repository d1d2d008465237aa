//! Binary property-list decoder.
//!
//! Parses Apple's binary object-graph serialization (`bplist00`) into an
//! arena-backed [`ObjectGraph`] of [`DecodedValue`] nodes, and reconstructs
//! keyed-archive (NSKeyedArchiver) payloads into typed values.
//!
//! # Buffer layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        magic + version ("bplist00")     │  8 bytes
//! ├─────────────────────────────────────────┤
//! │        object encodings                 │  variable
//! ├─────────────────────────────────────────┤
//! │        offset table                     │  num_objects × offset_int_size
//! ├─────────────────────────────────────────┤
//! │        trailer                          │  32 bytes
//! └─────────────────────────────────────────┘
//! ```
//!
//! The trailer holds the object count, the byte widths used for offsets and
//! object references, the root object index, and the offset table's own
//! offset. Objects are decoded lazily and memoized by index: each object is
//! materialized exactly once, containers hold [`DecodedValue::Ref`] children,
//! and reference cycles resolve to the shared in-progress node.
//!
//! # Failure policy
//!
//! A malformed header, trailer, or offset table is unrecoverable
//! ([`VaultError::NotBinaryFormat`] / [`VaultError::MalformedObject`]). A
//! malformed sub-object degrades to [`DecodedValue::Malformed`] and the rest
//! of the graph still decodes.

mod archive;
mod value;

pub use archive::{is_keyed_archive, reconstruct};
pub use value::{DecodedValue, ObjectIndex, ObjectGraph};

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{VaultError, VaultResult};

/// Magic prefix of a binary property list. The final version byte is not
/// pinned; all observed backups use `bplist00`.
const MAGIC: &[u8; 7] = b"bplist0";

/// Size of the fixed trailer at the end of the buffer.
const TRAILER_SIZE: usize = 32;

/// Recursion guard for pathologically nested containers. Cycles are already
/// broken by memoization; this bounds legitimate nesting.
const MAX_DEPTH: usize = 512;

/// Decodes a buffer into an [`ObjectGraph`].
///
/// When the top-level object is a keyed-archiver payload the archived
/// object graph is reconstructed into typed values (dates, data, strings,
/// collections); otherwise the raw graph is returned as-is.
///
/// # Errors
///
/// [`VaultError::NotBinaryFormat`] if the magic is absent,
/// [`VaultError::MalformedObject`] if the trailer or offset table is
/// structurally invalid.
pub fn decode(bytes: &[u8]) -> VaultResult<ObjectGraph> {
    let graph = parse(bytes)?;
    if is_keyed_archive(&graph) {
        reconstruct(&graph)
    } else {
        Ok(graph)
    }
}

/// Decodes a buffer into the raw object graph, without keyed-archive
/// reconstruction.
///
/// # Errors
///
/// Same as [`decode`].
pub fn parse(bytes: &[u8]) -> VaultResult<ObjectGraph> {
    let trailer = Trailer::read(bytes)?;
    let offsets = read_offset_table(bytes, &trailer)?;

    let mut decoder = Decoder {
        buf: bytes,
        offsets: &offsets,
        ref_size: trailer.ref_size,
        objects: vec![None; trailer.num_objects],
        state: vec![State::Unvisited; trailer.num_objects],
    };

    // Root first so cycle back-references resolve toward it, then the
    // remainder of the table so the arena is total.
    decoder.ensure_decoded(trailer.root, 0);
    for index in 0..trailer.num_objects {
        decoder.ensure_decoded(index, 0);
    }

    let objects = decoder
        .objects
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| DecodedValue::Malformed("undecoded".to_string())))
        .collect();

    Ok(ObjectGraph {
        objects,
        root: trailer.root,
    })
}

/// Parsed trailer fields.
struct Trailer {
    offset_int_size: usize,
    ref_size: usize,
    num_objects: usize,
    root: usize,
    table_offset: usize,
}

impl Trailer {
    /// Reads and validates the 32-byte trailer.
    ///
    /// Trailer layout: 5 unused bytes, sort version, offset int size (u8),
    /// object ref size (u8), object count (u64 BE), root object index
    /// (u64 BE), offset table offset (u64 BE).
    fn read(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < MAGIC.len() + 1 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(VaultError::NotBinaryFormat);
        }
        if bytes.len() < MAGIC.len() + 1 + TRAILER_SIZE {
            return Err(VaultError::malformed_object("buffer too short for trailer"));
        }

        let t = &bytes[bytes.len() - TRAILER_SIZE..];
        let offset_int_size = t[6] as usize;
        let ref_size = t[7] as usize;
        let num_objects = usize::try_from(u64::from_be_bytes(t[8..16].try_into().expect("8 bytes")))
            .map_err(|_| VaultError::malformed_object("object count overflows usize"))?;
        let root = usize::try_from(u64::from_be_bytes(t[16..24].try_into().expect("8 bytes")))
            .map_err(|_| VaultError::malformed_object("root index overflows usize"))?;
        let table_offset =
            usize::try_from(u64::from_be_bytes(t[24..32].try_into().expect("8 bytes")))
                .map_err(|_| VaultError::malformed_object("offset table offset overflows usize"))?;

        if !(1..=8).contains(&offset_int_size) || !(1..=8).contains(&ref_size) {
            return Err(VaultError::malformed_object(
                "offset or reference width outside 1..=8",
            ));
        }
        if num_objects == 0 {
            return Err(VaultError::malformed_object("empty object table"));
        }
        if root >= num_objects {
            return Err(VaultError::malformed_object("root index outside object table"));
        }

        Ok(Self {
            offset_int_size,
            ref_size,
            num_objects,
            root,
            table_offset,
        })
    }
}

/// Reads the offset table, validating every offset lands inside the object
/// region.
fn read_offset_table(bytes: &[u8], trailer: &Trailer) -> VaultResult<Vec<usize>> {
    let object_region_end = bytes.len() - TRAILER_SIZE;
    let table_len = trailer
        .num_objects
        .checked_mul(trailer.offset_int_size)
        .ok_or_else(|| VaultError::malformed_object("offset table length overflow"))?;
    let table_end = trailer
        .table_offset
        .checked_add(table_len)
        .filter(|end| *end <= object_region_end)
        .ok_or_else(|| VaultError::malformed_object("offset table outside buffer"))?;

    let table = &bytes[trailer.table_offset..table_end];
    let mut offsets = Vec::with_capacity(trailer.num_objects);
    for chunk in table.chunks_exact(trailer.offset_int_size) {
        let offset = usize::try_from(be_uint(chunk))
            .map_err(|_| VaultError::malformed_object("object offset overflows usize"))?;
        if offset < MAGIC.len() + 1 || offset >= trailer.table_offset {
            return Err(VaultError::malformed_object(
                "object offset outside object region",
            ));
        }
        offsets.push(offset);
    }
    Ok(offsets)
}

/// Big-endian unsigned integer of 1..=8 bytes.
fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Unvisited,
    InProgress,
    Done,
}

/// Per-call decoding state. Local to one `parse` invocation, so concurrent
/// decodes never share mutable scratch state.
struct Decoder<'a> {
    buf: &'a [u8],
    offsets: &'a [usize],
    ref_size: usize,
    objects: Vec<Option<DecodedValue>>,
    state: Vec<State>,
}

impl Decoder<'_> {
    /// Decodes the object at `index` if it has not been materialized yet,
    /// and returns a `Ref` to it. An in-progress index is a cycle; the
    /// `Ref` then resolves to the shared node once it finishes.
    fn ensure_decoded(&mut self, index: usize, depth: usize) -> DecodedValue {
        match self.state[index] {
            State::Done | State::InProgress => DecodedValue::Ref(index),
            State::Unvisited => {
                self.state[index] = State::InProgress;
                let value = self.decode_object(index, depth);
                self.objects[index] = Some(value);
                self.state[index] = State::Done;
                DecodedValue::Ref(index)
            }
        }
    }

    /// Decodes the object encoding at `self.offsets[index]`.
    ///
    /// Never fails hard: structural problems inside the object degrade to
    /// [`DecodedValue::Malformed`].
    #[allow(clippy::too_many_lines)]
    fn decode_object(&mut self, index: usize, depth: usize) -> DecodedValue {
        if depth > MAX_DEPTH {
            return DecodedValue::Malformed("container nesting too deep".to_string());
        }

        let offset = self.offsets[index];
        let Some(&marker) = self.buf.get(offset) else {
            return DecodedValue::Malformed("object offset past buffer".to_string());
        };
        let nibble = marker & 0x0F;
        let mut cursor = offset + 1;

        match marker >> 4 {
            // Singletons: null, booleans, fill byte.
            0x0 => match marker {
                0x00 => DecodedValue::Null,
                0x08 => DecodedValue::Bool(false),
                0x09 => DecodedValue::Bool(true),
                0x0F => DecodedValue::Null, // fill byte, no payload
                _ => DecodedValue::Malformed(format!("unrecognized marker 0x{marker:02x}")),
            },

            // Integer: 2^nibble big-endian bytes, signed at 8 bytes.
            0x1 => {
                let width = 1usize << nibble;
                match self.take(&mut cursor, width) {
                    Some(raw) if width <= 8 => {
                        let unsigned = be_uint(raw);
                        #[allow(clippy::cast_possible_wrap)]
                        DecodedValue::Int(unsigned as i64)
                    }
                    Some(raw) if width == 16 => {
                        // Only the low 64 bits are significant in practice.
                        if raw[..8].iter().any(|b| *b != 0) {
                            DecodedValue::Malformed("integer exceeds 64 bits".to_string())
                        } else {
                            #[allow(clippy::cast_possible_wrap)]
                            DecodedValue::Int(be_uint(&raw[8..]) as i64)
                        }
                    }
                    _ => DecodedValue::Malformed("integer payload past buffer".to_string()),
                }
            }

            // Real: 4- or 8-byte big-endian IEEE float.
            0x2 => {
                let width = 1usize << nibble;
                match (width, self.take(&mut cursor, width)) {
                    (4, Some(raw)) => DecodedValue::Real(f64::from(f32::from_be_bytes(
                        raw.try_into().expect("4 bytes"),
                    ))),
                    (8, Some(raw)) => {
                        DecodedValue::Real(f64::from_be_bytes(raw.try_into().expect("8 bytes")))
                    }
                    _ => DecodedValue::Malformed("unsupported real width".to_string()),
                }
            }

            // Date: marker 0x33, 8-byte big-endian f64 seconds since the
            // 2001-01-01 epoch.
            0x3 => {
                if marker != 0x33 {
                    return DecodedValue::Malformed(format!("unrecognized marker 0x{marker:02x}"));
                }
                match self.take(&mut cursor, 8) {
                    Some(raw) => {
                        DecodedValue::Date(f64::from_be_bytes(raw.try_into().expect("8 bytes")))
                    }
                    None => DecodedValue::Malformed("date payload past buffer".to_string()),
                }
            }

            // Data: `count` raw bytes.
            0x4 => match self.read_count(nibble, &mut cursor) {
                Some(count) => match self.take(&mut cursor, count) {
                    Some(raw) => DecodedValue::Bytes(raw.to_vec()),
                    None => DecodedValue::Malformed("data payload past buffer".to_string()),
                },
                None => DecodedValue::Malformed("data length unreadable".to_string()),
            },

            // ASCII string: `count` single-byte characters.
            0x5 => match self.read_count(nibble, &mut cursor) {
                Some(count) => match self.take(&mut cursor, count) {
                    Some(raw) => match std::str::from_utf8(raw) {
                        Ok(s) => DecodedValue::String(s.to_string()),
                        Err(_) => {
                            DecodedValue::Malformed("ASCII string not valid UTF-8".to_string())
                        }
                    },
                    None => DecodedValue::Malformed("string payload past buffer".to_string()),
                },
                None => DecodedValue::Malformed("string length unreadable".to_string()),
            },

            // UTF-16BE string: `count` code units of two bytes each.
            0x6 => match self.read_count(nibble, &mut cursor) {
                Some(count) => match count
                    .checked_mul(2)
                    .and_then(|len| self.take(&mut cursor, len))
                {
                    Some(raw) => {
                        let units: Vec<u16> = raw
                            .chunks_exact(2)
                            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                            .collect();
                        match String::from_utf16(&units) {
                            Ok(s) => DecodedValue::String(s),
                            Err(_) => {
                                DecodedValue::Malformed("invalid UTF-16 string".to_string())
                            }
                        }
                    }
                    None => DecodedValue::Malformed("string payload past buffer".to_string()),
                },
                None => DecodedValue::Malformed("string length unreadable".to_string()),
            },

            // UTF-8 string (rare, later format revisions).
            0x7 => match self.read_count(nibble, &mut cursor) {
                Some(count) => match self.take(&mut cursor, count) {
                    Some(raw) => match std::str::from_utf8(raw) {
                        Ok(s) => DecodedValue::String(s.to_string()),
                        Err(_) => DecodedValue::Malformed("invalid UTF-8 string".to_string()),
                    },
                    None => DecodedValue::Malformed("string payload past buffer".to_string()),
                },
                None => DecodedValue::Malformed("string length unreadable".to_string()),
            },

            // UID: nibble+1 big-endian bytes. Used by keyed archives.
            0x8 => match self.take(&mut cursor, nibble as usize + 1) {
                Some(raw) => DecodedValue::Uid(be_uint(raw)),
                None => DecodedValue::Malformed("uid payload past buffer".to_string()),
            },

            // Array (0xA) and set (0xC): `count` object references.
            0xA | 0xC => match self.read_count(nibble, &mut cursor) {
                Some(count) => match self.read_refs(&mut cursor, count) {
                    Some(refs) => {
                        let items = refs
                            .into_iter()
                            .map(|child| self.child(child, depth))
                            .collect();
                        DecodedValue::Array(items)
                    }
                    None => DecodedValue::Malformed("collection refs past buffer".to_string()),
                },
                None => DecodedValue::Malformed("collection length unreadable".to_string()),
            },

            // Dict: `count` key references then `count` value references.
            0xD => match self.read_count(nibble, &mut cursor) {
                Some(count) => {
                    let keys = self.read_refs(&mut cursor, count);
                    let values = self.read_refs(&mut cursor, count);
                    match (keys, values) {
                        (Some(keys), Some(values)) => self.build_dict(&keys, &values, depth),
                        _ => DecodedValue::Malformed("dictionary refs past buffer".to_string()),
                    }
                }
                None => DecodedValue::Malformed("dictionary length unreadable".to_string()),
            },

            _ => DecodedValue::Malformed(format!("unrecognized marker 0x{marker:02x}")),
        }
    }

    /// Materializes a child reference, degrading out-of-range references.
    fn child(&mut self, child: Option<usize>, depth: usize) -> DecodedValue {
        match child {
            Some(index) if index < self.offsets.len() => {
                self.ensure_decoded(index, depth + 1)
            }
            _ => {
                trace!("object reference outside object table");
                DecodedValue::Malformed("object reference outside table".to_string())
            }
        }
    }

    /// Builds a dictionary from parallel key/value reference arrays.
    ///
    /// Keys must resolve to strings (numeric and boolean keys are rendered
    /// through their display form); any other key shape degrades the whole
    /// dictionary.
    fn build_dict(
        &mut self,
        keys: &[Option<usize>],
        values: &[Option<usize>],
        depth: usize,
    ) -> DecodedValue {
        let mut map = BTreeMap::new();
        for (key_ref, value_ref) in keys.iter().zip(values) {
            let key_value = self.child(*key_ref, depth);
            let key = match self.resolve(&key_value) {
                DecodedValue::String(s) => s.clone(),
                DecodedValue::Int(i) => i.to_string(),
                DecodedValue::Real(r) => r.to_string(),
                DecodedValue::Bool(b) => b.to_string(),
                _ => {
                    return DecodedValue::Malformed(
                        "non-string dictionary key".to_string(),
                    )
                }
            };
            let value = self.child(*value_ref, depth);
            map.insert(key, value);
        }
        DecodedValue::Dict(map)
    }

    /// Resolves a `Ref` against the partially built arena.
    fn resolve<'v>(&'v self, value: &'v DecodedValue) -> &'v DecodedValue {
        match value {
            DecodedValue::Ref(index) => self
                .objects
                .get(*index)
                .and_then(Option::as_ref)
                .unwrap_or(value),
            other => other,
        }
    }

    /// Takes `len` bytes at the cursor, advancing it.
    fn take(&self, cursor: &mut usize, len: usize) -> Option<&[u8]> {
        let end = cursor.checked_add(len)?;
        if end > self.buf.len() - TRAILER_SIZE {
            return None;
        }
        let slice = &self.buf[*cursor..end];
        *cursor = end;
        Some(slice)
    }

    /// Reads a container length: the marker nibble embeds lengths below 15,
    /// larger lengths follow as an integer object (`0x1X` + payload).
    fn read_count(&self, nibble: u8, cursor: &mut usize) -> Option<usize> {
        if nibble != 0x0F {
            return Some(nibble as usize);
        }
        let int_marker = *self.buf.get(*cursor)?;
        if int_marker >> 4 != 0x1 {
            return None;
        }
        *cursor += 1;
        let width = 1usize << (int_marker & 0x0F);
        if width > 8 {
            return None;
        }
        let raw = self.take(cursor, width)?;
        usize::try_from(be_uint(raw)).ok()
    }

    /// Reads `count` object references of `ref_size` bytes each.
    ///
    /// Returns `None` if the reference block runs past the buffer; a single
    /// out-of-range reference value is kept as `None` in the output so that
    /// only that child degrades.
    fn read_refs(&self, cursor: &mut usize, count: usize) -> Option<Vec<Option<usize>>> {
        let len = count.checked_mul(self.ref_size)?;
        let raw = self.take(cursor, len)?;
        Some(
            raw.chunks_exact(self.ref_size)
                .map(|chunk| {
                    let index = usize::try_from(be_uint(chunk)).ok()?;
                    (index < self.offsets.len()).then_some(index)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests;

//! Decoded property-list values and the arena-backed object graph.

use std::collections::BTreeMap;

/// Index of an object in the source object table (and in the decoded arena).
pub type ObjectIndex = usize;

/// A decoded property-list value.
///
/// Container children that were shared objects in the source come back as
/// [`DecodedValue::Ref`] nodes pointing into the owning [`ObjectGraph`]
/// arena, so that every source object is materialized exactly once and
/// reference cycles resolve to a shared node instead of recursing. Use the
/// graph's accessors ([`ObjectGraph::follow`], [`ObjectGraph::dict_get`],
/// [`ObjectGraph::array_items`]) to read through them.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// Null marker.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 string.
    String(String),
    /// Raw byte blob.
    Bytes(Vec<u8>),
    /// Absolute timestamp: seconds since 2001-01-01T00:00:00Z, with
    /// fractional seconds.
    Date(f64),
    /// Ordered sequence. Elements are `Ref`s into the arena.
    Array(Vec<DecodedValue>),
    /// String-keyed mapping. Values are `Ref`s into the arena.
    Dict(BTreeMap<String, DecodedValue>),
    /// Keyed-archive object reference (an index into the archive's
    /// `$objects` array). Only present in raw graphs; archive
    /// reconstruction resolves these away.
    Uid(u64),
    /// Reference to another node in the arena, by its stable object index.
    Ref(ObjectIndex),
    /// A sub-object that could not be decoded. Carries the reason; the
    /// surrounding decode continues.
    Malformed(String),
}

impl DecodedValue {
    /// Returns the string payload, if this is a `String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an `Int`.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the float payload. Integers are widened.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the byte payload, if this is `Bytes`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the mapping, if this is a `Dict`.
    #[must_use]
    pub const fn as_dict(&self) -> Option<&BTreeMap<String, DecodedValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the element sequence, if this is an `Array`.
    #[must_use]
    pub fn as_array(&self) -> Option<&[DecodedValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns `true` for the `Null` marker.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A fully decoded object graph.
///
/// The arena is indexed by source object index; `root` names the designated
/// top-level object from the trailer (or the `$top` entry after keyed-archive
/// reconstruction). Reading is reentrant: the graph is immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectGraph {
    pub(crate) objects: Vec<DecodedValue>,
    pub(crate) root: ObjectIndex,
}

impl ObjectGraph {
    /// Returns the root object.
    #[must_use]
    pub fn root(&self) -> &DecodedValue {
        self.get(self.root)
    }

    /// Returns the index of the root object.
    #[must_use]
    pub const fn root_index(&self) -> ObjectIndex {
        self.root
    }

    /// Returns the object at `index`, or a `Malformed` marker for an index
    /// outside the arena.
    #[must_use]
    pub fn get(&self, index: ObjectIndex) -> &DecodedValue {
        static OUT_OF_RANGE: DecodedValue =
            DecodedValue::Malformed(String::new());
        self.objects.get(index).unwrap_or(&OUT_OF_RANGE)
    }

    /// Number of objects in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` if the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Follows a `Ref` one hop into the arena; other values pass through.
    ///
    /// Arena nodes are never themselves `Ref`s, so one hop fully resolves.
    #[must_use]
    pub fn follow<'a>(&'a self, value: &'a DecodedValue) -> &'a DecodedValue {
        match value {
            DecodedValue::Ref(index) => self.get(*index),
            other => other,
        }
    }

    /// Looks up `key` in a dictionary value, following `Ref`s on both the
    /// dictionary and the result.
    #[must_use]
    pub fn dict_get<'a>(
        &'a self,
        dict: &'a DecodedValue,
        key: &str,
    ) -> Option<&'a DecodedValue> {
        self.follow(dict)
            .as_dict()
            .and_then(|map| map.get(key))
            .map(|v| self.follow(v))
    }

    /// Iterates the elements of an array value, following `Ref`s.
    pub fn array_items<'a>(
        &'a self,
        array: &'a DecodedValue,
    ) -> impl Iterator<Item = &'a DecodedValue> {
        self.follow(array)
            .as_array()
            .unwrap_or(&[])
            .iter()
            .map(|v| self.follow(v))
    }
}

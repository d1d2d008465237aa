//! Keyed-archive (NSKeyedArchiver) reconstruction.
//!
//! A keyed archive is a property list of the shape:
//!
//! ```text
//! { "$archiver": "NSKeyedArchiver",
//!   "$version":  100000,
//!   "$top":      { "root": <uid> },
//!   "$objects":  [ "$null", <archived object>, ... ] }
//! ```
//!
//! Archived composite objects are dictionaries carrying a `$class` reference
//! plus class-specific keys (`NS.time`, `NS.data`, `NS.objects`, ...). This
//! module flattens the archive into an [`ObjectGraph`] indexed by `$objects`
//! position, reconstructing well-known classes as their typed
//! [`DecodedValue`] variants. Downstream normalizers depend on this: a date
//! field must come back as `Date`, not as a nested dictionary.
//!
//! Cycles between archived objects (self-referencing graphs) resolve to
//! [`DecodedValue::Ref`] of the shared node, exactly as in the raw decoder.
//! Nesting is bounded the same way too: reference chains deeper than the
//! decoder's container limit degrade to [`DecodedValue::Malformed`].

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{VaultError, VaultResult};

use super::value::{DecodedValue, ObjectGraph};
use super::MAX_DEPTH;

/// Returns `true` if the graph's root is a keyed-archiver payload.
#[must_use]
pub fn is_keyed_archive(graph: &ObjectGraph) -> bool {
    let root = graph.root();
    graph
        .dict_get(root, "$archiver")
        .and_then(DecodedValue::as_str)
        == Some("NSKeyedArchiver")
        && graph.dict_get(root, "$objects").is_some()
        && graph.dict_get(root, "$top").is_some()
}

/// Reconstructs a keyed archive into a graph indexed by `$objects` position.
///
/// # Errors
///
/// [`VaultError::MalformedObject`] if the `$top`/`$objects` scaffolding is
/// absent or does not have the required shape. Malformed *archived* objects
/// degrade to [`DecodedValue::Malformed`] nodes instead.
pub fn reconstruct(graph: &ObjectGraph) -> VaultResult<ObjectGraph> {
    let root = graph.root();
    let objects = graph
        .dict_get(root, "$objects")
        .and_then(DecodedValue::as_array)
        .ok_or_else(|| VaultError::malformed_object("keyed archive missing $objects array"))?;

    let top = graph
        .dict_get(root, "$top")
        .ok_or_else(|| VaultError::malformed_object("keyed archive missing $top"))?;
    let top_uid = top
        .as_dict()
        .and_then(|map| map.get("root").or_else(|| map.values().next()))
        .map(|v| graph.follow(v))
        .and_then(|v| match v {
            DecodedValue::Uid(uid) => usize::try_from(*uid).ok(),
            _ => None,
        })
        .ok_or_else(|| VaultError::malformed_object("keyed archive $top has no root uid"))?;

    if top_uid >= objects.len() {
        return Err(VaultError::malformed_object(
            "keyed archive root uid outside $objects",
        ));
    }

    let mut builder = Rebuilder {
        graph,
        entries: objects,
        objects: vec![None; objects.len()],
        state: vec![State::Unvisited; objects.len()],
    };
    builder.ensure_rebuilt(top_uid, 0);

    let objects = builder
        .objects
        .into_iter()
        .map(|slot| slot.unwrap_or(DecodedValue::Null))
        .collect();

    Ok(ObjectGraph {
        objects,
        root: top_uid,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Unvisited,
    InProgress,
    Done,
}

/// Per-call reconstruction state: the new arena is indexed by `$objects`
/// position.
struct Rebuilder<'a> {
    graph: &'a ObjectGraph,
    entries: &'a [DecodedValue],
    objects: Vec<Option<DecodedValue>>,
    state: Vec<State>,
}

impl Rebuilder<'_> {
    /// Rebuilds the archived object at `uid` once, returning a `Ref` to it.
    ///
    /// `depth` counts archived-reference hops from the root; chains past
    /// [`MAX_DEPTH`] degrade to `Malformed` instead of recursing further.
    fn ensure_rebuilt(&mut self, uid: usize, depth: usize) -> DecodedValue {
        if depth > MAX_DEPTH {
            return DecodedValue::Malformed("archive nesting too deep".to_string());
        }
        match self.state[uid] {
            State::Done | State::InProgress => DecodedValue::Ref(uid),
            State::Unvisited => {
                self.state[uid] = State::InProgress;
                let raw = self.graph.follow(&self.entries[uid]).clone();
                let value = self.rebuild(&raw, depth);
                self.objects[uid] = Some(value);
                self.state[uid] = State::Done;
                DecodedValue::Ref(uid)
            }
        }
    }

    /// Rebuilds one archived value.
    fn rebuild(&mut self, raw: &DecodedValue, depth: usize) -> DecodedValue {
        match raw {
            // The conventional null placeholder at $objects[0].
            DecodedValue::String(s) if s == "$null" => DecodedValue::Null,

            DecodedValue::Dict(map) => {
                if map.contains_key("$class") {
                    self.rebuild_classed(map, depth)
                } else {
                    let rebuilt = map
                        .iter()
                        .map(|(k, v)| (k.clone(), self.transform(v, depth)))
                        .collect();
                    DecodedValue::Dict(rebuilt)
                }
            }

            DecodedValue::Array(items) => {
                DecodedValue::Array(items.iter().map(|v| self.transform(v, depth)).collect())
            }

            // Primitives and degraded nodes carry over unchanged.
            other => other.clone(),
        }
    }

    /// Rebuilds an archived object that carries `$class` metadata.
    fn rebuild_classed(
        &mut self,
        map: &BTreeMap<String, DecodedValue>,
        depth: usize,
    ) -> DecodedValue {
        let class_name = self.class_name(map);
        match class_name.as_deref() {
            Some("NSDate") => self
                .field(map, "NS.time")
                .and_then(|v| v.as_f64())
                .map_or_else(
                    || DecodedValue::Malformed("NSDate without NS.time".to_string()),
                    DecodedValue::Date,
                ),

            Some("NSData" | "NSMutableData") => self
                .field(map, "NS.data")
                .and_then(|v| v.as_bytes().map(<[u8]>::to_vec))
                .map_or_else(
                    || DecodedValue::Malformed("NSData without NS.data".to_string()),
                    DecodedValue::Bytes,
                ),

            Some("NSString" | "NSMutableString") => self
                .field(map, "NS.string")
                .and_then(|v| v.as_str().map(str::to_string))
                .map_or_else(
                    || DecodedValue::Malformed("NSString without NS.string".to_string()),
                    DecodedValue::String,
                ),

            // Ordered and unordered collections all come back as Array;
            // element order follows NS.objects.
            Some(
                "NSArray" | "NSMutableArray" | "NSSet" | "NSMutableSet" | "NSOrderedSet"
                | "NSMutableOrderedSet",
            ) => match self.field(map, "NS.objects") {
                Some(DecodedValue::Array(items)) => {
                    let items = items.clone();
                    DecodedValue::Array(items.iter().map(|v| self.transform(v, depth)).collect())
                }
                _ => DecodedValue::Malformed("collection without NS.objects".to_string()),
            },

            Some("NSDictionary" | "NSMutableDictionary") => {
                self.rebuild_dictionary(map, depth)
            }

            Some("NSNull") => DecodedValue::Null,

            // Unknown classes stay dictionaries; the resolved class name is
            // kept under "$class" so normalizers can still dispatch on it.
            Some(name) => {
                let name = name.to_string();
                let mut rebuilt: BTreeMap<String, DecodedValue> = map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "$class")
                    .map(|(k, v)| (k.clone(), self.transform(v, depth)))
                    .collect();
                rebuilt.insert("$class".to_string(), DecodedValue::String(name));
                DecodedValue::Dict(rebuilt)
            }

            None => DecodedValue::Malformed("unresolvable $class reference".to_string()),
        }
    }

    /// Rebuilds an archived `NSDictionary` from its parallel `NS.keys` /
    /// `NS.objects` arrays.
    fn rebuild_dictionary(
        &mut self,
        map: &BTreeMap<String, DecodedValue>,
        depth: usize,
    ) -> DecodedValue {
        let (Some(DecodedValue::Array(keys)), Some(DecodedValue::Array(values))) =
            (self.field(map, "NS.keys"), self.field(map, "NS.objects"))
        else {
            return DecodedValue::Malformed(
                "NSDictionary without NS.keys/NS.objects".to_string(),
            );
        };
        if keys.len() != values.len() {
            return DecodedValue::Malformed(
                "NSDictionary key/value arity mismatch".to_string(),
            );
        }
        let keys = keys.clone();
        let values = values.clone();

        let mut rebuilt = BTreeMap::new();
        for (key_ref, value_ref) in keys.iter().zip(&values) {
            let key_value = self.transform(key_ref, depth);
            let key = match self.materialized(&key_value) {
                DecodedValue::String(s) => s.clone(),
                DecodedValue::Int(i) => i.to_string(),
                DecodedValue::Real(r) => r.to_string(),
                DecodedValue::Bool(b) => b.to_string(),
                _ => {
                    trace!("archived dictionary key is not a string");
                    return DecodedValue::Malformed(
                        "non-string archived dictionary key".to_string(),
                    );
                }
            };
            rebuilt.insert(key, self.transform(value_ref, depth));
        }
        DecodedValue::Dict(rebuilt)
    }

    /// Transforms a value found inside an archived object: archive
    /// references become `Ref`s into the new arena, nested raw containers
    /// are transformed in place, primitives carry over. Each hop deepens
    /// the nesting count.
    fn transform(&mut self, value: &DecodedValue, depth: usize) -> DecodedValue {
        let followed = self.graph.follow(value).clone();
        match followed {
            DecodedValue::Uid(uid) => match usize::try_from(uid) {
                Ok(uid) if uid < self.entries.len() => self.ensure_rebuilt(uid, depth + 1),
                _ => DecodedValue::Malformed("uid outside $objects".to_string()),
            },
            DecodedValue::Array(items) => {
                DecodedValue::Array(items.iter().map(|v| self.transform(v, depth + 1)).collect())
            }
            DecodedValue::Dict(map) => {
                let rebuilt = map
                    .iter()
                    .map(|(k, v)| (k.clone(), self.transform(v, depth + 1)))
                    .collect();
                DecodedValue::Dict(rebuilt)
            }
            other => other,
        }
    }

    /// Resolves the `$class` reference of an archived object to its
    /// `$classname` string.
    fn class_name(&self, map: &BTreeMap<String, DecodedValue>) -> Option<String> {
        let class_ref = self.graph.follow(map.get("$class")?);
        let class_uid = match class_ref {
            DecodedValue::Uid(uid) => usize::try_from(*uid).ok()?,
            _ => return None,
        };
        let class_entry = self.graph.follow(self.entries.get(class_uid)?);
        self.graph
            .dict_get(class_entry, "$classname")
            .and_then(DecodedValue::as_str)
            .map(str::to_string)
    }

    /// Fetches a field of an archived object, following raw-graph `Ref`s
    /// (but not archive `Uid`s).
    fn field<'v>(
        &'v self,
        map: &'v BTreeMap<String, DecodedValue>,
        key: &str,
    ) -> Option<&'v DecodedValue> {
        map.get(key).map(|v| self.graph.follow(v))
    }

    /// Resolves a `Ref` into the new arena for key materialization.
    fn materialized<'v>(&'v self, value: &'v DecodedValue) -> &'v DecodedValue {
        match value {
            DecodedValue::Ref(index) => self
                .objects
                .get(*index)
                .and_then(Option::as_ref)
                .unwrap_or(value),
            other => other,
        }
    }
}

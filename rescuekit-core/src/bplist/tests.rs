use super::*;

/// Assembles a complete buffer from pre-encoded objects, with one-byte
/// offsets and references.
fn assemble(objects: &[Vec<u8>], root: u64) -> Vec<u8> {
    let mut buf = b"bplist00".to_vec();
    let mut offsets = Vec::new();
    for object in objects {
        offsets.push(u8::try_from(buf.len()).expect("small fixture"));
        buf.extend_from_slice(object);
    }
    let table_offset = buf.len() as u64;
    buf.extend_from_slice(&offsets);

    let mut trailer = [0u8; 32];
    trailer[6] = 1; // offset int size
    trailer[7] = 1; // object ref size
    trailer[8..16].copy_from_slice(&(objects.len() as u64).to_be_bytes());
    trailer[16..24].copy_from_slice(&root.to_be_bytes());
    trailer[24..32].copy_from_slice(&table_offset.to_be_bytes());
    buf.extend_from_slice(&trailer);
    buf
}

/// Encodes an ASCII string object, using the count escape above 14 chars.
fn ascii(text: &str) -> Vec<u8> {
    let len = u8::try_from(text.len()).expect("small fixture");
    let mut v = Vec::new();
    if len < 15 {
        v.push(0x50 | len);
    } else {
        v.extend_from_slice(&[0x5F, 0x10, len]);
    }
    v.extend_from_slice(text.as_bytes());
    v
}

fn int(value: u8) -> Vec<u8> {
    vec![0x10, value]
}

fn real(value: f64) -> Vec<u8> {
    let mut v = vec![0x23];
    v.extend_from_slice(&value.to_be_bytes());
    v
}

fn uid(value: u8) -> Vec<u8> {
    vec![0x80, value]
}

fn array(refs: &[u8]) -> Vec<u8> {
    assert!(refs.len() < 15);
    let mut v = vec![0xA0 | refs.len() as u8];
    v.extend_from_slice(refs);
    v
}

fn dict(pairs: &[(u8, u8)]) -> Vec<u8> {
    assert!(pairs.len() < 15);
    let mut v = vec![0xD0 | pairs.len() as u8];
    v.extend(pairs.iter().map(|(k, _)| *k));
    v.extend(pairs.iter().map(|(_, val)| *val));
    v
}

#[test]
fn test_decode_scalars_and_containers() {
    // {"count": 7, "flag": true, "items": [1.5, <DE AD>], "name": "abc"}
    let objects = vec![
        dict(&[(1, 5), (2, 6), (3, 7), (4, 8)]), // 0 root
        ascii("name"),                           // 1
        ascii("count"),                          // 2
        ascii("flag"),                           // 3
        ascii("items"),                          // 4
        ascii("abc"),                            // 5
        int(7),                                  // 6
        vec![0x09],                              // 7 true
        array(&[9, 10]),                         // 8
        real(1.5),                               // 9
        vec![0x42, 0xDE, 0xAD],                  // 10 data
    ];
    let buf = assemble(&objects, 0);
    let graph = decode(&buf).unwrap();

    let root = graph.root();
    assert_eq!(graph.dict_get(root, "name").unwrap().as_str(), Some("abc"));
    assert_eq!(graph.dict_get(root, "count").unwrap().as_i64(), Some(7));
    assert_eq!(
        graph.dict_get(root, "flag").unwrap(),
        &DecodedValue::Bool(true)
    );

    let items = graph.dict_get(root, "items").unwrap();
    let items: Vec<&DecodedValue> = graph.array_items(items).collect();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_f64(), Some(1.5));
    assert_eq!(items[1].as_bytes(), Some(&[0xDE, 0xAD][..]));
}

#[test]
fn test_decode_utf16_string_and_date() {
    let objects = vec![
        array(&[1, 2]),
        // "hé" as two UTF-16BE code units
        vec![0x62, 0x00, 0x68, 0x00, 0xE9],
        {
            let mut v = vec![0x33];
            v.extend_from_slice(&661_139_000.25_f64.to_be_bytes());
            v
        },
    ];
    let buf = assemble(&objects, 0);
    let graph = decode(&buf).unwrap();
    let items: Vec<&DecodedValue> = graph.array_items(graph.root()).collect();
    assert_eq!(items[0].as_str(), Some("hé"));
    assert_eq!(items[1], &DecodedValue::Date(661_139_000.25));
}

#[test]
fn test_cycle_resolves_to_shared_node() {
    // {"self": <root>} — the value reference points back at object 0.
    let objects = vec![dict(&[(1, 0)]), ascii("self")];
    let buf = assemble(&objects, 0);
    let graph = decode(&buf).unwrap();

    let root = graph.root();
    let via_cycle = graph.dict_get(root, "self").unwrap();
    // The back-reference resolves to the very same arena node.
    assert!(std::ptr::eq(root, via_cycle));
    assert!(via_cycle.as_dict().is_some());
}

#[test]
fn test_self_referential_array_terminates() {
    // A singleton array containing itself decodes to a one-element arena
    // whose child reference points back at the root.
    let buf = assemble(&[array(&[0])], 0);
    let graph = decode(&buf).unwrap();
    let root = graph.root();
    let items = root.as_array().unwrap();
    assert_eq!(items, &[DecodedValue::Ref(0)]);
    assert!(std::ptr::eq(root, graph.follow(&items[0])));
}

#[test]
fn test_decode_is_deterministic() {
    let objects = vec![dict(&[(1, 2)]), ascii("k"), int(9)];
    let buf = assemble(&objects, 0);
    let first = decode(&buf).unwrap();
    let second = decode(&buf).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_rejects_missing_magic() {
    assert!(matches!(
        decode(b"not a property list"),
        Err(VaultError::NotBinaryFormat)
    ));
    assert!(matches!(decode(b""), Err(VaultError::NotBinaryFormat)));
}

#[test]
fn test_rejects_truncated_trailer() {
    assert!(matches!(
        decode(b"bplist00trailerless"),
        Err(VaultError::MalformedObject { .. })
    ));
}

#[test]
fn test_rejects_root_outside_object_table() {
    let buf = assemble(&[int(1)], 5);
    assert!(matches!(
        decode(&buf),
        Err(VaultError::MalformedObject { .. })
    ));
}

#[test]
fn test_rejects_offset_outside_object_region() {
    let mut buf = assemble(&[int(1)], 0);
    // Point the single table entry past the object region.
    let table_offset = buf.len() - TRAILER_SIZE - 1;
    buf[table_offset] = 0xFF;
    assert!(matches!(
        decode(&buf),
        Err(VaultError::MalformedObject { .. })
    ));
}

#[test]
fn test_malformed_subobject_degrades_not_fails() {
    // [7, <unrecognized marker>] — only the second element degrades.
    let objects = vec![array(&[1, 2]), int(7), vec![0xE0]];
    let buf = assemble(&objects, 0);
    let graph = decode(&buf).unwrap();
    let items: Vec<&DecodedValue> = graph.array_items(graph.root()).collect();
    assert_eq!(items[0].as_i64(), Some(7));
    assert!(matches!(items[1], DecodedValue::Malformed(_)));
}

#[test]
fn test_raw_parse_keeps_uids() {
    let objects = vec![array(&[1]), uid(3)];
    let buf = assemble(&objects, 0);
    let graph = parse(&buf).unwrap();
    let items: Vec<&DecodedValue> = graph.array_items(graph.root()).collect();
    assert_eq!(items[0], &DecodedValue::Uid(3));
    assert!(!is_keyed_archive(&graph));
}

/// Builds a keyed-archive buffer whose archived root is an `NSDate`.
fn keyed_archive_date(seconds: f64) -> Vec<u8> {
    let objects = vec![
        dict(&[(5, 1), (6, 2), (7, 3), (8, 4)]), // 0 root
        ascii("NSKeyedArchiver"),                // 1
        array(&[9, 10, 11]),                     // 2 $objects
        dict(&[(12, 13)]),                       // 3 $top
        vec![0x12, 0x00, 0x01, 0x86, 0xA0],      // 4 100000
        ascii("$archiver"),                      // 5
        ascii("$objects"),                       // 6
        ascii("$top"),                           // 7
        ascii("$version"),                       // 8
        ascii("$null"),                          // 9
        dict(&[(16, 14), (17, 15)]),             // 10 archived NSDate
        dict(&[(20, 18), (21, 19)]),             // 11 class entry
        ascii("root"),                           // 12
        uid(1),                                  // 13
        uid(2),                                  // 14
        real(seconds),                           // 15
        ascii("$class"),                         // 16
        ascii("NS.time"),                        // 17
        ascii("NSDate"),                         // 18
        array(&[18]),                            // 19 $classes
        ascii("$classname"),                     // 20
        ascii("$classes"),                       // 21
    ];
    assemble(&objects, 0)
}

#[test]
fn test_keyed_archive_reconstructs_typed_values() {
    let buf = keyed_archive_date(12.5);
    let raw = parse(&buf).unwrap();
    assert!(is_keyed_archive(&raw));

    let graph = decode(&buf).unwrap();
    assert_eq!(graph.follow(graph.root()), &DecodedValue::Date(12.5));
}

#[test]
fn test_combined_containers_date_and_cycle() {
    // {"created": <date>, "owner": {"name": "ada", "parent": <root>},
    //  "tags": ["x", 7]} — one buffer exercising nested dict, array, date,
    // and a back-reference closing a cycle onto the root.
    let objects = vec![
        dict(&[(1, 4), (2, 5), (3, 6)]), // 0 root
        ascii("created"),                // 1
        ascii("owner"),                  // 2
        ascii("tags"),                   // 3
        {
            let mut v = vec![0x33];
            v.extend_from_slice(&700_000_000.5_f64.to_be_bytes());
            v
        }, // 4
        dict(&[(7, 9), (8, 0)]), // 5 owner, "parent" points back at root
        array(&[10, 11]),        // 6
        ascii("name"),           // 7
        ascii("parent"),         // 8
        ascii("ada"),            // 9
        ascii("x"),              // 10
        int(7),                  // 11
    ];
    let buf = assemble(&objects, 0);
    let graph = decode(&buf).unwrap();

    let root = graph.root();
    assert_eq!(
        graph.dict_get(root, "created"),
        Some(&DecodedValue::Date(700_000_000.5))
    );

    let owner = graph.dict_get(root, "owner").unwrap();
    assert_eq!(graph.dict_get(owner, "name").unwrap().as_str(), Some("ada"));
    let parent = graph.dict_get(owner, "parent").unwrap();
    assert!(std::ptr::eq(root, parent));

    let tags = graph.dict_get(root, "tags").unwrap();
    let tags: Vec<&DecodedValue> = graph.array_items(tags).collect();
    assert_eq!(tags[0].as_str(), Some("x"));
    assert_eq!(tags[1].as_i64(), Some(7));
}

#[test]
fn test_reconstruct_bounds_archived_reference_chains() {
    // A chain of archived NSArrays, each holding a reference to the next,
    // far longer than the nesting bound. Reconstruction must return with
    // the tail degraded in place rather than recursing per link.
    let chain = 4 * MAX_DEPTH;
    let class_uid = chain as u64 + 1;
    let mut entries = vec![DecodedValue::String("$null".to_string())];
    for link in 1..=chain {
        let next = if link == chain {
            Vec::new()
        } else {
            vec![DecodedValue::Uid(link as u64 + 1)]
        };
        let mut map = BTreeMap::new();
        map.insert("$class".to_string(), DecodedValue::Uid(class_uid));
        map.insert("NS.objects".to_string(), DecodedValue::Array(next));
        entries.push(DecodedValue::Dict(map));
    }
    let mut class_entry = BTreeMap::new();
    class_entry.insert(
        "$classname".to_string(),
        DecodedValue::String("NSArray".to_string()),
    );
    entries.push(DecodedValue::Dict(class_entry));

    let mut top = BTreeMap::new();
    top.insert("root".to_string(), DecodedValue::Uid(1));
    let mut root = BTreeMap::new();
    root.insert(
        "$archiver".to_string(),
        DecodedValue::String("NSKeyedArchiver".to_string()),
    );
    root.insert("$objects".to_string(), DecodedValue::Array(entries));
    root.insert("$top".to_string(), DecodedValue::Dict(top));

    let raw = ObjectGraph {
        objects: vec![DecodedValue::Dict(root)],
        root: 0,
    };
    assert!(is_keyed_archive(&raw));
    let graph = reconstruct(&raw).unwrap();

    // The head of the chain materializes normally.
    assert!(matches!(graph.follow(graph.root()), DecodedValue::Array(_)));
    // Past the bound the link degrades instead of recursing further.
    let degraded = (0..graph.len())
        .filter_map(|index| graph.get(index).as_array())
        .flat_map(<[DecodedValue]>::iter)
        .any(|item| matches!(item, DecodedValue::Malformed(_)));
    assert!(degraded);
}

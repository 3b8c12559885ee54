//! Tests for snapshots, deltas and storage

use ticktape_shared::{ItemType, UuidRegistry, calculate_uuid};

use super::*;

fn words_to_bytes(words: &[i32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn build(items: &[(u16, u16, &[i32])]) -> Snapshot {
    let mut builder = SnapshotBuilder::default();
    for &(item_type, id, payload) in items {
        builder
            .new_item(ItemType::Builtin(item_type), id, payload.len() * 4)
            .unwrap()
            .copy_from_slice(&words_to_bytes(payload));
    }
    builder.finish()
}

fn payload_words(snapshot: &Snapshot, key: i32) -> Vec<i32> {
    let index = snapshot.item_index(key).unwrap();
    snapshot.item(index).words().collect()
}

// ============================================================================
// Container
// ============================================================================

#[test]
fn test_builder_layout() {
    let snapshot = build(&[(1, 0, &[5]), (2, 7, &[1, 2])]);

    assert_eq!(snapshot.num_items(), 2);
    assert_eq!(snapshot.data_size(), 8 + 12);
    assert_eq!(snapshot.len(), 8 + 2 * 4 + 20);
    assert_eq!(
        &snapshot.as_bytes()[..16],
        &words_to_bytes(&[20, 2, 0, 8])[..]
    );

    let item = snapshot.item(1);
    assert_eq!(item.type_id(), 2);
    assert_eq!(item.id(), 7);
    assert_eq!(item.size(), 8);
    assert_eq!(snapshot.item_size(0), 4);
    assert_eq!(snapshot.crc(), 5 + 1 + 2);
    assert!(Snapshot::is_valid(snapshot.as_bytes()));
}

#[test]
fn test_empty_snapshot() {
    let snapshot = Snapshot::empty();
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.as_bytes(), &[0u8; 8]);
    assert!(Snapshot::is_valid(snapshot.as_bytes()));
    assert_eq!(snapshot.crc(), 0);
}

#[test]
fn test_is_valid_rejects_bad_headers() {
    assert!(!Snapshot::is_valid(&[]));
    assert!(!Snapshot::is_valid(&[0; 7]));
    // negative item count
    assert!(!Snapshot::is_valid(&words_to_bytes(&[0, -1])));
    // declared size larger than the buffer
    assert!(!Snapshot::is_valid(&words_to_bytes(&[8, 1, 0, 1 << 16])));
    // trailing garbage
    let mut bytes = build(&[(1, 0, &[5])]).into_bytes();
    bytes.push(0);
    assert!(!Snapshot::is_valid(&bytes));
}

#[test]
fn test_is_valid_rejects_bad_offsets() {
    // offset past the item area
    assert!(!Snapshot::is_valid(&words_to_bytes(&[8, 1, 12, 1 << 16, 5])));
    // negative offset
    assert!(!Snapshot::is_valid(&words_to_bytes(&[8, 1, -4, 1 << 16, 5])));
    // two items whose offsets leave no room for the second key
    assert!(!Snapshot::is_valid(&words_to_bytes(&[
        8,
        2,
        0,
        6,
        1 << 16,
        5
    ])));
    // decreasing offsets
    assert!(!Snapshot::is_valid(&words_to_bytes(&[
        8,
        2,
        4,
        0,
        1 << 16,
        2 << 16
    ])));
}

#[test]
fn test_is_valid_rejects_unaligned_items() {
    // offset 6 splits the item area into a 2-byte and a 6-byte item
    assert!(!Snapshot::is_valid(&words_to_bytes(&[
        12,
        2,
        0,
        6,
        1 << 16,
        5,
        2 << 16
    ])));
    // one item with a 5-byte payload
    let mut bytes = words_to_bytes(&[9, 1, 0, 1 << 16, 5]);
    bytes.push(0);
    assert!(!Snapshot::is_valid(&bytes));
    assert_eq!(
        Snapshot::from_bytes(bytes),
        Err(SnapshotError::Invalid { len: 21 })
    );
}

#[test]
fn test_from_bytes() {
    let snapshot = build(&[(3, 1, &[42])]);
    let copy = Snapshot::from_bytes(snapshot.as_bytes().to_vec()).unwrap();
    assert_eq!(copy, snapshot);
    assert_eq!(
        Snapshot::from_bytes(vec![1, 2, 3]),
        Err(SnapshotError::Invalid { len: 3 })
    );
}

#[test]
fn test_builder_limits() {
    let mut builder = SnapshotBuilder::default();
    assert_eq!(
        builder.new_item(ItemType::Builtin(1), 0, 6).unwrap_err(),
        SnapshotError::UnalignedSize(6)
    );
    assert_eq!(
        builder
            .new_item(ItemType::Builtin(OFFSET_UUID_TYPE as u16), 0, 4)
            .unwrap_err(),
        SnapshotError::InvalidType(OFFSET_UUID_TYPE as u16)
    );

    for id in 0..(MAX_ITEMS - 1) as u16 {
        builder.new_item(ItemType::Builtin(1), id, 0).unwrap();
    }
    assert!(matches!(
        builder.new_item(ItemType::Builtin(1), 0xffff, 0),
        Err(SnapshotError::Full { .. })
    ));

    let mut builder = SnapshotBuilder::default();
    assert!(matches!(
        builder.new_item(ItemType::Builtin(1), 0, MAX_SIZE),
        Err(SnapshotError::Full { .. })
    ));
}

#[test]
fn test_invalidate_item() {
    let mut snapshot = build(&[(1, 0, &[5]), (1, 1, &[6])]);
    snapshot.invalidate_item(0);
    assert_eq!(snapshot.item(0).key, -1);
    assert_eq!(snapshot.item_index(item_key(1, 0)), None);
    assert_eq!(snapshot.item_type(0, &UuidRegistry::new()), None);
    assert!(Snapshot::is_valid(snapshot.as_bytes()));
}

#[test]
fn test_extension_types() {
    let registry = UuidRegistry::with_names(["test@example", "other@example"]).unwrap();
    let test_type = ItemType::from_uuid(calculate_uuid("test@example"), &registry);
    let foreign = ItemType::Unknown(calculate_uuid("foreign@example"));

    let mut builder = SnapshotBuilder::new(&registry);
    builder
        .new_item(test_type, 3, 4)
        .unwrap()
        .copy_from_slice(&words_to_bytes(&[77]));
    builder.new_item(test_type, 4, 0).unwrap();
    builder.new_item(foreign, 1, 0).unwrap();
    builder.new_item(ItemType::Builtin(9), 1, 0).unwrap();
    let snapshot = builder.finish();

    // two type records plus four items
    assert_eq!(snapshot.num_items(), 6);
    let record = snapshot.item(0);
    assert_eq!(record.type_id(), 0);
    assert_eq!(record.id(), MAX_TYPE);
    assert_eq!(snapshot.item(1).type_id(), MAX_TYPE);

    assert_eq!(snapshot.item_type(1, &registry), Some(test_type));
    assert_eq!(snapshot.item_type(4, &registry), Some(foreign));
    assert_eq!(snapshot.item_type(5, &registry), Some(ItemType::Builtin(9)));
    assert_eq!(
        snapshot.find_item(test_type, 3, &registry),
        Some(&words_to_bytes(&[77])[..])
    );
    assert_eq!(snapshot.find_item(test_type, 9, &registry), None);
    assert!(snapshot.find_item(foreign, 1, &registry).is_some());
    assert!(
        snapshot
            .find_item(ItemType::Unknown(calculate_uuid("missing@example")), 1, &registry)
            .is_none()
    );
}

#[test]
fn test_extension_without_registry_is_unresolved() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let test_type = ItemType::from_uuid(calculate_uuid("test@example"), &registry);

    let mut builder = SnapshotBuilder::default();
    assert_eq!(
        builder.new_item(test_type, 0, 0).unwrap_err(),
        SnapshotError::UnresolvedType(test_type)
    );
}

#[test]
fn test_builder_reset_keeps_type_records() {
    let foreign = ItemType::Unknown(calculate_uuid("foreign@example"));
    let mut builder = SnapshotBuilder::default();
    builder.new_item(foreign, 1, 0).unwrap();
    builder.new_item(ItemType::Builtin(2), 1, 0).unwrap();
    assert_eq!(builder.num_items(), 3);

    builder.reset();
    assert_eq!(builder.num_items(), 1);
    builder.new_item(foreign, 2, 0).unwrap();
    let snapshot = builder.finish();
    assert_eq!(snapshot.num_items(), 2);
    assert_eq!(snapshot.item(1).type_id(), MAX_TYPE);
}

#[test]
fn test_too_many_extension_types() {
    let mut builder = SnapshotBuilder::default();
    for index in 0..MAX_EXTENDED_ITEM_TYPES {
        let uuid = calculate_uuid(&format!("ext-{index}@example"));
        builder.new_item(ItemType::Unknown(uuid), 0, 0).unwrap();
    }
    let uuid = calculate_uuid("one-too-many@example");
    assert_eq!(
        builder.new_item(ItemType::Unknown(uuid), 0, 0).unwrap_err(),
        SnapshotError::TooManyExtendedTypes
    );
}

// ============================================================================
// Delta
// ============================================================================

#[test]
fn test_delta_single_update() {
    let from = build(&[(1, 1, &[5])]);
    let to = build(&[(1, 1, &[9])]);
    let mut delta = SnapshotDelta::new();

    let packed = delta.create_delta(&from, &to).unwrap();
    assert_eq!(packed, words_to_bytes(&[0, 1, 0, 1, 1, 1, 4]));

    let rebuilt = delta.unpack_delta(&from, &packed).unwrap();
    assert_eq!(rebuilt, to);
    assert_eq!(delta.data_updates(1), 1);
    assert_eq!(delta.data_rate(1), 8);
}

#[test]
fn test_delta_identical_is_none() {
    let snapshot = build(&[(1, 0, &[5]), (2, 3, &[1, 2, 3])]);
    let delta = SnapshotDelta::new();
    assert_eq!(delta.create_delta(&snapshot, &snapshot), None);
}

#[test]
fn test_empty_delta_is_identity() {
    let snapshot = build(&[(1, 0, &[5]), (2, 3, &[1, 2, 3])]);
    let mut delta = SnapshotDelta::new();
    let rebuilt = delta.unpack_delta(&snapshot, delta.empty_delta()).unwrap();
    assert_eq!(rebuilt, snapshot);
}

#[test]
fn test_delta_deletes_inserts_and_updates() {
    let from = build(&[(1, 0, &[5]), (1, 1, &[6]), (4, 2, &[7, 8])]);
    let to = build(&[(1, 0, &[5]), (4, 2, &[7, -8]), (3, 9, &[1, 2, 3])]);
    let mut delta = SnapshotDelta::new();

    let packed = delta.create_delta(&from, &to).unwrap();
    let header: Vec<i32> = packed
        .chunks_exact(4)
        .take(4)
        .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    assert_eq!(header, [1, 2, 0, item_key(1, 1)]);

    let rebuilt = delta.unpack_delta(&from, &packed).unwrap();
    assert_eq!(rebuilt.num_items(), 3);
    assert_eq!(payload_words(&rebuilt, item_key(1, 0)), [5]);
    assert_eq!(payload_words(&rebuilt, item_key(4, 2)), [7, -8]);
    assert_eq!(payload_words(&rebuilt, item_key(3, 9)), [1, 2, 3]);
    assert_eq!(rebuilt.item_index(item_key(1, 1)), None);
    assert_eq!(rebuilt.crc(), to.crc());
}

#[test]
fn test_delta_wrapping_difference() {
    let from = build(&[(1, 0, &[i32::MAX])]);
    let to = build(&[(1, 0, &[i32::MIN])]);
    let mut delta = SnapshotDelta::new();
    let packed = delta.create_delta(&from, &to).unwrap();
    assert_eq!(delta.unpack_delta(&from, &packed).unwrap(), to);
}

#[test]
fn test_delta_resized_item() {
    let from = build(&[(1, 1, &[5])]);
    let to = build(&[(1, 1, &[9, 1])]);
    let mut delta = SnapshotDelta::new();

    let packed = delta.create_delta(&from, &to).unwrap();
    assert_eq!(
        packed,
        words_to_bytes(&[1, 1, 0, item_key(1, 1), 1, 1, 2, 9, 1])
    );
    assert_eq!(delta.unpack_delta(&from, &packed).unwrap(), to);

    // and back down again
    let packed = delta.create_delta(&to, &from).unwrap();
    assert_eq!(delta.unpack_delta(&to, &packed).unwrap(), from);
}

#[test]
fn test_delta_resized_item_keeps_position() {
    let from = build(&[(1, 0, &[1]), (2, 0, &[2]), (3, 0, &[3])]);
    let to = build(&[(1, 0, &[1]), (2, 0, &[2, 2, 2]), (3, 0, &[4])]);
    let mut delta = SnapshotDelta::new();

    let packed = delta.create_delta(&from, &to).unwrap();
    assert_eq!(delta.unpack_delta(&from, &packed).unwrap(), to);
}

#[test]
fn test_deleted_key_in_updates_is_copied_verbatim() {
    let from = build(&[(1, 1, &[5])]);
    let mut delta = SnapshotDelta::new();
    let packed = words_to_bytes(&[1, 1, 0, item_key(1, 1), 1, 1, 1, 7]);
    let rebuilt = delta.unpack_delta(&from, &packed).unwrap();
    assert_eq!(rebuilt, build(&[(1, 1, &[7])]));
}

#[test]
fn test_delta_static_size_omits_size_word() {
    let from = build(&[(1, 0, &[5, 5])]);
    let to = build(&[(1, 0, &[5, 6])]);
    let mut delta = SnapshotDelta::new();
    delta.set_static_size(1, 8);

    let packed = delta.create_delta(&from, &to).unwrap();
    assert_eq!(packed, words_to_bytes(&[0, 1, 0, 1, 0, 0, 1]));
    assert_eq!(delta.unpack_delta(&from, &packed).unwrap(), to);
    // one unchanged word and one single-byte difference
    assert_eq!(delta.data_rate(1), 1 + 8);
}

#[test]
fn test_unpack_errors() {
    let from = build(&[(1, 0, &[5])]);
    let mut delta = SnapshotDelta::new();

    let err = delta.unpack_delta(&from, &[0; 8]).unwrap_err();
    assert_eq!(err.code(), -1);

    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[4, 0, 0, 1]))
        .unwrap_err();
    assert_eq!(err, DeltaError::Truncated);

    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[0, 1, 0, 1]))
        .unwrap_err();
    assert_eq!(err, DeltaError::Truncated);

    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[0, 1, 0, 1, 0]))
        .unwrap_err();
    assert_eq!(err, DeltaError::MissingSize);
    assert_eq!(err.code(), -2);

    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[0, 1, 0, MAX_TYPE + 1, 0, 0]))
        .unwrap_err();
    assert_eq!(err, DeltaError::OutOfRange);
    assert_eq!(err.code(), -3);

    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[0, 1, 0, 2, 0, -1]))
        .unwrap_err();
    assert_eq!(err, DeltaError::OutOfRange);

    // payload runs past the end
    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[0, 1, 0, 2, 0, 3, 1]))
        .unwrap_err();
    assert_eq!(err, DeltaError::OutOfRange);

    // size differs from the existing item
    let err = delta
        .unpack_delta(&from, &words_to_bytes(&[0, 1, 0, 1, 0, 2, 1, 1]))
        .unwrap_err();
    assert_eq!(err, DeltaError::OutOfRange);
}

#[test]
fn test_unpack_builder_full() {
    let from = Snapshot::empty();
    let mut delta = SnapshotDelta::new();
    let words = [0, 1, 0, 1, 0, (MAX_SIZE / 4) as i32];
    let mut bytes = words_to_bytes(&words);
    bytes.resize(bytes.len() + MAX_SIZE, 0);

    let err = delta.unpack_delta(&from, &bytes).unwrap_err();
    assert!(matches!(err, DeltaError::BuilderFull(SnapshotError::Full { .. })));
    assert_eq!(err.code(), -4);
}

#[test]
fn test_delta_chain() {
    let mut delta = SnapshotDelta::new();
    let ticks = [
        build(&[(1, 0, &[0, 0])]),
        build(&[(1, 0, &[1, 0]), (2, 0, &[3])]),
        build(&[(2, 0, &[4])]),
        build(&[(2, 0, &[4]), (1, 0, &[9, 9])]),
    ];

    let mut current = Snapshot::empty();
    for snapshot in &ticks {
        let packed = delta
            .create_delta(&current, snapshot)
            .unwrap_or_else(|| EMPTY_DELTA.to_vec());
        current = delta.unpack_delta(&current, &packed).unwrap();
        assert_eq!(current.crc(), snapshot.crc());
        for item in snapshot.items() {
            let index = current.item_index(item.key).unwrap();
            assert_eq!(current.item(index).data, item.data);
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[test]
fn test_storage_purge_until() {
    let mut storage = SnapshotStorage::new();
    for tick in [10, 11, 12, 13] {
        storage.add(tick, tick as i64 * 20, &[tick as u8], &[]);
    }
    assert_eq!(storage.len(), 4);
    assert_eq!(storage.get(12).map(|s| s.snap.clone()), Some(vec![12]));
    assert_eq!(storage.get(12).and_then(|s| s.alt_snap.clone()), None);

    storage.purge_until(12);
    assert_eq!(storage.first().map(|s| s.tick), Some(12));
    assert_eq!(storage.last().map(|s| s.tick), Some(13));
    assert!(storage.get(11).is_none());

    storage.purge_until(100);
    assert!(storage.is_empty());
}

#[test]
fn test_storage_alt_snapshot_and_purge_all() {
    let mut storage = SnapshotStorage::new();
    storage.add(1, 0, &[1, 2], &[3, 4]);
    assert_eq!(storage.get(1).unwrap().alt_snap.as_deref(), Some(&[3u8, 4][..]));
    assert_eq!(storage.get(1).unwrap().tagtime, 0);

    storage.purge_all();
    assert!(storage.is_empty());
    assert!(storage.first().is_none());
}

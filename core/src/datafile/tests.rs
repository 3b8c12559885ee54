//! Tests for the datafile reader and writer

use std::io::Cursor;

use sha2::{Digest, Sha256};
use ticktape_shared::{ItemType, UuidRegistry, calculate_uuid};

use super::*;
use crate::config::DatafileConfig;

fn words(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn open<'r>(
    bytes: Vec<u8>,
    registry: &'r UuidRegistry,
) -> Result<DataFileReader<'r, Cursor<Vec<u8>>>, DatafileError> {
    DataFileReader::from_reader(Cursor::new(bytes), registry, &DatafileConfig::default())
}

fn set_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// A type-5 item, an item of the "test@example" extension and one blob.
fn scenario_file(registry: &UuidRegistry) -> Vec<u8> {
    let test_type = ItemType::from_uuid(calculate_uuid("test@example"), registry);
    let mut writer = DataFileWriter::new(Vec::new(), registry);
    writer
        .add_item(ItemType::Builtin(5), 0, &words(&[1, 2]))
        .unwrap();
    writer.add_item(test_type, 0, &words(&[3])).unwrap();
    let blob = writer
        .add_data(b"0123456789", CompressionLevel::Best)
        .unwrap();
    assert_eq!(blob, 0);
    writer.finish().unwrap()
}

// Offsets into `scenario_file`: 3 item types, 3 items, 1 blob.
const SCENARIO_ITEM_OFFSETS: usize = HEADER_SIZE + 3 * 12;
const SCENARIO_DATA_SIZES: usize = SCENARIO_ITEM_OFFSETS + 3 * 4 + 4;

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_scenario_items_and_blob() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let test_type = ItemType::from_uuid(calculate_uuid("test@example"), &registry);
    let mut reader = open(scenario_file(&registry), &registry).unwrap();

    assert_eq!(reader.version(), 4);
    // the extension record is stored as an item too
    assert_eq!(reader.num_items(), 3);
    let user_items: Vec<DataItem<'_>> = reader
        .items()
        .filter(|item| item.item_type != ItemType::Builtin(ITEMTYPE_EX))
        .collect();
    assert_eq!(user_items.len(), 2);

    assert_eq!(user_items[0].item_type, ItemType::Builtin(5));
    assert_eq!(user_items[0].data, &words(&[1, 2])[..]);
    assert_eq!(user_items[0].uuid, None);
    assert_eq!(user_items[1].item_type, test_type);
    assert_eq!(user_items[1].uuid, Some(calculate_uuid("test@example")));
    assert_eq!(user_items[1].data, &words(&[3])[..]);

    assert_eq!(reader.find_item(test_type, 0), Some(&words(&[3])[..]));
    assert_eq!(reader.find_item(ItemType::Builtin(5), 1), None);
    assert_eq!(reader.get_type(ItemType::Builtin(5)), 0..1);
    assert_eq!(reader.get_type(ItemType::Builtin(6)), 0..0);
    assert_eq!(reader.internal_item_type(test_type), Some(ITEMTYPE_EX - 1));

    assert_eq!(reader.num_data(), 1);
    assert_eq!(reader.data_size(0), 10);
    assert_eq!(reader.data(0), Some(&b"0123456789"[..]));
    assert_eq!(reader.data(1), None);
    assert_eq!(reader.data(-2), None);
}

#[test]
fn test_unregistered_extension_passes_through() {
    let writer_registry = UuidRegistry::new();
    let foreign = calculate_uuid("foreign@example");
    let mut writer = DataFileWriter::new(Vec::new(), &writer_registry);
    writer.add_item_uuid(foreign, 4, &words(&[8])).unwrap();
    writer
        .add_item_uuid(calculate_uuid("second@example"), 4, &words(&[9]))
        .unwrap();
    let bytes = writer.finish().unwrap();

    let registry = UuidRegistry::new();
    let reader = open(bytes, &registry).unwrap();
    let item = reader.item(reader.find_item_index(ItemType::Unknown(foreign), 4).unwrap());
    let item = item.unwrap();
    assert_eq!(item.item_type, ItemType::Unknown(foreign));
    assert_eq!(item.data, &words(&[8])[..]);
    assert_eq!(
        reader.find_item(ItemType::Unknown(calculate_uuid("second@example")), 4),
        Some(&words(&[9])[..])
    );
    assert_eq!(
        reader.internal_item_type(ItemType::Unknown(calculate_uuid("second@example"))),
        Some(ITEMTYPE_EX - 2)
    );
}

#[test]
fn test_items_grouped_by_type() {
    let registry = UuidRegistry::new();
    let mut writer = DataFileWriter::new(Vec::new(), &registry);
    writer.add_item(ItemType::Builtin(3), 0, &words(&[30])).unwrap();
    writer.add_item(ItemType::Builtin(1), 0, &words(&[10])).unwrap();
    writer.add_item(ItemType::Builtin(3), 1, &words(&[31])).unwrap();
    writer.add_item(ItemType::Builtin(1), 1, &[]).unwrap();
    let reader = open(writer.finish().unwrap(), &registry).unwrap();

    let order: Vec<(ItemType, u16)> = reader.items().map(|i| (i.item_type, i.id)).collect();
    assert_eq!(
        order,
        [
            (ItemType::Builtin(1), 0),
            (ItemType::Builtin(1), 1),
            (ItemType::Builtin(3), 0),
            (ItemType::Builtin(3), 1),
        ]
    );
    assert_eq!(reader.item_size(1), Some(0));
    assert_eq!(reader.item_size(4), None);
    assert_eq!(reader.get_type(ItemType::Builtin(3)), 2..4);
}

#[test]
fn test_strings_and_words() {
    let registry = UuidRegistry::new();
    let mut writer = DataFileWriter::new(Vec::new(), &registry);
    assert_eq!(writer.add_data_string("").unwrap(), None);
    let hello = writer.add_data_string("hello").unwrap().unwrap();
    let interior = writer.add_data(b"ab\0c\0", CompressionLevel::Default).unwrap();
    let unterminated = writer.add_data(b"abc", CompressionLevel::Default).unwrap();
    let not_utf8 = writer.add_data(&[0xff, 0], CompressionLevel::Default).unwrap();
    let numbers = writer.add_data_words(&[1, -2]).unwrap();
    let mut reader = open(writer.finish().unwrap(), &registry).unwrap();

    assert_eq!(reader.data_string(hello), Some("hello"));
    assert_eq!(reader.data_string(-1), Some(""));
    assert_eq!(reader.data_string(interior), None);
    assert_eq!(reader.data_string(unterminated), None);
    assert_eq!(reader.data_string(not_utf8), None);
    assert_eq!(reader.data_string(99), None);
    assert_eq!(reader.data_words(numbers), Some(vec![1, -2]));
}

#[test]
fn test_writer_rejects_bad_input() {
    let registry = UuidRegistry::new();
    let mut writer = DataFileWriter::new(Vec::new(), &registry);
    assert!(matches!(
        writer.add_item(ItemType::Builtin(1), 0, &[1, 2, 3]),
        Err(DatafileError::UnalignedItem(3))
    ));
    assert!(matches!(
        writer.add_data(&[], CompressionLevel::Best),
        Err(DatafileError::EmptyData)
    ));

    let other = UuidRegistry::with_names(["x@example"]).unwrap();
    let slot_type = ItemType::from_uuid(calculate_uuid("x@example"), &other);
    assert!(matches!(
        writer.add_item(slot_type, 0, &[]),
        Err(DatafileError::UnresolvedType(_))
    ));
}

#[test]
fn test_empty_datafile() {
    let registry = UuidRegistry::new();
    let bytes = DataFileWriter::new(Vec::new(), &registry).finish().unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE);

    let mut reader = open(bytes, &registry).unwrap();
    assert_eq!(reader.num_items(), 0);
    assert_eq!(reader.num_data(), 0);
    assert!(reader.item(0).is_none());
    assert_eq!(reader.data(0), None);
}

#[test]
fn test_file_on_disk_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.map");
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();

    let mut writer = DataFileWriter::create(&path, &registry).unwrap();
    writer.add_item(ItemType::Builtin(1), 2, &words(&[3])).unwrap();
    writer.add_data(&[7; 100], CompressionLevel::Default).unwrap();
    writer.finish().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let mut reader = DataFileReader::open(&path, &registry, &DatafileConfig::default()).unwrap();
    assert_eq!(reader.file_size(), bytes.len() as u64);
    assert_eq!(reader.crc(), crc32fast::hash(&bytes));
    assert_eq!(reader.sha256().as_slice(), Sha256::digest(&bytes).as_slice());
    assert_eq!(reader.data(0), Some(&[7u8; 100][..]));
}

// ============================================================================
// Blob state
// ============================================================================

#[test]
fn test_failed_blob_is_not_retried() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let mut bytes = scenario_file(&registry);
    let len = bytes.len();
    let data_size = i32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]) as usize;
    bytes[len - data_size..].fill(0xff);

    let mut reader = open(bytes, &registry).unwrap();
    assert_eq!(reader.data_size(0), 10);
    assert_eq!(reader.data(0), None);
    assert_eq!(reader.data_size(0), 0);
    assert_eq!(reader.data(0), None);

    reader.unload_data(0);
    assert_eq!(reader.data_size(0), 10);

    reader.replace_data(0, b"patched".to_vec()).unwrap();
    assert_eq!(reader.data(0), Some(&b"patched"[..]));
    assert_eq!(reader.data_size(0), 7);
    assert!(matches!(
        reader.replace_data(5, Vec::new()),
        Err(DatafileError::InvalidIndex(5))
    ));
}

#[test]
fn test_zero_sized_blob_opens_but_fails_to_load() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let mut bytes = scenario_file(&registry);
    set_i32(&mut bytes, SCENARIO_DATA_SIZES, 0);

    let mut reader = open(bytes, &registry).unwrap();
    assert_eq!(reader.num_items(), 3);
    assert_eq!(reader.data(0), None);
}

#[test]
fn test_unload_and_reload() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let mut reader = open(scenario_file(&registry), &registry).unwrap();
    assert!(reader.data(0).is_some());
    reader.unload_data(0);
    reader.unload_data(42);
    assert_eq!(reader.data(0), Some(&b"0123456789"[..]));
}

// ============================================================================
// Version 3 and header fix-ups
// ============================================================================

/// One item of type 2 / id 7 and one raw blob, in the uncompressed layout.
fn v3_file() -> Vec<u8> {
    let blob = b"abc\0";
    let directory = 12 + 4 + 4 + 12;
    let file_size = HEADER_SIZE + directory + blob.len();

    let mut out = Vec::new();
    out.extend_from_slice(b"DATA");
    for value in [
        3,
        file_size as i32 - 16,
        (file_size - blob.len()) as i32 - 16,
        1,
        1,
        1,
        12,
        blob.len() as i32,
    ] {
        out.extend_from_slice(&value.to_le_bytes());
    }
    // type directory, item offset, data offset
    out.extend_from_slice(&words(&[2, 0, 1, 0, 0]));
    out.extend_from_slice(&((2u32 << 16) | 7).to_le_bytes());
    out.extend_from_slice(&words(&[4, 99]));
    out.extend_from_slice(blob);
    assert_eq!(out.len(), file_size);
    out
}

#[test]
fn test_version_3_blobs_are_raw() {
    let registry = UuidRegistry::new();
    let mut reader = open(v3_file(), &registry).unwrap();
    assert_eq!(reader.version(), 3);
    assert_eq!(reader.find_item(ItemType::Builtin(2), 7), Some(&words(&[99])[..]));
    assert_eq!(reader.data_size(0), 4);
    assert_eq!(reader.data_string(0), Some("abc"));
}

#[test]
fn test_legacy_magic_accepted() {
    let registry = UuidRegistry::new();
    let mut bytes = v3_file();
    bytes[..4].copy_from_slice(b"ATAD");
    assert!(open(bytes, &registry).is_ok());
}

#[test]
fn test_header_size_fix() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let mut bytes = scenario_file(&registry);
    let size = i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let swaplen = i32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    set_i32(&mut bytes, 8, size - 4);
    set_i32(&mut bytes, 12, swaplen - 4);

    let reader = open(bytes, &registry).unwrap();
    assert_eq!(reader.header().size, size);
    assert_eq!(reader.header().swaplen, swaplen);
}

// ============================================================================
// Rejection
// ============================================================================

#[test]
fn test_rejects_bad_header() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let good = scenario_file(&registry);

    assert!(matches!(
        open(good[..10].to_vec(), &registry),
        Err(DatafileError::Truncated { .. })
    ));

    let mut bytes = good.clone();
    bytes[..4].copy_from_slice(b"XXXX");
    assert!(matches!(open(bytes, &registry), Err(DatafileError::BadMagic(_))));

    let mut bytes = good.clone();
    set_i32(&mut bytes, 4, 5);
    assert!(matches!(
        open(bytes, &registry),
        Err(DatafileError::UnsupportedVersion(5))
    ));

    let mut bytes = good.clone();
    set_i32(&mut bytes, 20, -1);
    assert!(matches!(
        open(bytes, &registry),
        Err(DatafileError::InvalidHeader(_))
    ));

    let mut bytes = good.clone();
    bytes.pop();
    assert!(matches!(
        open(bytes, &registry),
        Err(DatafileError::InvalidHeader(_))
    ));

    let mut bytes = good;
    let size = i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    set_i32(&mut bytes, 8, size + 1);
    assert!(matches!(
        open(bytes, &registry),
        Err(DatafileError::InvalidHeader(_))
    ));
}

#[test]
fn test_rejects_bad_directory() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let good = scenario_file(&registry);

    // item offsets must increase
    let mut bytes = good.clone();
    set_i32(&mut bytes, SCENARIO_ITEM_OFFSETS + 4, 0);
    assert!(matches!(open(bytes, &registry), Err(DatafileError::Invalid(_))));

    // type directory start must match the running count
    let mut bytes = good.clone();
    set_i32(&mut bytes, HEADER_SIZE + 4, 1);
    assert!(matches!(open(bytes, &registry), Err(DatafileError::Invalid(_))));

    // negative blob size
    let mut bytes = good;
    set_i32(&mut bytes, SCENARIO_DATA_SIZES, -1);
    assert!(matches!(open(bytes, &registry), Err(DatafileError::Invalid(_))));
}

#[test]
fn test_rejects_duplicate_ids() {
    let registry = UuidRegistry::new();
    let mut writer = DataFileWriter::new(Vec::new(), &registry);
    writer.add_item(ItemType::Builtin(1), 3, &[]).unwrap();
    writer.add_item(ItemType::Builtin(1), 3, &[]).unwrap();
    let bytes = writer.finish().unwrap();
    assert!(matches!(open(bytes, &registry), Err(DatafileError::Invalid(_))));
}

#[test]
fn test_rejects_oversized_directory() {
    let registry = UuidRegistry::with_names(["test@example"]).unwrap();
    let config = DatafileConfig {
        max_alloc_size: 16,
        ..DatafileConfig::default()
    };
    let result =
        DataFileReader::from_reader(Cursor::new(scenario_file(&registry)), &registry, &config);
    assert!(matches!(result, Err(DatafileError::TooLarge { .. })));
}

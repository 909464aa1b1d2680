use vudo_runtime::{Error, FieldType, FieldValue, GeneLayout, LoadOptions, Record};

mod common;

#[test]
fn test_string_round_trip() {
    let mut spirit = common::load(common::EMPTY_WAT);

    for text in ["", "hello", "héllo wörld", "日本語", "emoji 🦀 and 𝄞"] {
        let address = spirit.write_string(text).unwrap();
        assert_eq!(address % 4, 0);
        assert_eq!(spirit.read_string(address).unwrap(), text);
    }
}

#[test]
fn test_string_encoding_is_length_prefixed() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();

    let address = spirit.write_string("abc").unwrap();
    let raw = manager.read_bytes(spirit.store(), address, 7).unwrap();
    assert_eq!(raw, [3, 0, 0, 0, b'a', b'b', b'c']);
}

#[test]
fn test_allocations_do_not_overlap() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();

    let first = manager.alloc(spirit.store_mut(), 10).unwrap();
    let second = manager.alloc(spirit.store_mut(), 10).unwrap();
    let third = manager.alloc_aligned(spirit.store_mut(), 3, 16).unwrap();

    assert_eq!(first, 1024);
    assert_eq!(second % 8, 0);
    assert!(second >= first + 10);
    assert_eq!(third % 16, 0);
    assert!(third >= second + 10);
}

#[test]
fn test_heap_base_is_configurable() {
    let mut spirit = common::load_with(
        common::EMPTY_WAT,
        &LoadOptions::default().with_heap_base(4096),
    );
    let manager = spirit.memory_manager();
    assert_eq!(manager.alloc(spirit.store_mut(), 1).unwrap(), 4096);
}

#[test]
fn test_reset_reuses_heap() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();

    let before = manager.alloc(spirit.store_mut(), 64).unwrap();
    manager.alloc(spirit.store_mut(), 64).unwrap();
    assert_eq!(manager.generation(spirit.store()), 0);

    spirit.reset_memory();
    assert_eq!(manager.cursor(spirit.store()), 1024);
    assert_eq!(manager.generation(spirit.store()), 1);
    assert_eq!(manager.alloc(spirit.store_mut(), 64).unwrap(), before);
}

#[test]
fn test_memory_grows_on_demand() {
    let mut spirit = common::load_with(
        common::EMPTY_WAT,
        &LoadOptions::default().with_memory(1, 4),
    );
    let manager = spirit.memory_manager();
    assert_eq!(manager.size(spirit.store()), 65536);

    let address = manager.alloc(spirit.store_mut(), 100_000).unwrap();
    assert!(manager.size(spirit.store()) >= address as u64 + 100_000);
    assert_eq!(manager.size(spirit.store()) % 65536, 0);
}

#[test]
fn test_allocation_past_maximum_fails() {
    let mut spirit = common::load_with(
        common::EMPTY_WAT,
        &LoadOptions::default().with_memory(1, 2),
    );
    let manager = spirit.memory_manager();

    let err = manager.alloc(spirit.store_mut(), 200_000).unwrap_err();
    assert!(matches!(err, Error::Allocation { requested: 200_000, .. }));

    // The failed request leaves the cursor untouched.
    assert_eq!(manager.cursor(spirit.store()), 1024);
    assert_eq!(manager.size(spirit.store()), 65536);
}

#[test]
fn test_out_of_bounds_read() {
    let spirit = common::load_with(
        common::EMPTY_WAT,
        &LoadOptions::default().with_memory(1, 1),
    );
    let manager = spirit.memory_manager();

    let err = manager.read_bytes(spirit.store(), 65530, 16).unwrap_err();
    assert!(matches!(err, Error::MemoryAccess { address: 65530, .. }));
    assert!(spirit.read_string(65534).is_err());
}

#[test]
fn test_record_round_trip() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();
    let layout = GeneLayout::new(
        "Account",
        [
            ("active", FieldType::Bool),
            ("balance", FieldType::I64),
            ("rate", FieldType::F32),
            ("score", FieldType::F64),
            ("owner", FieldType::String),
            ("id", FieldType::I32),
        ],
    )
    .unwrap();

    let owner = spirit.write_string("Mami Wata").unwrap();
    let address = manager.alloc_record(spirit.store_mut(), &layout).unwrap();
    assert_eq!(address % layout.alignment(), 0);

    let mut values = Record::new();
    values.insert("active".into(), FieldValue::Bool(false));
    values.insert("balance".into(), FieldValue::I64(9_007_199_254_740_993));
    values.insert("rate".into(), FieldValue::F32(0.25));
    values.insert("score".into(), FieldValue::F64(-1.5));
    values.insert("owner".into(), FieldValue::Address(owner));
    values.insert("id".into(), FieldValue::I32(-7));
    manager
        .write_record(spirit.store_mut(), address, &values, &layout)
        .unwrap();

    let record = manager.read_record(spirit.store(), address, &layout).unwrap();
    assert_eq!(record["active"], FieldValue::Bool(false));
    assert_eq!(record["balance"], FieldValue::I64(9_007_199_254_740_993));
    assert_eq!(record["rate"], FieldValue::F32(0.25));
    assert_eq!(record["score"], FieldValue::F64(-1.5));
    assert_eq!(record["owner"], FieldValue::Str("Mami Wata".to_string()));
    assert_eq!(record["id"], FieldValue::I32(-7));
}

#[test]
fn test_record_null_string_reads_empty() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();
    let layout = GeneLayout::new("Named", [("name", FieldType::String)]).unwrap();

    let address = manager.alloc_record(spirit.store_mut(), &layout).unwrap();
    let mut values = Record::new();
    values.insert("name".into(), FieldValue::Address(0));
    manager
        .write_record(spirit.store_mut(), address, &values, &layout)
        .unwrap();

    let record = manager.read_record(spirit.store(), address, &layout).unwrap();
    assert_eq!(record["name"], FieldValue::Str(String::new()));
}

#[test]
fn test_record_write_rejects_bad_values() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();
    let layout =
        GeneLayout::new("Point", [("x", FieldType::I32), ("y", FieldType::I32)]).unwrap();
    let address = manager.alloc_record(spirit.store_mut(), &layout).unwrap();

    let mut missing = Record::new();
    missing.insert("x".into(), FieldValue::I32(1));
    let err = manager
        .write_record(spirit.store_mut(), address, &missing, &layout)
        .unwrap_err();
    assert!(matches!(err, Error::Field { ref field, .. } if field == "y"));

    let mut mismatched = Record::new();
    mismatched.insert("x".into(), FieldValue::I32(1));
    mismatched.insert("y".into(), FieldValue::Str("two".into()));
    let err = manager
        .write_record(spirit.store_mut(), address, &mismatched, &layout)
        .unwrap_err();
    assert!(matches!(err, Error::Field { ref field, .. } if field == "y"));
}

#[test]
fn test_rejected_record_leaves_memory_untouched() {
    let mut spirit = common::load(common::EMPTY_WAT);
    let manager = spirit.memory_manager();
    let layout =
        GeneLayout::new("Point", [("x", FieldType::I32), ("y", FieldType::I32)]).unwrap();
    let address = manager.alloc_record(spirit.store_mut(), &layout).unwrap();

    let mut good = Record::new();
    good.insert("x".into(), FieldValue::I32(5));
    good.insert("y".into(), FieldValue::I32(6));
    manager
        .write_record(spirit.store_mut(), address, &good, &layout)
        .unwrap();

    let mut bad = Record::new();
    bad.insert("x".into(), FieldValue::I32(99));
    bad.insert("y".into(), FieldValue::Bool(true));
    let err = manager
        .write_record(spirit.store_mut(), address, &bad, &layout)
        .unwrap_err();
    assert!(matches!(err, Error::Field { ref field, .. } if field == "y"));

    let record = manager.read_record(spirit.store(), address, &layout).unwrap();
    assert_eq!(record["x"], FieldValue::I32(5));
    assert_eq!(record["y"], FieldValue::I32(6));

    // Straddling the end of memory: x would fit, y would not.
    let tail = (manager.size(spirit.store()) - 4) as u32;
    let err = manager
        .write_record(spirit.store_mut(), tail, &good, &layout)
        .unwrap_err();
    assert!(matches!(err, Error::MemoryAccess { address, .. } if address == tail));
    assert_eq!(
        manager.read_bytes(spirit.store(), tail, 4).unwrap(),
        [0, 0, 0, 0]
    );
}

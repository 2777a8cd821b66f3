use umbrad_storage::memory::MemoryStore;
use umbrad_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn column_names_are_unique() {
    for (i, a) in Column::ALL.iter().enumerate() {
        assert_eq!(a.index(), i);
        for b in Column::ALL.iter().skip(i + 1) {
            assert_ne!(a.as_str(), b.as_str());
        }
    }
}

#[test]
fn memory_store_round_trip() {
    let store = MemoryStore::new();
    store
        .put(Column::BlockIndex, b"key", b"value")
        .expect("put");
    assert_eq!(
        store.get(Column::BlockIndex, b"key").expect("get"),
        Some(b"value".to_vec())
    );
    // Same key, different column, stays independent.
    assert_eq!(store.get(Column::Meta, b"key").expect("get"), None);
    store.delete(Column::BlockIndex, b"key").expect("delete");
    assert_eq!(store.get(Column::BlockIndex, b"key").expect("get"), None);
}

#[test]
fn batch_applies_atomically_in_order() {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"tip", b"a");
    batch.put(Column::Meta, b"tip", b"b");
    batch.put(Column::Nullifier, [7u8; 32], b"x");
    batch.delete(Column::Nullifier, [7u8; 32]);
    store.write_batch(&batch).expect("write batch");

    assert_eq!(
        store.get(Column::Meta, b"tip").expect("get"),
        Some(b"b".to_vec())
    );
    assert_eq!(store.get(Column::Nullifier, &[7u8; 32]).expect("get"), None);
}

#[test]
fn scan_prefix_filters_by_prefix() {
    let store = MemoryStore::new();
    store.put(Column::HeightIndex, b"aa1", b"1").expect("put");
    store.put(Column::HeightIndex, b"aa2", b"2").expect("put");
    store.put(Column::HeightIndex, b"bb1", b"3").expect("put");
    let results = store.scan_prefix(Column::HeightIndex, b"aa").expect("scan");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(key, _)| key.starts_with(b"aa")));
}

#[cfg(feature = "fjall")]
#[test]
fn fjall_store_smoke() {
    use umbrad_storage::fjall::FjallStore;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open");
    let mut batch = WriteBatch::new();
    batch.put(Column::BlockIndex, [1u8; 32], b"block bytes");
    batch.put(Column::HeightIndex, 1u32.to_be_bytes(), [1u8; 32]);
    store.write_batch(&batch).expect("write batch");
    assert_eq!(
        store.get(Column::BlockIndex, &[1u8; 32]).expect("get"),
        Some(b"block bytes".to_vec())
    );
    store.persist().expect("persist");
}

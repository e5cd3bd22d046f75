use crate::{Cache, CacheConfig, CacheError, CacheErrorCode, CacheOps, CreateOpts, TxLevel};
use rusqlite::types::Value;

fn memory_cache() -> Cache {
    Cache::open(CacheConfig::default().with_memory()).expect("open")
}

#[test]
fn put_read_all_round_trips() {
    let cache = memory_cache();
    cache.put("greeting", b"hello world").expect("put");
    let back = cache.read_all("greeting", Vec::new()).expect("read");
    assert_eq!(back, b"hello world");

    // Overwrite with a different length.
    cache.put("greeting", b"bye").expect("overwrite");
    let back = cache.read_all("greeting", back).expect("read");
    assert_eq!(back, b"bye");
    cache.close().expect("close");
}

#[test]
fn read_of_missing_key_is_not_found() {
    let cache = memory_cache();
    let err = cache
        .read_all("nope", Vec::new())
        .expect_err("missing key");
    assert_eq!(err.code(), CacheErrorCode::NotFound);
    cache.close().expect("close");
}

#[test]
fn second_delete_is_not_found() {
    let cache = memory_cache();
    cache.put("k", b"v").expect("put");
    cache.delete("k").expect("first delete");
    let err = cache.delete("k").expect_err("second delete");
    assert!(matches!(err, CacheError::NotFound));
    cache.close().expect("close");
}

#[test]
fn operations_after_close_fail_closed() {
    let cache = memory_cache();
    cache.close().expect("close");
    assert!(cache.is_closed());
    let err = cache.put("k", b"v").expect_err("put after close");
    assert_eq!(err.code(), CacheErrorCode::Closed);
}

#[test]
fn read_full_requires_the_full_buffer() {
    let cache = memory_cache();
    cache.put("k", b"abc").expect("put");
    let mut exact = [0u8; 3];
    assert_eq!(cache.read_full("k", &mut exact).expect("read"), 3);
    assert_eq!(&exact, b"abc");

    let mut too_big = [0u8; 4];
    let err = cache.read_full("k", &mut too_big).expect_err("short value");
    assert_eq!(err.code(), CacheErrorCode::Io);
    cache.close().expect("close");
}

// The point of the trait: helpers written once compose the single-shot
// facade and an open transaction equally.
fn stamp_and_read<C: CacheOps>(store: &C, key: &str) -> Result<Vec<u8>, CacheError> {
    store.set_tag(key, "stamped", 1i64)?;
    store.read_all(key, Vec::new())
}

#[test]
fn cache_ops_composes_facade_and_transaction() {
    let cache = memory_cache();
    cache.put("k", b"payload").expect("put");

    let via_cache = stamp_and_read(&cache, "k").expect("via facade");
    assert_eq!(via_cache, b"payload");

    let via_tx = cache
        .run_tx(TxLevel::Immediate, |tx| stamp_and_read(tx, "k"))
        .expect("via tx");
    assert_eq!(via_tx, b"payload");

    let tag = cache.get_tag("k", "stamped").expect("tag");
    assert_eq!(tag, Some(Value::Integer(1)));
    cache.close().expect("close");
}

#[test]
fn tx_scope_sees_its_own_writes() {
    let cache = memory_cache();
    cache
        .run_tx(TxLevel::Immediate, |tx| {
            tx.put("a", b"one")?;
            let back = tx.read_all("a", Vec::new())?;
            assert_eq!(back, b"one");
            tx.put("b", b"two")?;
            Ok(())
        })
        .expect("tx");
    assert_eq!(cache.read_all("b", Vec::new()).expect("read"), b"two");
    cache.close().expect("close");
}

#[test]
fn blob_ref_without_length_cannot_create() {
    let cache = memory_cache();
    let blob = cache.blob_ref("absent");
    let err = blob.write_at(b"x", 0).expect_err("no length to create at");
    assert_eq!(err.code(), CacheErrorCode::NotFound);
    cache.close().expect("close");
}

#[test]
fn blob_with_length_creates_on_first_write() {
    let cache = memory_cache();
    let blob = cache.blob_with_length("lazy", 4);
    assert_eq!(blob.write_at(b"abcd", 0).expect("write"), 4);
    assert_eq!(blob.length().expect("length"), 4);
    let mut back = [0u8; 4];
    assert_eq!(blob.read_at(&mut back, 0).expect("read"), 4);
    assert_eq!(&back, b"abcd");
    cache.close().expect("close");
}

#[test]
fn pinned_task_create_write_then_read_back() {
    let cache = memory_cache();
    let mut writer = cache.create("big", CreateOpts { length: 8 }).expect("create");
    assert_eq!(writer.length(), 8);
    assert_eq!(writer.write_at(b"01234567", 0).expect("write"), 8);
    writer.close().expect("commit");

    let mut reader = cache.open_pinned_read_only("big").expect("open");
    let mut buf = [0u8; 5];
    assert_eq!(reader.read_at(&mut buf, 3).expect("read"), 5);
    assert_eq!(&buf, b"34567");
    reader.close().expect("close");
    cache.close().expect("close");
}

#[test]
fn pinned_task_open_missing_key_fails() {
    let cache = memory_cache();
    let err = cache
        .open_pinned_read_only("missing")
        .expect_err("missing key");
    assert_eq!(err.code(), CacheErrorCode::NotFound);
    cache.close().expect("close");
}

#[test]
fn capacity_is_readable_through_the_facade() {
    let cache = memory_cache();
    assert_eq!(cache.get_capacity().expect("read"), None);
    cache.close().expect("close");

    let cache = Cache::open(
        CacheConfig::default()
            .with_memory()
            .with_capacity(1 << 20),
    )
    .expect("open");
    assert_eq!(cache.get_capacity().expect("read"), Some(1 << 20));
    cache.close().expect("close");
}

//! End-to-end scenarios against the public engine API, on-disk.

use std::sync::Arc;

use sluicedb::{Database, FsDirectory, Options};

fn disk_options(dir: &tempfile::TempDir) -> Options {
    Options {
        dir: Some(Arc::new(FsDirectory::new(dir.path()).unwrap())),
        ..Options::default()
    }
}

#[test]
fn basic_kv_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open("basic", disk_options(&tmp)).unwrap();

    db.put(b"key1", b"value1").unwrap();
    db.put(b"key2", b"value2").unwrap();
    db.put(b"key3", b"value3").unwrap();

    assert_eq!(db.get(b"key1").unwrap().unwrap(), b"value1");
    assert_eq!(db.get(b"key2").unwrap().unwrap(), b"value2");
    assert_eq!(db.get(b"key3").unwrap().unwrap(), b"value3");
}

#[test]
fn delete_semantics() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open("del", disk_options(&tmp)).unwrap();

    db.put(b"key1", b"value1").unwrap();
    db.put(b"key2", b"value2").unwrap();
    db.put(b"key3", b"value3").unwrap();
    db.del(b"key2").unwrap();

    assert_eq!(db.get(b"key1").unwrap().unwrap(), b"value1");
    assert!(db.get(b"key2").unwrap().is_none());
    assert_eq!(db.get(b"key3").unwrap().unwrap(), b"value3");
}

#[test]
fn put_and_del_are_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open("idem", disk_options(&tmp)).unwrap();

    db.put(b"k", b"v").unwrap();
    db.put(b"k", b"v").unwrap();
    assert_eq!(db.get(b"k").unwrap().unwrap(), b"v");

    db.del(b"k").unwrap();
    db.del(b"k").unwrap();
    assert!(db.get(b"k").unwrap().is_none());
}

#[test]
fn oversized_value_lands_in_its_own_bucket() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = Options {
        leaf_node_bucket_size: 256,
        inner_node_msg_count: Some(2),
        ..disk_options(&tmp)
    };
    let db = Database::open("fat", opts).unwrap();

    let fat = vec![0xaa; 4096];
    db.put(b"fat", &fat).unwrap();
    db.put(b"thin", b"v").unwrap();
    db.flush().unwrap();

    assert_eq!(db.get(b"fat").unwrap().unwrap(), fat);
    assert_eq!(db.get(b"thin").unwrap().unwrap(), b"v");
}

/// Batch write under a tiny cache, flush, reopen, and verify durable
/// readback of every key.
#[test]
fn batch_write_and_durable_readback() {
    const N: u64 = 100_000;

    let tmp = tempfile::tempdir().unwrap();
    let opts = Options {
        cache_limit: 32 << 10,
        // Small node budgets so the batch builds a real multi-level tree
        // instead of pooling in the root buffer.
        inner_node_page_size: 256 << 10,
        leaf_node_page_size: 128 << 10,
        leaf_node_bucket_size: 16 << 10,
        ..disk_options(&tmp)
    };

    {
        let db = Database::open("batch", opts.clone()).unwrap();
        for i in 0..N {
            db.put(&i.to_le_bytes(), i.to_string().as_bytes()).unwrap();
        }
        db.flush().unwrap();
    }

    let db = Database::open("batch", opts).unwrap();
    for i in 0..N {
        let got = db.get(&i.to_le_bytes()).unwrap();
        assert_eq!(
            got.as_deref(),
            Some(i.to_string().as_bytes()),
            "key {} must survive reopen",
            i
        );
    }
}

/// Batch delete after the batch write: all keys vanish durably, and hole
/// collection lets the data file shrink.
#[test]
fn batch_delete_shrinks_the_file() {
    const N: u64 = 100_000;

    let tmp = tempfile::tempdir().unwrap();
    let opts = Options {
        cache_limit: 32 << 10,
        inner_node_page_size: 256 << 10,
        leaf_node_page_size: 128 << 10,
        leaf_node_bucket_size: 16 << 10,
        ..disk_options(&tmp)
    };

    let full_length;
    {
        let db = Database::open("purge", opts.clone()).unwrap();
        for i in 0..N {
            db.put(&i.to_le_bytes(), i.to_string().as_bytes()).unwrap();
        }
        db.flush().unwrap();
        full_length = std::fs::metadata(tmp.path().join("purge.slu")).unwrap().len();
    }

    {
        let db = Database::open("purge", opts.clone()).unwrap();
        for i in 0..N {
            db.del(&i.to_le_bytes()).unwrap();
        }
        db.flush().unwrap();
    }

    let db = Database::open("purge", opts).unwrap();
    for i in 0..N {
        assert!(
            db.get(&i.to_le_bytes()).unwrap().is_none(),
            "key {} must stay deleted after reopen",
            i
        );
    }

    // Each flush graduates the extents the previous one retired; a few
    // rounds let the freed tail retract and truncate take effect.
    for _ in 0..4 {
        db.flush().unwrap();
    }
    let purged_length = std::fs::metadata(tmp.path().join("purge.slu")).unwrap().len();
    assert!(
        purged_length < full_length,
        "file did not shrink: {} !< {}",
        purged_length,
        full_length
    );
}

#[test]
fn snappy_compressed_tree_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = Options {
        compress: sluicedb::Compress::Snappy,
        inner_node_page_size: 64 << 10,
        leaf_node_page_size: 32 << 10,
        leaf_node_bucket_size: 4 << 10,
        ..disk_options(&tmp)
    };

    {
        let db = Database::open("zip", opts.clone()).unwrap();
        for i in 0..5_000u32 {
            let key = format!("user:{:06}", i);
            let value = format!("profile-data-{:06}-{}", i, "x".repeat(40));
            db.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        db.flush().unwrap();
    }

    let db = Database::open("zip", opts).unwrap();
    for i in (0..5_000u32).step_by(97) {
        let key = format!("user:{:06}", i);
        let expected = format!("profile-data-{:06}-{}", i, "x".repeat(40));
        assert_eq!(db.get(key.as_bytes()).unwrap().unwrap(), expected.as_bytes());
    }
}

/// Random interleaved puts and deletes tracked against an in-memory
/// model; the final state must agree key for key.
#[test]
fn random_workload_matches_model() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    let tmp = tempfile::tempdir().unwrap();
    let opts = Options {
        inner_node_page_size: 32 << 10,
        leaf_node_page_size: 16 << 10,
        leaf_node_bucket_size: 2 << 10,
        ..disk_options(&tmp)
    };
    let db = Database::open("model", opts).unwrap();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..20_000 {
        let key = rng.gen_range(0..2_000u32).to_be_bytes().to_vec();
        if rng.gen_bool(0.3) {
            db.del(&key).unwrap();
            model.remove(&key);
        } else {
            let value: Vec<u8> = (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect();
            db.put(&key, &value).unwrap();
            model.insert(key, value);
        }
    }

    for i in 0..2_000u32 {
        let key = i.to_be_bytes();
        assert_eq!(
            db.get(&key).unwrap(),
            model.get(key.as_slice()).cloned(),
            "divergence at key {}",
            i
        );
    }
}

#[test]
fn reopen_without_flush_only_loses_unflushed_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = disk_options(&tmp);

    {
        let db = Database::open("tail", opts.clone()).unwrap();
        db.put(b"flushed", b"1").unwrap();
        db.flush().unwrap();
        db.put(b"unflushed", b"2").unwrap();
        // Dropping the handle flushes again, making both durable.
    }

    let db = Database::open("tail", opts).unwrap();
    assert_eq!(db.get(b"flushed").unwrap().unwrap(), b"1");
    assert_eq!(db.get(b"unflushed").unwrap().unwrap(), b"2");
}

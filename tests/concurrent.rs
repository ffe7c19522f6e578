//! Concurrency smoke tests: parallel writers over disjoint key ranges,
//! readers racing the cascade machinery.

use std::sync::Arc;
use std::thread;

use sluicedb::{Database, Options, RamDirectory};

fn ram_options() -> Options {
    Options {
        dir: Some(Arc::new(RamDirectory::new())),
        inner_node_page_size: 64 << 10,
        leaf_node_page_size: 32 << 10,
        leaf_node_bucket_size: 4 << 10,
        cache_writeback_interval_ms: 20,
        cache_dirty_expire_ms: 10,
        ..Options::default()
    }
}

#[test]
fn parallel_writers_on_disjoint_ranges() {
    const WRITERS: u32 = 4;
    const PER_WRITER: u32 = 2_000;

    let db = Arc::new(Database::open("mt", ram_options()).unwrap());

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..PER_WRITER {
                let key = format!("{:02}:{:06}", w, i);
                let value = format!("value-{}-{}", w, i);
                db.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for w in 0..WRITERS {
        for i in (0..PER_WRITER).step_by(53) {
            let key = format!("{:02}:{:06}", w, i);
            let expected = format!("value-{}-{}", w, i);
            assert_eq!(
                db.get(key.as_bytes()).unwrap().unwrap(),
                expected.as_bytes(),
                "lost write for {}",
                key
            );
        }
    }
}

#[test]
fn readers_race_writers() {
    const KEYS: u32 = 1_000;

    let db = Arc::new(Database::open("rw", ram_options()).unwrap());
    for i in 0..KEYS {
        db.put(format!("seed{:05}", i).as_bytes(), b"0").unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for round in 1..=3u32 {
                for i in 0..KEYS {
                    db.put(
                        format!("seed{:05}", i).as_bytes(),
                        round.to_string().as_bytes(),
                    )
                    .unwrap();
                }
            }
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..KEYS {
                    // Values move through rounds, but a key never vanishes.
                    let got = db.get(format!("seed{:05}", i).as_bytes()).unwrap();
                    assert!(got.is_some(), "seed{:05} vanished mid-update", i);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    for i in (0..KEYS).step_by(31) {
        assert_eq!(
            db.get(format!("seed{:05}", i).as_bytes()).unwrap().unwrap(),
            b"3"
        );
    }
}

#[test]
fn flush_races_writers() {
    let db = Arc::new(Database::open("fw", ram_options()).unwrap());

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..5_000u32 {
                db.put(&i.to_le_bytes(), b"payload").unwrap();
            }
        })
    };
    let flusher = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..5 {
                db.flush().unwrap();
            }
        })
    };

    writer.join().unwrap();
    flusher.join().unwrap();
    db.flush().unwrap();

    for i in (0..5_000u32).step_by(101) {
        assert_eq!(db.get(&i.to_le_bytes()).unwrap().unwrap(), b"payload");
    }
}

//! Tests for M1: Basic Key-Value Operations
//! Covers standard-mode round-trips, slot reuse, and write failure paths.
//!
//! Run with:
//! cargo test m1_basic_kv_ops -- --nocapture

use kilat::{KilatDB, KilatError};
use serde_json::json;
use tempfile::TempDir;

fn setup_db(slots: u64) -> (KilatDB, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = KilatDB::create(&dir.path().join("test.kilat"), slots).unwrap();
    (db, dir)
}

mod basic_round_trip {
    use super::*;

    #[test]
    fn test_json_key_round_trip() {
        let (db, _dir) = setup_db(1024);

        let key = json!({"id": 1}).to_string();
        db.set(key.as_bytes(), b"alice").unwrap();

        let value = db.get(key.as_bytes());
        assert_eq!(value.as_deref(), Some(b"alice" as &[u8]));

        let stats = db.stats();
        assert_eq!(stats.total_slots, 1024);
        assert_eq!(stats.used_slots, 1);
        println!("stats after one insert: {:?}", stats);
    }

    #[test]
    fn test_update_replaces_value() {
        let (db, _dir) = setup_db(64);

        db.set(b"k", b"v1").unwrap();
        db.set(b"k", b"v2-longer-value").unwrap();
        assert_eq!(db.get(b"k").as_deref(), Some(b"v2-longer-value" as &[u8]));
        assert_eq!(db.stats().used_slots, 1, "update must reuse the slot");
    }

    #[test]
    fn test_many_keys_round_trip() {
        let (db, _dir) = setup_db(4096);

        for i in 0..500u32 {
            let key = format!("user/{i}");
            let value = format!("payload-{i}");
            db.set(key.as_bytes(), value.as_bytes()).unwrap();
        }
        for i in 0..500u32 {
            let key = format!("user/{i}");
            let expected = format!("payload-{i}");
            assert_eq!(
                db.get(key.as_bytes()).as_deref(),
                Some(expected.as_bytes()),
                "missing key {key}"
            );
        }
        assert_eq!(db.stats().used_slots, 500);
    }

    #[test]
    fn test_binary_keys_and_values() {
        let (db, _dir) = setup_db(64);

        let key = b"\x00\xFFkey\nwith bytes";
        let value = [0u8, 1, 2, 253, 254, 255];
        db.set(key, &value).unwrap();
        assert_eq!(db.get(key).as_deref(), Some(&value[..]));
    }
}

mod absent_keys {
    use super::*;

    #[test]
    fn test_get_before_any_set_is_none() {
        let (db, _dir) = setup_db(64);
        assert_eq!(db.get(b"never-set"), None);
        assert!(!db.contains(b"never-set"));
    }

    #[test]
    fn test_get_after_remove_is_none() {
        let (db, _dir) = setup_db(64);
        db.set(b"ghost", b"boo").unwrap();
        db.remove(b"ghost").unwrap();
        assert_eq!(db.get(b"ghost"), None);
    }

    #[test]
    fn test_remove_of_absent_key_fails() {
        let (db, _dir) = setup_db(64);
        assert!(matches!(db.remove(b"nothing"), Err(KilatError::KeyNotFound)));
    }
}

mod slot_reuse {
    use super::*;

    #[test]
    fn test_reinsert_after_remove() {
        let (db, _dir) = setup_db(64);

        db.set(b"phoenix", b"first").unwrap();
        db.remove(b"phoenix").unwrap();
        db.set(b"phoenix", b"reborn").unwrap();
        assert_eq!(db.get(b"phoenix").as_deref(), Some(b"reborn" as &[u8]));
        assert_eq!(db.stats().used_slots, 1);
    }
}

mod write_failures {
    use super::*;

    #[test]
    fn test_oversize_value_rejected_without_side_effects() {
        let (db, _dir) = setup_db(64);

        db.set(b"key", b"small").unwrap();
        let journal_before = db.journal_stats().unwrap();
        let generation_before = db.generation();

        let oversize = vec![0x41u8; 497];
        assert!(matches!(
            db.set(b"key", &oversize),
            Err(KilatError::ValueTooLarge(497))
        ));

        // Prior slot content intact, no journal record, no generation bump.
        assert_eq!(db.get(b"key").as_deref(), Some(b"small" as &[u8]));
        let journal_after = db.journal_stats().unwrap();
        assert_eq!(journal_before.journal_bytes, journal_after.journal_bytes);
        assert_eq!(db.generation(), generation_before);
    }

    #[test]
    fn test_exactly_496_bytes_fits() {
        let (db, _dir) = setup_db(64);
        let value = vec![0x42u8; 496];
        db.set(b"max", &value).unwrap();
        assert_eq!(db.get(b"max").as_deref(), Some(&value[..]));
    }

    #[test]
    fn test_table_full_when_probe_window_exhausted() {
        let (db, _dir) = setup_db(1);

        db.set(b"occupant", b"here").unwrap();
        // Any other key needs the same single slot.
        let err = db.set(b"evicted", b"nope");
        assert!(matches!(err, Err(KilatError::TableFull)));
        // Store stays usable.
        assert_eq!(db.get(b"occupant").as_deref(), Some(b"here" as &[u8]));
    }
}

mod batch_ops {
    use super::*;

    #[test]
    fn test_set_and_get_batch() {
        let (db, _dir) = setup_db(1024);

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..100u32)
            .map(|i| (format!("batch/{i}").into_bytes(), format!("v{i}").into_bytes()))
            .collect();
        assert_eq!(db.set_batch(&pairs), 100);

        let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let values = db.get_batch(&keys);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(value.as_deref(), Some(format!("v{i}").as_bytes()));
        }
    }
}

mod generation_counter {
    use super::*;

    #[test]
    fn test_generation_strictly_monotonic() {
        let (db, _dir) = setup_db(64);

        let g0 = db.generation();
        db.set(b"a", b"1").unwrap();
        let g1 = db.generation();
        db.set(b"a", b"2").unwrap();
        let g2 = db.generation();
        db.remove(b"a").unwrap();
        let g3 = db.generation();

        assert!(g0 < g1 && g1 < g2 && g2 < g3, "{g0} {g1} {g2} {g3}");
    }
}

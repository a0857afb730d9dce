//! Tests for M2: Persistence, Read-Only Handles and Format Validation
//!
//! Run with:
//! cargo test m2_persistence_readonly -- --nocapture

use kilat::{HashMode, KilatDB, KilatError, MphfConfig};
use tempfile::TempDir;

fn populated_store(dir: &TempDir, n: u32) -> std::path::PathBuf {
    let path = dir.path().join("store.kilat");
    let db = KilatDB::create(&path, 256).unwrap();
    for i in 0..n {
        db.set(format!("key/{i}").as_bytes(), format!("value-{i}").as_bytes())
            .unwrap();
    }
    db.flush().unwrap();
    path
}

mod reopen {
    use super::*;

    #[test]
    fn test_reopen_read_write() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 10);

        let db = KilatDB::open(&path, false).unwrap();
        for i in 0..10 {
            assert_eq!(
                db.get(format!("key/{i}").as_bytes()).as_deref(),
                Some(format!("value-{i}").as_bytes())
            );
        }
        // Still writable.
        db.set(b"key/new", b"fresh").unwrap();
        assert_eq!(db.get(b"key/new").as_deref(), Some(b"fresh" as &[u8]));
    }

    #[test]
    fn test_reopen_readonly_serves_reads_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 10);

        let db = KilatDB::open(&path, true).unwrap();
        assert!(db.is_readonly());
        for i in 0..10 {
            assert_eq!(
                db.get(format!("key/{i}").as_bytes()).as_deref(),
                Some(format!("value-{i}").as_bytes()),
                "readonly get of key/{i}"
            );
        }
        assert!(matches!(db.set(b"key/0", b"x"), Err(KilatError::Readonly)));
        assert!(matches!(db.remove(b"key/0"), Err(KilatError::Readonly)));
        assert!(matches!(
            db.optimize(&MphfConfig::default()),
            Err(KilatError::Readonly)
        ));
    }

    #[test]
    fn test_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 20);

        {
            let db = KilatDB::open(&path, false).unwrap();
            db.remove(b"key/0").unwrap();
            db.remove(b"key/1").unwrap();
        }
        let db = KilatDB::open(&path, false).unwrap();
        assert_eq!(db.journal_stats().unwrap().active_keys, 18);
    }
}

mod format_validation {
    use super::*;

    #[test]
    fn test_any_corrupt_magic_byte_rejected() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 3);
        let original = std::fs::read(&path).unwrap();

        for byte in 0..4 {
            let mut corrupted = original.clone();
            corrupted[byte] ^= 0x01;
            std::fs::write(&path, &corrupted).unwrap();

            match KilatDB::open(&path, false) {
                Err(KilatError::InvalidFormat(reason)) => {
                    println!("magic byte {byte} flipped, rejected: {reason}")
                }
                Err(e) => panic!("corrupt magic byte {byte}: wrong error kind {e}"),
                Ok(_) => panic!("corrupt magic byte {byte} must be rejected"),
            }
        }

        // Restore and confirm the store opens again.
        std::fs::write(&path, &original).unwrap();
        assert!(KilatDB::open(&path, false).is_ok());
    }

    #[test]
    fn test_truncated_slot_region_rejected() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 3);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            KilatDB::open(&path, false),
            Err(KilatError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.kilat");
        std::fs::write(&path, b"MAPH").unwrap();
        assert!(matches!(
            KilatDB::open(&path, false),
            Err(KilatError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            KilatDB::open(&dir.path().join("absent.kilat"), false),
            Err(KilatError::Io(_))
        ));
    }
}

mod optimized_store_reopen {
    use super::*;

    #[test]
    fn test_optimized_store_reopens_in_perfect_mode() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 25);

        {
            let db = KilatDB::open(&path, false).unwrap();
            db.optimize(&MphfConfig::default()).unwrap();
            assert_eq!(db.mode(), HashMode::Perfect);
        }
        let db = KilatDB::open(&path, false).unwrap();
        assert_eq!(db.mode(), HashMode::Perfect);
        for i in 0..25 {
            assert_eq!(
                db.get(format!("key/{i}").as_bytes()).as_deref(),
                Some(format!("value-{i}").as_bytes())
            );
        }
        assert_eq!(db.get(b"not-there"), None);
    }

    #[test]
    fn test_optimized_store_reopens_readonly() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 25);
        {
            let db = KilatDB::open(&path, false).unwrap();
            db.optimize(&MphfConfig::default()).unwrap();
        }
        let db = KilatDB::open(&path, true).unwrap();
        assert_eq!(db.mode(), HashMode::Perfect);
        for i in 0..25 {
            assert_eq!(
                db.get(format!("key/{i}").as_bytes()).as_deref(),
                Some(format!("value-{i}").as_bytes())
            );
        }
    }

    #[test]
    fn test_missing_journal_demotes_to_hybrid() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 25);
        {
            let db = KilatDB::open(&path, false).unwrap();
            db.optimize(&MphfConfig::default()).unwrap();
        }
        std::fs::remove_file(dir.path().join("store.kilat.journal")).unwrap();

        // Without the journal the dense→physical map cannot be rebuilt,
        // so the handle must serve hybrid semantics rather than probe
        // behind a perfect-mode label.
        let db = KilatDB::open(&path, true).unwrap();
        assert_eq!(db.mode(), HashMode::Hybrid);
        for i in 0..25 {
            assert_eq!(
                db.get(format!("key/{i}").as_bytes()).as_deref(),
                Some(format!("value-{i}").as_bytes()),
                "key/{i} unreachable after journal loss"
            );
        }
        assert_eq!(db.get(b"not-there"), None);
    }

    #[test]
    fn test_corrupt_payload_rejected_on_open() {
        let dir = TempDir::new().unwrap();
        let path = populated_store(&dir, 25);
        {
            let db = KilatDB::open(&path, false).unwrap();
            db.optimize(&MphfConfig::default()).unwrap();
        }
        // Flip a byte inside the appended payload region.
        let mut bytes = std::fs::read(&path).unwrap();
        let payload_start = 512 + 256 * 512;
        bytes[payload_start + 20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            KilatDB::open(&path, false),
            Err(KilatError::InvalidFormat(_))
        ));
    }
}

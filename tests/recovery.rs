use std::sync::Arc;

use tempfile::TempDir;

use patterndb::search::default_radius;
use patterndb::store::PATTERNS_FILE;
use patterndb::{Catalog, CatalogOptions, Pattern, PatternStore, StoreError, StoreOptions};

fn shade(v: u8) -> Pattern {
    Pattern::uniform([v, v, v])
}

fn options() -> StoreOptions {
    StoreOptions {
        fsync_writes: true,
        chunk_records: 3,
    }
}

#[test]
fn torn_write_loses_only_the_last_record() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = PatternStore::open(dir.path(), options())?;
        for id in 1..=5u64 {
            store.put(id, &shade(id as u8 * 40))?;
        }
    }

    let path = dir.path().join(PATTERNS_FILE);
    let len = std::fs::metadata(&path)?.len();
    let file = std::fs::OpenOptions::new().write(true).open(&path)?;
    file.set_len(len - 100)?;
    drop(file);

    let store = PatternStore::open(dir.path(), options())?;
    assert_eq!(store.ids(), vec![1, 2, 3, 4]);
    assert!(store.recovery().truncated_bytes > 0);

    // The log accepts new writes after the truncated tail.
    store.put(5, &shade(1))?;
    drop(store);
    let store = PatternStore::open(dir.path(), options())?;
    assert_eq!(store.ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(store.get(5)?, shade(1));
    assert_eq!(store.recovery().truncated_bytes, 0);
    Ok(())
}

#[test]
fn damaged_frame_length_does_not_erase_later_records() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = PatternStore::open(dir.path(), options())?;
        for id in 1..=5u64 {
            store.put(id, &shade(id as u8 * 40))?;
        }
    }

    let path = dir.path().join(PATTERNS_FILE);
    let mut raw = std::fs::read(&path)?;
    let before = raw.len() as u64;
    let frame = raw.len() / 5;
    raw[frame + 3] ^= 0x80;
    std::fs::write(&path, raw)?;

    let store = PatternStore::open(dir.path(), options())?;
    assert_eq!(store.ids(), vec![1, 3, 4, 5]);
    assert_eq!(store.get(4)?, shade(160));
    assert_eq!(store.recovery().checksum_failures, 1);
    assert_eq!(store.recovery().truncated_bytes, 0);
    assert_eq!(std::fs::metadata(&path)?.len(), before);
    assert!(matches!(
        store.put(4, &shade(0)),
        Err(StoreError::DuplicateArtwork(4))
    ));

    // The lost id can be written again and survives another reopen.
    store.put(2, &shade(80))?;
    drop(store);
    let store = PatternStore::open(dir.path(), options())?;
    assert_eq!(store.ids(), vec![1, 3, 4, 5, 2]);
    assert_eq!(store.get(2)?, shade(80));
    Ok(())
}

#[test]
fn garbage_log_opens_empty() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join(PATTERNS_FILE), b"xyz")?;
    let store = PatternStore::open(dir.path(), options())?;
    assert!(store.is_empty());
    assert!(matches!(store.get(1), Err(StoreError::NotFound(1))));
    Ok(())
}

#[test]
fn catalog_search_works_before_and_after_pivots() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let catalog = Catalog::open(dir.path(), CatalogOptions::default())?;
    for v in (0..=250u8).step_by(10) {
        catalog.put_pattern(u64::from(v), &shade(v))?;
    }
    let before = catalog.similar_to_artwork(100, default_radius(), 20)?;
    catalog.build_pivots(5)?;
    let after = catalog.similar_to_artwork(100, default_radius(), 20)?;
    assert_eq!(before, after);
    assert_eq!(before[0].artwork_id, 100);

    // Records added after the pivots are tagged with them.
    catalog.put_pattern(1000, &shade(101))?;
    assert_eq!(catalog.store().scrub().untagged, 0);
    let hits = catalog.similar_to_artwork(100, default_radius(), 20)?;
    assert_eq!(hits[1].artwork_id, 1000);
    Ok(())
}

#[test]
fn readers_keep_their_snapshot_while_writers_append() -> anyhow::Result<()> {
    let store = Arc::new(PatternStore::in_memory(StoreOptions {
        fsync_writes: false,
        chunk_records: 16,
    }));
    for id in 0..100u64 {
        store.put(id, &shade(id as u8))?;
    }

    let writer = {
        let store = store.clone();
        std::thread::spawn(move || -> Result<(), StoreError> {
            for id in 100..1100u64 {
                store.put(id, &shade((id % 256) as u8))?;
            }
            Ok(())
        })
    };

    for _ in 0..50 {
        let scan = store.scan(None);
        let seen = scan.iter().count();
        assert_eq!(seen, scan.snapshot_len());
        // Insertion order is stable within a scan.
        let ids: Vec<u64> = scan.iter().map(|r| r.artwork_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    writer.join().expect("writer thread panicked")?;
    assert_eq!(store.len(), 1100);
    Ok(())
}

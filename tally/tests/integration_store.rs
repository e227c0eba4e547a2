//! Integration tests for the store backends.
//!
//! The same scenarios run against the filesystem store and the object store
//! over an in-memory client: idempotent writes, window reads with strict
//! overlap, label-distinct keys, and concurrent writers.

use std::sync::Arc;
use std::thread;

use chrono::TimeDelta;
use tally::config::StoreUrl;
use tally::record::BillingRecord;
use tally::store::{FileStore, MemoryObjectClient, ObjectStore, open_store};
use tally::{Range, Store, TallyError};
use tempfile::tempdir;

const NOW: i64 = 1_700_000_000;

fn range(start: i64, end: i64) -> Range {
    Range::from_unix_secs(start, end).unwrap()
}

fn record(start: i64, end: i64, amount: f64) -> BillingRecord {
    BillingRecord::new("sum(rate(cpu[5m]))", "tenant-a", range(start, end), amount)
}

fn sorted(mut records: Vec<BillingRecord>) -> Vec<BillingRecord> {
    records.sort_by(|a, b| (a.start, &a.labels).cmp(&(b.start, &b.labels)));
    records
}

/// Runs `scenario` against a fresh store of every backend.
fn for_each_backend(scenario: impl Fn(&dyn Store)) {
    let temp_dir = tempdir().unwrap();
    let file = FileStore::open(temp_dir.path().join("store")).unwrap();
    scenario(&file);

    let object = ObjectStore::new(MemoryObjectClient::with_bucket("billing"), "billing", "raw");
    scenario(&object);
}

#[test]
fn test_write_then_read_back() {
    for_each_backend(|store| {
        let written = record(NOW, NOW + 600, 12.5).with_labels([("pod", "web-0")]);
        store.write(&written).unwrap();

        let read = store.read(&range(NOW, NOW + 600), &written.query, "tenant-a").unwrap();
        assert_eq!(read, vec![written.clone()]);
    });
}

#[test]
fn test_repeated_writes_do_not_duplicate() {
    for_each_backend(|store| {
        for _ in 0..3 {
            for i in 0..6 {
                store.write(&record(NOW + i * 600, NOW + (i + 1) * 600, 1.0)).unwrap();
            }
        }
        let read = store
            .read(&range(NOW, NOW + 3600), "sum(rate(cpu[5m]))", "tenant-a")
            .unwrap();
        assert_eq!(read.len(), 6);
    });
}

#[test]
fn test_read_window_uses_strict_overlap() {
    for_each_backend(|store| {
        for i in 0..6 {
            store.write(&record(NOW + i * 600, NOW + (i + 1) * 600, 1.0)).unwrap();
        }

        // Ends exactly where the second record starts.
        let read = sorted(
            store
                .read(&range(NOW, NOW + 600), "sum(rate(cpu[5m]))", "tenant-a")
                .unwrap(),
        );
        assert_eq!(read, vec![record(NOW, NOW + 600, 1.0)]);

        // Straddles the boundary between the third and fourth records.
        let read = sorted(
            store
                .read(&range(NOW + 1500, NOW + 2100), "sum(rate(cpu[5m]))", "tenant-a")
                .unwrap(),
        );
        let starts: Vec<i64> = read.iter().map(|r| r.start.timestamp()).collect();
        assert_eq!(starts, vec![NOW + 1200, NOW + 1800]);
    });
}

#[test]
fn test_distinct_labels_do_not_collide() {
    for_each_backend(|store| {
        for pod in ["web-0", "web-1", "web-2"] {
            store
                .write(&record(NOW, NOW + 60, 1.0).with_labels([("pod", pod)]))
                .unwrap();
        }
        store.write(&record(NOW, NOW + 60, 1.0)).unwrap();

        let read = store
            .read(&range(NOW, NOW + 60), "sum(rate(cpu[5m]))", "tenant-a")
            .unwrap();
        assert_eq!(read.len(), 4);
    });
}

#[test]
fn test_subjects_and_queries_are_isolated() {
    for_each_backend(|store| {
        store.write(&record(NOW, NOW + 60, 1.0)).unwrap();
        let mut other_subject = record(NOW, NOW + 60, 2.0);
        other_subject.subject = "tenant-b".to_string();
        store.write(&other_subject).unwrap();
        let mut other_query = record(NOW, NOW + 60, 3.0);
        other_query.query = "sum(rate(memory[5m]))".to_string();
        store.write(&other_query).unwrap();

        let read = store
            .read(&range(NOW, NOW + 60), "sum(rate(cpu[5m]))", "tenant-a")
            .unwrap();
        assert_eq!(read, vec![record(NOW, NOW + 60, 1.0)]);
        assert!(store.read(&range(NOW, NOW + 60), "cpu", "tenant-c").unwrap().is_empty());
    });
}

#[test]
fn test_unsafe_subject_is_rejected() {
    for_each_backend(|store| {
        for subject in ["", "..", "a/b"] {
            let mut bad = record(NOW, NOW + 60, 1.0);
            bad.subject = subject.to_string();
            assert!(matches!(store.write(&bad), Err(TallyError::Store(_))), "{subject:?}");
        }
    });
}

#[test]
fn test_sub_second_records_are_rejected_not_overwritten() {
    for_each_backend(|store| {
        let base = record(NOW + 20, NOW + 21, 0.0);
        let first = BillingRecord {
            end: base.start + TimeDelta::milliseconds(300),
            amount: 1.0,
            ..base.clone()
        };
        let second = BillingRecord {
            start: base.start + TimeDelta::milliseconds(300),
            end: base.start + TimeDelta::milliseconds(600),
            amount: 2.0,
            ..base
        };

        assert!(matches!(store.write(&first), Err(TallyError::Store(_))));
        assert!(matches!(store.write(&second), Err(TallyError::Store(_))));
        assert!(
            store
                .read(&range(NOW + 20, NOW + 21), "sum(rate(cpu[5m]))", "tenant-a")
                .unwrap()
                .is_empty()
        );
    });
}

#[test]
fn test_concurrent_writers_same_keys() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(FileStore::open(temp_dir.path()).unwrap());

    let writers: Vec<_> = (0u8..4)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..20 {
                    store
                        .write(&record(NOW + i * 60, NOW + (i + 1) * 60, f64::from(w)))
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let read = store
        .read(&range(NOW, NOW + 1200), "sum(rate(cpu[5m]))", "tenant-a")
        .unwrap();
    assert_eq!(read.len(), 20);
    assert!(read.iter().all(|r| (0.0..4.0).contains(&r.amount)));
}

#[test]
fn test_open_store_from_file_url() {
    let temp_dir = tempdir().unwrap();
    let url: StoreUrl = format!("file://{}", temp_dir.path().display()).parse().unwrap();
    let store = open_store(&url).unwrap();

    store.write(&record(NOW, NOW + 60, 4.0)).unwrap();
    let reopened = open_store(&url).unwrap();
    assert_eq!(
        reopened
            .read(&range(NOW, NOW + 60), "sum(rate(cpu[5m]))", "tenant-a")
            .unwrap()
            .len(),
        1
    );
}

//! Integration tests for the metering flow.
//!
//! A stub usage backend stands in for the metrics system. The tests meter
//! into a real file store, fill gaps on re-runs, and roll the stored records
//! up into reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::TimeDelta;
use tally::error::{BackendError, MeterError};
use tally::meter::{UsageBackend, UsageSample};
use tally::store::FileStore;
use tally::{AggregationPolicy, Meter, MeterRequest, Range, Report, Store, TallyError, find_gaps};
use tempfile::tempdir;

const NOW: i64 = 1_700_000_000;

fn range(start: i64, end: i64) -> Range {
    Range::from_unix_secs(start, end).unwrap()
}

/// Reports a constant per-second rate for each pod and remembers every
/// queried range.
struct StubBackend {
    pods: Vec<(&'static str, f64)>,
    queried: Mutex<Vec<Range>>,
}

impl StubBackend {
    fn new(pods: Vec<(&'static str, f64)>) -> Self {
        Self {
            pods,
            queried: Mutex::new(Vec::new()),
        }
    }
}

impl UsageBackend for StubBackend {
    fn integrate(&self, _query: &str, range: &Range) -> Result<Vec<UsageSample>, BackendError> {
        self.queried.lock().unwrap().push(*range);
        #[allow(clippy::cast_precision_loss)]
        let secs = range.duration().num_seconds() as f64;
        Ok(self
            .pods
            .iter()
            .map(|(pod, rate)| UsageSample::new(rate * secs).with_labels([("pod", *pod)]))
            .collect())
    }
}

/// Shares a stub between the meter and the test body.
struct Shared(Arc<StubBackend>);

impl UsageBackend for Shared {
    fn integrate(&self, query: &str, range: &Range) -> Result<Vec<UsageSample>, BackendError> {
        self.0.integrate(query, range)
    }
}

/// Fails every query after the first `ok` ones.
struct FlakyBackend {
    ok: usize,
    calls: AtomicUsize,
}

impl UsageBackend for FlakyBackend {
    fn integrate(&self, _query: &str, range: &Range) -> Result<Vec<UsageSample>, BackendError> {
        if self.calls.fetch_add(1, Ordering::Relaxed) >= self.ok {
            return Err(BackendError::Transport {
                reason: "connection refused".to_string(),
            });
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = range.duration().num_seconds() as f64;
        Ok(vec![UsageSample::new(secs)])
    }
}

#[test]
fn test_fill_gaps_meters_whole_range_into_empty_store() {
    let temp_dir = tempdir().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let meter = Meter::new(Box::new(StubBackend::new(vec![("web-0", 1.0), ("web-1", 0.5)])));

    let request =
        MeterRequest::new("cpu", "tenant-a", range(NOW, NOW + 3600), TimeDelta::minutes(10));
    let report = meter.fill_gaps(&store, &request).unwrap();

    assert_eq!(report.gaps, vec![range(NOW, NOW + 3600)]);
    assert_eq!(report.records_written, 12);

    let stored = store.read(&request.range, "cpu", "tenant-a").unwrap();
    assert_eq!(stored.len(), 12);
    assert!(find_gaps(&stored, &request.range).is_empty());
}

#[test]
fn test_fill_gaps_only_meters_missing_parts() {
    let temp_dir = tempdir().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let stub = Arc::new(StubBackend::new(vec![("web-0", 1.0)]));

    // First run covers the first half hour.
    let first = Meter::new(Box::new(Shared(Arc::clone(&stub))));
    first
        .fill_gaps(
            &store,
            &MeterRequest::new("cpu", "tenant-a", range(NOW, NOW + 1800), TimeDelta::minutes(10)),
        )
        .unwrap();
    stub.queried.lock().unwrap().clear();

    // Second run over the full hour only queries the second half.
    let second = Meter::new(Box::new(Shared(Arc::clone(&stub))));
    let report = second
        .fill_gaps(
            &store,
            &MeterRequest::new("cpu", "tenant-a", range(NOW, NOW + 3600), TimeDelta::minutes(10)),
        )
        .unwrap();

    assert_eq!(report.gaps, vec![range(NOW + 1800, NOW + 3600)]);
    let queried = stub.queried.lock().unwrap().clone();
    assert_eq!(queried.len(), 3);
    assert!(queried.iter().all(|r| r.start().timestamp() >= NOW + 1800));

    // A third run finds nothing to do.
    let third = Meter::new(Box::new(Shared(Arc::clone(&stub))));
    let report = third
        .fill_gaps(
            &store,
            &MeterRequest::new("cpu", "tenant-a", range(NOW, NOW + 3600), TimeDelta::minutes(10)),
        )
        .unwrap();
    assert!(report.gaps.is_empty());
    assert_eq!(report.records_written, 0);
}

#[test]
fn test_failed_run_writes_nothing_and_rerun_repairs() {
    let temp_dir = tempdir().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let request =
        MeterRequest::new("cpu", "tenant-a", range(NOW, NOW + 600), TimeDelta::minutes(1));

    let flaky = Meter::new(Box::new(FlakyBackend {
        ok: 4,
        calls: AtomicUsize::new(0),
    }));
    assert!(flaky.fill_gaps(&store, &request).is_err());
    assert!(store.read(&request.range, "cpu", "tenant-a").unwrap().is_empty());

    let healthy = Meter::new(Box::new(FlakyBackend {
        ok: usize::MAX,
        calls: AtomicUsize::new(0),
    }));
    let report = healthy.fill_gaps(&store, &request).unwrap();
    assert_eq!(report.records_written, 10);
}

#[test]
fn test_fill_gaps_rejects_sub_second_precision_before_writing() {
    let temp_dir = tempdir().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let stub = Arc::new(StubBackend::new(vec![("web-0", 1.0)]));
    let meter = Meter::new(Box::new(Shared(Arc::clone(&stub))));

    let request =
        MeterRequest::new("cpu", "tenant-a", range(NOW, NOW + 2), TimeDelta::milliseconds(250));
    let err = meter.fill_gaps(&store, &request).unwrap_err();

    assert!(matches!(
        err,
        TallyError::Meter(MeterError::InvalidPrecision { .. })
    ));
    assert!(stub.queried.lock().unwrap().is_empty());
    let stored = store.read(&request.range, "cpu", "tenant-a").unwrap();
    assert!(stored.is_empty());
    assert_eq!(find_gaps(&stored, &request.range), vec![request.range]);
}

#[test]
fn test_metered_records_roll_up_into_report() {
    let temp_dir = tempdir().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let meter = Meter::new(Box::new(StubBackend::new(vec![("web-0", 2.0), ("web-1", 1.0)])));

    let day = range(NOW, NOW + 6 * 3600);
    meter
        .fill_gaps(&store, &MeterRequest::new("cpu", "tenant-a", day, TimeDelta::minutes(15)))
        .unwrap();

    let report = Report::build(
        &store,
        "cpu",
        "tenant-a",
        &day,
        TimeDelta::hours(1),
        &AggregationPolicy::new(["pod"]),
    )
    .unwrap();

    assert_eq!(report.records.len(), 12);
    for record in &report.records {
        assert_eq!(record.range().duration(), TimeDelta::hours(1));
        let expected = if record.labels["pod"] == "web-0" { 7200.0 } else { 3600.0 };
        assert!((record.amount - expected).abs() < 1e-9);
    }
    assert!((report.total() - 3.0 * 6.0 * 3600.0).abs() < 1e-6);
}

//! Per-period usage reports built from stored records.
//!
//! A report reads the raw records of one subject and query, cuts the report
//! range into periods and aggregates each period on its own. The result holds
//! one record per series and period, ready to be rendered or written to a
//! second store as coarser billing records.
//!
//! Merge labels must tell concurrent series apart: two series collapsing to
//! the same fingerprint over the same period overlap in time, which the
//! aggregator rejects as [`AggregateError::NonAdjacentMerge`]. Gaps in the
//! raw data are rejected the same way, so fill them with
//! [`Meter::fill_gaps`](crate::meter::Meter::fill_gaps) first.
//!
//! [`AggregateError::NonAdjacentMerge`]: crate::error::AggregateError::NonAdjacentMerge

use chrono::TimeDelta;

use crate::aggregate::{AggregationPolicy, Aggregator};
use crate::error::{ConfigError, Result};
use crate::range::Range;
use crate::record::BillingRecord;
use crate::store::Store;

/// Aggregated usage of one subject and query, period by period.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// The reported query.
    pub query: String,
    /// The reported subject.
    pub subject: String,
    /// The full report range.
    pub range: Range,
    /// Length of each period; the last one may be shorter.
    pub period: TimeDelta,
    /// Aggregated records ordered by period.
    pub records: Vec<BillingRecord>,
}

impl Report {
    /// Reads `range` from `store` and aggregates it per `period`.
    ///
    /// Periods without any stored record are left out.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidInterval`] if `period` is not positive
    /// - store read errors
    /// - any [`Aggregator::aggregate`] error for a period
    pub fn build(
        store: &dyn Store,
        query: &str,
        subject: &str,
        range: &Range,
        period: TimeDelta,
        policy: &AggregationPolicy,
    ) -> Result<Self> {
        if period <= TimeDelta::zero() {
            return Err(ConfigError::InvalidInterval {
                value: format!("{}s", period.num_seconds()),
                reason: "report period must be greater than zero".to_string(),
            }
            .into());
        }

        let raw = store.read(range, query, subject)?;
        let aggregator = Aggregator::new(policy.clone());

        let mut records = Vec::new();
        let mut periods = 0usize;
        for segment in range.segment(period) {
            let inside: Vec<BillingRecord> = raw
                .iter()
                .filter(|record| record.range().overlaps(&segment))
                .cloned()
                .collect();
            if inside.is_empty() {
                continue;
            }
            periods += 1;
            records.extend(aggregator.aggregate(&inside, &segment)?);
        }

        tracing::info!(
            query,
            subject,
            range = %range,
            raw = raw.len(),
            periods,
            records = records.len(),
            "built usage report"
        );
        Ok(Self {
            query: query.to_string(),
            subject: subject.to_string(),
            range: *range,
            period,
            records,
        })
    }

    /// Sum of all aggregated amounts.
    pub fn total(&self) -> f64 {
        self.records.iter().map(|record| record.amount).sum()
    }

    /// Writes every aggregated record to `store` and returns how many were
    /// written. Re-running overwrites the same keys.
    ///
    /// # Errors
    ///
    /// Returns the first store write error.
    pub fn write_to(&self, store: &dyn Store) -> Result<usize> {
        for record in &self.records {
            store.write(record)?;
        }
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AggregateError, TallyError};
    use crate::store::{MemoryObjectClient, ObjectStore};

    fn range(start: i64, end: i64) -> Range {
        Range::from_unix_secs(start, end).unwrap()
    }

    fn store_with(records: &[BillingRecord]) -> ObjectStore<MemoryObjectClient> {
        let store = ObjectStore::new(MemoryObjectClient::with_bucket("raw"), "raw", "");
        for record in records {
            store.write(record).unwrap();
        }
        store
    }

    fn minute(i: i64, pod: &str, amount: f64) -> BillingRecord {
        BillingRecord::new("cpu", "tenant-a", range(i * 60, (i + 1) * 60), amount)
            .with_labels([("pod", pod)])
    }

    #[test]
    fn test_hourly_periods() {
        let raw: Vec<_> = (0..120).map(|i| minute(i, "web-0", 1.0)).collect();
        let store = store_with(&raw);

        let report = Report::build(
            &store,
            "cpu",
            "tenant-a",
            &range(0, 7200),
            TimeDelta::hours(1),
            &AggregationPolicy::new(["pod"]),
        )
        .unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].range(), range(0, 3600));
        assert_eq!(report.records[1].range(), range(3600, 7200));
        assert!((report.records[0].amount - 60.0).abs() < 1e-9);
        assert!((report.total() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_series_kept_apart_by_merge_labels() {
        let mut raw = Vec::new();
        for i in 0..10 {
            raw.push(minute(i, "web-0", 1.0));
            raw.push(minute(i, "web-1", 2.0));
        }
        let store = store_with(&raw);

        let report = Report::build(
            &store,
            "cpu",
            "tenant-a",
            &range(0, 600),
            TimeDelta::minutes(10),
            &AggregationPolicy::new(["pod"]),
        )
        .unwrap();

        assert_eq!(report.records.len(), 2);
        assert!((report.total() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlapping_series_without_merge_labels_is_error() {
        let store = store_with(&[minute(0, "web-0", 1.0), minute(0, "web-1", 1.0)]);
        let err = Report::build(
            &store,
            "cpu",
            "tenant-a",
            &range(0, 60),
            TimeDelta::minutes(1),
            &AggregationPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TallyError::Aggregate(AggregateError::NonAdjacentMerge { .. })
        ));
    }

    #[test]
    fn test_partial_period_is_prorated() {
        let store = store_with(&[minute(0, "web-0", 6.0)]);
        let report = Report::build(
            &store,
            "cpu",
            "tenant-a",
            &range(30, 60),
            TimeDelta::minutes(5),
            &AggregationPolicy::new(["pod"]),
        )
        .unwrap();
        assert_eq!(report.records.len(), 1);
        assert!((report.records[0].amount - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_periods_are_skipped() {
        let store = store_with(&[minute(0, "web-0", 1.0)]);
        let report = Report::build(
            &store,
            "cpu",
            "tenant-a",
            &range(0, 600),
            TimeDelta::minutes(1),
            &AggregationPolicy::new(["pod"]),
        )
        .unwrap();
        assert_eq!(report.records.len(), 1);
    }

    #[test]
    fn test_non_positive_period_is_error() {
        let store = store_with(&[]);
        assert!(
            Report::build(
                &store,
                "cpu",
                "tenant-a",
                &range(0, 60),
                TimeDelta::zero(),
                &AggregationPolicy::default(),
            )
            .is_err()
        );
    }

    #[test]
    fn test_write_to_is_idempotent() {
        let raw: Vec<_> = (0..4).map(|i| minute(i, "web-0", 1.0)).collect();
        let report = Report::build(
            &store_with(&raw),
            "cpu",
            "tenant-a",
            &range(0, 240),
            TimeDelta::minutes(2),
            &AggregationPolicy::new(["pod"]),
        )
        .unwrap();

        let output = ObjectStore::new(MemoryObjectClient::with_bucket("out"), "out", "hourly");
        assert_eq!(report.write_to(&output).unwrap(), 2);
        assert_eq!(report.write_to(&output).unwrap(), 2);
        assert_eq!(output.client().object_count("out"), 2);
    }
}

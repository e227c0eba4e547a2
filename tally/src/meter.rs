//! Turning metrics-backend results into billing records.
//!
//! The numeric work (integrating a rate over time) happens in the metrics
//! backend behind the [`UsageBackend`] trait. The meter owns the contract
//! around it: the target range is cut into segments no longer than the
//! requested precision, every segment is queried, and the resulting records
//! tile the target range without gaps or overlaps for every series.
//!
//! # Example
//!
//! ```rust
//! use chrono::TimeDelta;
//! use tally::meter::{Meter, MeterRequest, UsageBackend, UsageSample};
//! use tally::error::BackendError;
//! use tally::Range;
//!
//! struct Flat;
//!
//! impl UsageBackend for Flat {
//!     fn integrate(&self, _query: &str, range: &Range) -> Result<Vec<UsageSample>, BackendError> {
//!         Ok(vec![UsageSample::new(range.duration().num_seconds() as f64)])
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let meter = Meter::new(Box::new(Flat));
//! let range = Range::from_unix_secs(0, 3600)?;
//! let request = MeterRequest::new("cpu", "tenant-a", range, TimeDelta::minutes(10));
//! let records = meter.run(&request)?;
//! assert_eq!(records.len(), 6);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;

use crate::error::{BackendError, MeterError, Result};
use crate::gaps::find_gaps;
use crate::range::Range;
use crate::record::BillingRecord;
use crate::store::Store;

/// Usage of one series over one queried range.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    /// Labels identifying the series.
    pub labels: BTreeMap<String, String>,
    /// Usage integrated over the queried range.
    pub amount: f64,
}

impl UsageSample {
    /// Creates an unlabeled sample.
    pub fn new(amount: f64) -> Self {
        Self {
            labels: BTreeMap::new(),
            amount,
        }
    }

    /// Replaces the sample's labels.
    #[must_use]
    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }
}

/// A metrics backend able to integrate a query over a time range.
pub trait UsageBackend {
    /// Returns the usage accumulated over `range` for every series `query`
    /// yields. An empty vector means no series reported usage.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] for query, transport or decoding failures.
    fn integrate(
        &self,
        query: &str,
        range: &Range,
    ) -> std::result::Result<Vec<UsageSample>, BackendError>;
}

/// Parameters of one metering run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterRequest {
    /// The expression to meter.
    pub query: String,
    /// The subject the usage is billed to.
    pub subject: String,
    /// The range to meter.
    pub range: Range,
    /// Maximum length of each metered sub-range.
    pub precision: TimeDelta,
}

impl MeterRequest {
    /// Creates a request.
    pub fn new(
        query: impl Into<String>,
        subject: impl Into<String>,
        range: Range,
        precision: TimeDelta,
    ) -> Self {
        Self {
            query: query.into(),
            subject: subject.into(),
            range,
            precision,
        }
    }
}

/// Outcome of [`Meter::fill_gaps`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterReport {
    /// The uncovered ranges that were metered.
    pub gaps: Vec<Range>,
    /// Number of records written to the store.
    pub records_written: usize,
}

/// Produces billing records from a [`UsageBackend`].
#[derive(Default)]
pub struct Meter {
    backend: Option<Box<dyn UsageBackend>>,
}

impl Meter {
    /// Creates a meter over the given backend.
    pub fn new(backend: Box<dyn UsageBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Meters `request.range` in segments of `request.precision`.
    ///
    /// For every series the backend reports anywhere in the run, the returned
    /// records tile the range: one record per segment, `records[i].end ==
    /// records[i + 1].start`, spans summing to the range's duration. A series
    /// absent from some segment gets a zero-amount record there. When no
    /// segment reports any series, one unlabeled zero-amount record per
    /// segment records that the range was metered. A zero-length range
    /// yields no records.
    ///
    /// # Errors
    ///
    /// - [`MeterError::NoBackend`] if the meter has no backend
    /// - [`MeterError::InvalidPrecision`] if the precision is not a positive
    ///   whole number of seconds
    /// - [`MeterError::UnalignedRange`] if the range does not start and end on
    ///   whole seconds
    /// - [`MeterError::Backend`] if any segment's query fails; no records are
    ///   returned in that case
    pub fn run(
        &self,
        request: &MeterRequest,
    ) -> std::result::Result<Vec<BillingRecord>, MeterError> {
        let backend = self.backend.as_deref().ok_or_else(|| MeterError::NoBackend {
            query: request.query.clone(),
        })?;
        if request.precision <= TimeDelta::zero() || request.precision.subsec_nanos() != 0 {
            return Err(MeterError::InvalidPrecision {
                precision: request.precision,
            });
        }
        if !request.range.is_whole_seconds() {
            return Err(MeterError::UnalignedRange {
                query: request.query.clone(),
                range: request.range,
            });
        }
        if request.range.is_empty() {
            return Ok(Vec::new());
        }

        let mut per_segment = Vec::new();
        let mut series: BTreeSet<BTreeMap<String, String>> = BTreeSet::new();
        for segment in request.range.segment(request.precision) {
            let samples = backend
                .integrate(&request.query, &segment)
                .map_err(|source| MeterError::Backend {
                    query: request.query.clone(),
                    range: segment,
                    source,
                })?;
            series.extend(samples.iter().map(|sample| sample.labels.clone()));
            per_segment.push((segment, samples));
        }
        if series.is_empty() {
            series.insert(BTreeMap::new());
        }

        let mut records = Vec::with_capacity(per_segment.len() * series.len());
        for (segment, samples) in per_segment {
            let mut amounts: BTreeMap<&BTreeMap<String, String>, f64> = BTreeMap::new();
            for sample in &samples {
                *amounts.entry(&sample.labels).or_default() += sample.amount;
            }
            for labels in &series {
                let amount = amounts.get(labels).copied().unwrap_or(0.0);
                let mut record =
                    BillingRecord::new(&request.query, &request.subject, segment, amount);
                record.labels.clone_from(labels);
                records.push(record);
            }
        }

        tracing::info!(
            query = %request.query,
            subject = %request.subject,
            range = %request.range,
            series = series.len(),
            records = records.len(),
            "metered usage"
        );
        Ok(records)
    }

    /// Meters only the parts of `request.range` not already in `store`.
    ///
    /// Existing records for the query and subject are read back, the
    /// uncovered gaps computed, and each gap metered and written. Re-running
    /// after a partial failure is safe: writes overwrite by key.
    ///
    /// # Errors
    ///
    /// Returns store read/write errors and any error from [`Meter::run`].
    pub fn fill_gaps(&self, store: &dyn Store, request: &MeterRequest) -> Result<MeterReport> {
        let existing = store.read(&request.range, &request.query, &request.subject)?;
        let gaps = find_gaps(&existing, &request.range);

        let mut records_written = 0;
        for gap in &gaps {
            let records = self.run(&MeterRequest {
                range: *gap,
                ..request.clone()
            })?;
            for record in &records {
                store.write(record)?;
            }
            records_written += records.len();
        }

        tracing::info!(
            query = %request.query,
            subject = %request.subject,
            existing = existing.len(),
            gaps = gaps.len(),
            records_written,
            "filled metering gaps"
        );
        Ok(MeterReport {
            gaps,
            records_written,
        })
    }
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

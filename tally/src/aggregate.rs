//! Roll-up of fine-grained billing records into reporting windows.
//!
//! The aggregator takes records produced by the meter (typically one per
//! sub-interval and label set) and folds them into one record per billable
//! series over a target range.
//!
//! # Algorithm
//!
//! Each input record is first clipped to the target range:
//!
//! ```text
//! target            |==========|
//! contained            |----|          used unchanged
//! covering        |--------------|     prorated to the target
//! right overlap   |-----|              prorated to [target.start, record.end]
//! left overlap             |------|    prorated to [record.start, target.end]
//! disjoint  |--|                       error
//! ```
//!
//! Clipped contributions are then sorted by time and summed per fingerprint.
//! Two contributions of the same series must abut exactly; a gap or an overlap
//! between them is reported instead of producing a record whose range would
//! misstate what was billed.
//!
//! # Proration
//!
//! Proration assumes a record's amount is spread uniformly over its span: a
//! record of amount `A` over duration `D` contributes `A * d / D` to a
//! sub-range of duration `d`. Amounts are kept as `f64` throughout with no
//! intermediate rounding.

use std::collections::{BTreeMap, HashMap};

use crate::error::AggregateError;
use crate::range::{Range, delta_secs};
use crate::record::{BillingRecord, FingerprintFn, sha256_fingerprint};

/// Grouping policy for an aggregation run.
///
/// `merge_labels` names the label keys that distinguish billable series.
/// Records that differ only in other labels share a fingerprint and are
/// summed when they abut in time. Concurrent records of one fingerprint are
/// not summed: their ranges overlap, so merging fails with
/// [`AggregateError::NonAdjacentMerge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationPolicy {
    /// Label keys that participate in the merge fingerprint.
    pub merge_labels: Vec<String>,
}

impl AggregationPolicy {
    /// Creates a policy grouping by the given label keys.
    pub fn new<S: Into<String>>(merge_labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            merge_labels: merge_labels.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds a label key to group by.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.merge_labels.push(label.into());
        self
    }
}

/// Scales a record onto `sub_range`, assuming a uniform amount distribution.
///
/// The amount is multiplied by `sub_range.duration() / record.duration()` and
/// the bounds are replaced by `sub_range`. Prorating onto the record's own
/// range returns it unchanged. The caller is responsible for `sub_range`
/// lying inside the record.
///
/// # Errors
///
/// Returns [`AggregateError::ZeroDurationProration`] if the record has zero
/// length and `sub_range` does not.
pub fn prorate(record: &BillingRecord, sub_range: Range) -> Result<BillingRecord, AggregateError> {
    let original = record.range();
    if original == sub_range {
        return Ok(record.clone());
    }

    let amount = if original.is_empty() {
        if !sub_range.is_empty() {
            return Err(AggregateError::ZeroDurationProration {
                query: record.query.clone(),
                record: original,
                target: sub_range,
            });
        }
        record.amount
    } else {
        record.amount * delta_secs(sub_range.duration()) / delta_secs(original.duration())
    };

    Ok(BillingRecord {
        amount,
        start: sub_range.start(),
        end: sub_range.end(),
        ..record.clone()
    })
}

/// Merges billing records into one record per series over a target range.
#[derive(Debug, Clone)]
pub struct Aggregator {
    policy: AggregationPolicy,
    fingerprint: FingerprintFn,
}

impl Aggregator {
    /// Creates an aggregator using the default SHA-256 fingerprint.
    pub fn new(policy: AggregationPolicy) -> Self {
        Self {
            policy,
            fingerprint: sha256_fingerprint,
        }
    }

    /// Replaces the fingerprint function used as the merge key.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: FingerprintFn) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Returns the grouping policy.
    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Aggregates `records` over `target`.
    ///
    /// Returns one record per distinct fingerprint, in order of each series'
    /// earliest contribution. Each output record carries the merge labels of
    /// its series (those present on the records) and covers exactly the part
    /// of `target` its inputs cover.
    ///
    /// # Errors
    ///
    /// - [`AggregateError::OutsideRange`] if a record does not touch `target`
    /// - [`AggregateError::NonAdjacentMerge`] if two records of one series
    ///   leave a gap or overlap after clipping
    /// - [`AggregateError::ZeroDurationProration`] for a zero-length record
    ///   that would have to be spread over a non-empty range
    /// - [`AggregateError::InvalidRecord`] for a record ending before it starts
    pub fn aggregate(
        &self,
        records: &[BillingRecord],
        target: &Range,
    ) -> Result<Vec<BillingRecord>, AggregateError> {
        let mut contributions = Vec::with_capacity(records.len());
        for record in records {
            record
                .validate()
                .map_err(|source| AggregateError::InvalidRecord {
                    query: record.query.clone(),
                    subject: record.subject.clone(),
                    source,
                })?;

            let clipped = clip(record, target)?;
            // A record that only touches the target boundary adds nothing.
            if clipped.range().is_empty() && !record.range().is_empty() {
                continue;
            }
            contributions.push(clipped);
        }
        contributions.sort_by_key(|record| (record.start, record.end));

        let mut merged: Vec<BillingRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for contribution in contributions {
            let key = (self.fingerprint)(&contribution, &self.policy.merge_labels);
            match index.get(&key) {
                Some(&slot) => merge_into(&mut merged[slot], &contribution)?,
                None => {
                    index.insert(key, merged.len());
                    merged.push(self.series_record(contribution));
                }
            }
        }

        tracing::debug!(
            window = %target,
            inputs = records.len(),
            series = merged.len(),
            "aggregated billing records"
        );
        Ok(merged)
    }

    /// Projects a first contribution onto its series' merge labels.
    fn series_record(&self, mut record: BillingRecord) -> BillingRecord {
        let labels: BTreeMap<String, String> = self
            .policy
            .merge_labels
            .iter()
            .filter_map(|key| record.labels.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        record.labels = labels;
        record
    }
}

/// Aggregates with the default fingerprint; see [`Aggregator::aggregate`].
///
/// # Errors
///
/// Same as [`Aggregator::aggregate`].
pub fn aggregate(
    records: &[BillingRecord],
    target: &Range,
    policy: &AggregationPolicy,
) -> Result<Vec<BillingRecord>, AggregateError> {
    Aggregator::new(policy.clone()).aggregate(records, target)
}

/// Restricts a record to its overlap with `target`.
fn clip(record: &BillingRecord, target: &Range) -> Result<BillingRecord, AggregateError> {
    let span = record.range();

    if target.within(span.start()) && target.within(span.end()) {
        return Ok(record.clone());
    }
    if span.within(target.start()) && span.within(target.end()) {
        return prorate(record, *target);
    }
    if span.start() < target.start() && target.within(span.end()) {
        return prorate(record, Range::new_unchecked(target.start(), span.end()));
    }
    if target.within(span.start()) && span.end() > target.end() {
        return prorate(record, Range::new_unchecked(span.start(), target.end()));
    }

    Err(AggregateError::OutsideRange {
        query: record.query.clone(),
        subject: record.subject.clone(),
        record: span,
        target: *target,
    })
}

/// Folds `incoming` into `existing`, which must abut it on either side.
fn merge_into(
    existing: &mut BillingRecord,
    incoming: &BillingRecord,
) -> Result<(), AggregateError> {
    if existing.end == incoming.start {
        existing.end = incoming.end;
    } else if incoming.end == existing.start {
        existing.start = incoming.start;
    } else {
        return Err(AggregateError::NonAdjacentMerge {
            query: existing.query.clone(),
            subject: existing.subject.clone(),
            existing: existing.range(),
            incoming: incoming.range(),
        });
    }
    existing.amount += incoming.amount;
    Ok(())
}

//! Billing records and their merge fingerprints.
//!
//! A [`BillingRecord`] is the atomic unit of billed usage: how much of a
//! query's quantity a subject consumed over a time span. Records serialize to
//! the durable JSON format shared by every store backend:
//!
//! ```json
//! {
//!   "query": "rate(container_cpu_usage_seconds_total[1m])",
//!   "subject": "tenant-a",
//!   "labels": { "pod": "web-0" },
//!   "amount": 12.5,
//!   "start": "2024-01-01T00:00:00Z",
//!   "end": "2024-01-01T01:00:00Z"
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RangeError;
use crate::range::Range;

/// One measurement of usage for a subject and query over a time span.
///
/// `amount` is in the query's native unit and is assumed to be spread
/// uniformly over `[start, end]`, which is what makes proration valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    /// The metered expression.
    pub query: String,
    /// The billed entity, e.g. a tenant or workload.
    pub subject: String,
    /// Grouping dimensions such as pod, namespace or container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Accumulated usage over the span.
    pub amount: f64,
    /// Start of the covered span.
    pub start: DateTime<Utc>,
    /// End of the covered span.
    pub end: DateTime<Utc>,
}

impl BillingRecord {
    /// Creates a record with no labels covering `range`.
    pub fn new(
        query: impl Into<String>,
        subject: impl Into<String>,
        range: Range,
        amount: f64,
    ) -> Self {
        Self {
            query: query.into(),
            subject: subject.into(),
            labels: BTreeMap::new(),
            amount,
            start: range.start(),
            end: range.end(),
        }
    }

    /// Replaces the record's labels.
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

    /// Returns the span covered by this record.
    ///
    /// Records built through [`BillingRecord::new`] or read back from a store
    /// always satisfy `start <= end`; see [`BillingRecord::validate`].
    pub fn range(&self) -> Range {
        Range::new_unchecked(self.start, self.end)
    }

    /// Checks the `start <= end` invariant for records built field by field.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Inverted`] if the record ends before it starts.
    pub fn validate(&self) -> Result<(), RangeError> {
        Range::new(self.start, self.end).map(|_| ())
    }
}

/// Computes the merge key of a record given the labels used for grouping.
///
/// Records with equal fingerprints are treated as the same billable series.
pub type FingerprintFn = fn(&BillingRecord, &[String]) -> String;

/// The default fingerprint: hex SHA-256 over subject, query and the sorted
/// `key:value` pairs of `merge_labels`.
///
/// A merge label missing from the record contributes an empty value, so a
/// record without `pod` and a record with `pod=""` share a series. Labels not
/// named in `merge_labels` are ignored.
pub fn sha256_fingerprint(record: &BillingRecord, merge_labels: &[String]) -> String {
    let mut keys: Vec<&str> = merge_labels.iter().map(String::as_str).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut hasher = Sha256::new();
    hasher.update(record.subject.as_bytes());
    hasher.update([0]);
    hasher.update(record.query.as_bytes());
    hasher.update([0]);
    for key in keys {
        let value = record.labels.get(key).map_or("", String::as_str);
        hasher.update(key.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

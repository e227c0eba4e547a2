//! Error types for metering, aggregation and billing-record storage.

use chrono::TimeDelta;
use thiserror::Error;

use crate::range::Range;

/// The main error type for all tally operations.
///
/// Every failure that can corrupt a billing total (records outside the
/// reporting window, gaps between merged records, backend failures) is
/// surfaced through this type rather than zero-filled or dropped.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Error constructing or manipulating a time range.
    #[error("range error: {0}")]
    Range(#[from] RangeError),

    /// Error while aggregating billing records.
    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    /// Error while metering usage from a metrics backend.
    #[error("meter error: {0}")]
    Meter(#[from] MeterError),

    /// Error reading or writing billing records.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration supplied by the caller.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors produced by range construction.
#[derive(Error, Debug)]
pub enum RangeError {
    /// The start of the range lies after its end.
    #[error("invalid range: start {start} is after end {end}")]
    Inverted {
        /// The requested start, RFC 3339.
        start: String,
        /// The requested end, RFC 3339.
        end: String,
    },

    /// A Unix timestamp cannot be represented.
    #[error("timestamp {secs} is out of range")]
    Timestamp {
        /// The rejected Unix time in seconds.
        secs: i64,
    },
}

/// Errors produced while prorating and merging billing records.
#[derive(Error, Debug)]
pub enum AggregateError {
    /// A record handed to the aggregator does not touch the target range.
    #[error("record {query:?} for subject {subject:?} at {record} is outside target {target}")]
    OutsideRange {
        /// The record's query.
        query: String,
        /// The record's subject.
        subject: String,
        /// The record's range.
        record: Range,
        /// The aggregation target range.
        target: Range,
    },

    /// Two records with the same fingerprint neither touch nor abut.
    ///
    /// This means either a gap in coverage or overlapping records, and
    /// summing them would misstate the billed interval.
    #[error(
        "cannot merge {query:?} for subject {subject:?}: {existing} is not adjacent to {incoming}"
    )]
    NonAdjacentMerge {
        /// The series' query.
        query: String,
        /// The series' subject.
        subject: String,
        /// The range accumulated so far.
        existing: Range,
        /// The range that failed to merge.
        incoming: Range,
    },

    /// A zero-length record cannot be spread over a non-empty range.
    #[error("cannot prorate zero-length record {query:?} at {record} onto {target}")]
    ZeroDurationProration {
        /// The record's query.
        query: String,
        /// The record's (zero-length) range.
        record: Range,
        /// The requested sub-range.
        target: Range,
    },

    /// An input record ends before it starts.
    #[error("record {query:?} for subject {subject:?} is malformed: {source}")]
    InvalidRecord {
        /// The record's query.
        query: String,
        /// The record's subject.
        subject: String,
        /// The range violation.
        #[source]
        source: RangeError,
    },
}

/// Errors produced while metering usage.
#[derive(Error, Debug)]
pub enum MeterError {
    /// The meter was invoked without a metrics backend.
    #[error("no metrics backend configured for query {query:?}")]
    NoBackend {
        /// The query that could not be run.
        query: String,
    },

    /// The sampling precision must be a positive whole number of seconds.
    #[error("invalid precision {precision}: must be a positive whole number of seconds")]
    InvalidPrecision {
        /// The rejected precision.
        precision: TimeDelta,
    },

    /// The metered range does not start and end on whole seconds.
    #[error("range {range} for query {query:?} does not start and end on whole seconds")]
    UnalignedRange {
        /// The query being metered.
        query: String,
        /// The rejected range.
        range: Range,
    },

    /// The metrics backend failed for one of the sub-ranges.
    #[error("query {query:?} over {range} failed: {source}")]
    Backend {
        /// The query that failed.
        query: String,
        /// The sub-range being metered.
        range: Range,
        /// The backend failure.
        #[source]
        source: BackendError,
    },
}

/// Failures reported by a metrics backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The request could not be delivered or timed out.
    #[error("request failed: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// The backend answered with a non-success HTTP status.
    #[error("backend returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The backend rejected the query itself (e.g., a syntax error).
    #[error("{error_type}: {message}")]
    Query {
        /// Backend-specific error class, e.g. `bad_data`.
        error_type: String,
        /// Backend error message.
        message: String,
    },

    /// The backend cannot integrate over the requested range exactly.
    #[error("cannot integrate over {range}: {reason}")]
    UnsupportedRange {
        /// The requested range.
        range: Range,
        /// Why the range cannot be queried.
        reason: String,
    },

    /// The response could not be decoded.
    #[error("malformed response: {reason}")]
    Decode {
        /// Description of what was malformed.
        reason: String,
    },
}

/// Errors from the billing-record stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// The path being accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized.
    #[error("failed to serialize record for key '{key}': {source}")]
    Serialize {
        /// The key being written.
        key: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored payload is not a valid billing record.
    #[error("failed to parse record at '{key}': {source}")]
    Deserialize {
        /// The key being read.
        key: String,
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A stored payload parsed but violates a record invariant.
    #[error("corrupt record at '{key}': {reason}")]
    CorruptRecord {
        /// The key being read.
        key: String,
        /// The violated invariant.
        reason: String,
    },

    /// A record cannot be mapped onto a storage key.
    #[error("invalid storage key: {reason}")]
    InvalidKey {
        /// Why no key could be derived.
        reason: String,
    },

    /// The object-store backend failed.
    #[error("object store error on '{key}': {reason}")]
    Object {
        /// The bucket-relative key or prefix involved.
        key: String,
        /// Description of the failure.
        reason: String,
    },

    /// An object was listed but is no longer present.
    #[error("object '{key}' not found")]
    NotFound {
        /// The missing key.
        key: String,
    },
}

/// Configuration errors raised before any work is done.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The store URL uses a scheme with no backend.
    #[error("unsupported store scheme '{scheme}' in '{url}' (expected file:// or s3://)")]
    UnsupportedScheme {
        /// The rejected scheme.
        scheme: String,
        /// The full URL.
        url: String,
    },

    /// The store URL could not be parsed.
    #[error("invalid store url '{url}': {reason}")]
    InvalidStoreUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The store URL names a backend this build was compiled without.
    #[error("store backend '{scheme}' is not enabled in this build")]
    BackendDisabled {
        /// The scheme whose feature is disabled.
        scheme: String,
    },

    /// A duration or interval argument is invalid.
    #[error("invalid interval '{value}': {reason}")]
    InvalidInterval {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;

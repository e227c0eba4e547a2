//! # tally
//!
//! Metering and billing-record core for usage-based billing.
//!
//! tally turns usage measured by a metrics backend into durable, auditable
//! billing records: every record states how much of a query's usage a
//! subject accumulated over an exact time span. Records are stored one per
//! document, read back by time window, and rolled up into coarser reporting
//! windows with proration at the edges.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Records of one series tile time without gaps or overlaps
//! - Writes are idempotent: the same span and labels always map to the same key
//! - Proration assumes usage is spread uniformly over a record's span
//! - Aggregation refuses to merge records that would misstate a billed range
//! - No background work: every operation runs on the caller's thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chrono::TimeDelta;
//! use tally::meter::{Meter, MeterRequest, UsageBackend, UsageSample};
//! use tally::error::BackendError;
//! use tally::store::FileStore;
//! use tally::{AggregationPolicy, Range, Store, aggregate};
//!
//! struct Flat;
//!
//! impl UsageBackend for Flat {
//!     fn integrate(&self, _query: &str, range: &Range) -> Result<Vec<UsageSample>, BackendError> {
//!         Ok(vec![UsageSample::new(range.duration().num_seconds() as f64)
//!             .with_labels([("pod", "web-0")])])
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::open("./billing")?;
//! let range = Range::from_unix_secs(1_700_000_000, 1_700_003_600)?;
//!
//! // Meter whatever part of the last hour is not stored yet.
//! let meter = Meter::new(Box::new(Flat));
//! meter.fill_gaps(&store, &MeterRequest::new("cpu", "tenant-a", range, TimeDelta::minutes(10)))?;
//!
//! // Roll the hour up into one record per pod.
//! let records = store.read(&range, "cpu", "tenant-a")?;
//! let hourly = aggregate(&records, &range, &AggregationPolicy::new(["pod"]))?;
//! for record in &hourly {
//!     println!("{} {:?} {}", record.range(), record.labels, record.amount);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Range`]: Validated time interval with segmenting and overlap tests
//! - [`BillingRecord`]: One usage amount for a subject, query and span
//! - [`Aggregator`]: Clips, prorates and merges records per fingerprint
//! - [`Meter`]: Produces gap-free records from a [`meter::UsageBackend`]
//! - [`Store`]: Durable record storage on a filesystem or object store
//! - [`Report`]: Per-period aggregation of stored records
//!
//! ## Modules
//!
//! - [`range`]: Time ranges and segmentation
//! - [`record`]: Billing records and fingerprints
//! - [`aggregate`](mod@aggregate): Proration and aggregation
//! - [`gaps`]: Coverage and gap detection
//! - [`meter`]: Metering against a usage backend
//! - [`store`]: Store trait, key codec and backends
//! - [`report`]: Per-period reports
//! - [`config`]: Store URLs and interval parsing
//! - `prometheus`: Prometheus usage backend (feature `prometheus`)
//! - [`error`]: Error types

pub mod aggregate;
pub mod config;
pub mod error;
pub mod gaps;
pub mod meter;
#[cfg(feature = "prometheus")]
pub mod prometheus;
pub mod range;
pub mod record;
pub mod report;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use aggregate::{AggregationPolicy, Aggregator, aggregate, prorate};
pub use config::StoreUrl;
pub use error::{Result, TallyError};
pub use gaps::find_gaps;
pub use meter::{Meter, MeterReport, MeterRequest};
pub use range::Range;
pub use record::{BillingRecord, FingerprintFn, sha256_fingerprint};
pub use report::Report;
pub use store::{Store, open_store};

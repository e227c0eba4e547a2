//! Durable storage of billing records.
//!
//! A [`Store`] persists one JSON document per record and reads back every
//! record of a subject and query overlapping a time window. Two backends
//! share the key layout and payload format defined in [`codec`]:
//!
//! - [`FileStore`]: a directory tree on the local filesystem
//! - [`ObjectStore`]: a bucket and key prefix behind an [`ObjectClient`]
//!
//! # Guarantees
//!
//! - Writing a record whose key already exists replaces it; repeated writes
//!   never duplicate.
//! - A single write is all-or-nothing (atomic rename, single PUT), so
//!   concurrent writers of the same key never leave interleaved content.
//! - There are no multi-record transactions. A failed batch is repaired by
//!   writing it again.
//! - `read` returns records in no particular order.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally::config::StoreUrl;
//! use tally::store::open_store;
//! use tally::{BillingRecord, Range};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = open_store(&"file:///var/lib/tally".parse::<StoreUrl>()?)?;
//! let range = Range::from_unix_secs(1_700_000_000, 1_700_003_600)?;
//! store.write(&BillingRecord::new("cpu", "tenant-a", range, 42.0))?;
//! let records = store.read(&range, "cpu", "tenant-a")?;
//! assert_eq!(records.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod file;
pub mod object;
#[cfg(feature = "s3")]
pub mod s3;

pub use file::FileStore;
pub use object::{MemoryObjectClient, ObjectClient, ObjectStore};

use crate::config::StoreUrl;
use crate::error::Result;
use crate::range::Range;
use crate::record::BillingRecord;

/// Persistence of billing records keyed by subject, query, span and labels.
pub trait Store: Send + Sync {
    /// Persists `record`, replacing any record with the same key.
    ///
    /// # Errors
    ///
    /// Returns a store error if no key can be derived or the write fails.
    fn write(&self, record: &BillingRecord) -> Result<()>;

    /// Returns every record of `subject` and `query` overlapping `range`.
    ///
    /// Overlap is strict: a record ending exactly at `range.start()` is not
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns a store error if listing or fetching fails, or a payload is
    /// corrupt.
    fn read(&self, range: &Range, query: &str, subject: &str) -> Result<Vec<BillingRecord>>;
}

/// Opens the backend named by a store URL.
///
/// # Errors
///
/// Returns an I/O error if a file store root cannot be created, or
/// [`crate::error::ConfigError::BackendDisabled`] for `s3://` URLs when the
/// `s3` feature is off.
pub fn open_store(url: &StoreUrl) -> Result<Box<dyn Store>> {
    match url {
        StoreUrl::File { root } => Ok(Box::new(FileStore::open(root)?)),
        #[cfg(feature = "s3")]
        StoreUrl::S3 { bucket, prefix } => {
            let client = s3::S3Client::from_env()?;
            Ok(Box::new(ObjectStore::new(client, bucket, prefix)))
        }
        #[cfg(not(feature = "s3"))]
        StoreUrl::S3 { .. } => Err(crate::error::ConfigError::BackendDisabled {
            scheme: "s3".to_string(),
        }
        .into()),
    }
}

/// Decodes fetched payloads, keeping those that strictly overlap `range`.
pub(crate) fn keep_overlapping(
    key: &str,
    payload: &[u8],
    range: &Range,
    out: &mut Vec<BillingRecord>,
) -> Result<()> {
    let record = codec::decode_record(key, payload)?;
    if record.range().overlaps(range) {
        out.push(record);
    } else {
        tracing::debug!(key, "record outside requested range after decoding");
    }
    Ok(())
}

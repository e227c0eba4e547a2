//! Object-store backend.
//!
//! Records live under `<prefix>/<subject>/<hex(query)>/...` in a bucket.
//! Listing by prefix is cheap while fetching is not, so `read` decodes the
//! span from every listed key and fetches only the candidates.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::range::Range;
use crate::record::BillingRecord;
use crate::store::{Store, codec, keep_overlapping};

/// Minimal object-storage capability: whole-object put and get, and listing
/// keys by prefix.
pub trait ObjectClient: Send + Sync {
    /// Stores `body` at `key`, replacing any existing object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Object`] if the upload fails.
    fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Fetches the object at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the object does not exist, or
    /// [`StoreError::Object`] for other failures.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Lists every key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Object`] if the bucket is missing or listing
    /// fails.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// A [`Store`] over a bucket and key prefix.
#[derive(Debug)]
pub struct ObjectStore<C> {
    client: C,
    bucket: String,
    prefix: String,
}

impl<C: ObjectClient> ObjectStore<C> {
    /// Creates a store writing under `prefix` in `bucket`.
    ///
    /// Leading and trailing slashes of `prefix` are ignored; an empty prefix
    /// stores records at the bucket root.
    pub fn new(client: C, bucket: impl Into<String>, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self {
            client,
            bucket: bucket.into(),
            prefix,
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl<C: ObjectClient> Store for ObjectStore<C> {
    fn write(&self, record: &BillingRecord) -> Result<()> {
        let (key, payload) = codec::encode_record(record)?;
        let key = self.full_key(&key);
        self.client.put(&self.bucket, &key, payload)?;
        tracing::debug!(bucket = %self.bucket, key = %key, "put billing record");
        Ok(())
    }

    fn read(&self, range: &Range, query: &str, subject: &str) -> Result<Vec<BillingRecord>> {
        let prefix = self.full_key(&codec::series_prefix(subject, query)?);
        let keys = self.client.list(&self.bucket, &prefix)?;

        let mut records = Vec::new();
        let mut fetched = 0usize;
        for key in &keys {
            match codec::key_may_overlap(key, range) {
                Some(true) => {}
                Some(false) => continue,
                None => {
                    tracing::warn!(bucket = %self.bucket, key = %key, "skipping non-record object");
                    continue;
                }
            }
            // Objects below a nested prefix belong to some other layout.
            if key
                .strip_prefix(prefix.as_str())
                .is_none_or(|rest| rest.contains('/'))
            {
                continue;
            }

            let payload = match self.client.get(&self.bucket, key) {
                Ok(payload) => payload,
                Err(crate::error::TallyError::Store(StoreError::NotFound { .. })) => continue,
                Err(e) => return Err(e),
            };
            fetched += 1;
            keep_overlapping(key, &payload, range, &mut records)?;
        }

        tracing::debug!(
            bucket = %self.bucket,
            prefix = %prefix,
            listed = keys.len(),
            fetched,
            records = records.len(),
            "read billing records"
        );
        Ok(records)
    }
}

/// An in-process [`ObjectClient`] holding objects in memory.
///
/// Buckets must be created up front; operations on unknown buckets fail the
/// way a real object store does.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectClient {
    /// Creates a client with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client with one empty bucket.
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        let client = Self::new();
        client.create_bucket(bucket);
        client
    }

    /// Creates an empty bucket if it does not exist.
    pub fn create_bucket(&self, bucket: impl Into<String>) {
        self.lock().entry(bucket.into()).or_default();
    }

    /// Number of objects in `bucket`.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.lock().get(bucket).map_or(0, BTreeMap::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Vec<u8>>>> {
        // A panic while holding the lock cannot leave a half-written object.
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ObjectClient for MemoryObjectClient {
    fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let mut buckets = self.lock();
        let objects = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket, key))?;
        objects.insert(key.to_string(), body);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let buckets = self.lock();
        let objects = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket, key))?;
        objects.get(key).cloned().ok_or_else(|| {
            StoreError::NotFound {
                key: key.to_string(),
            }
            .into()
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let buckets = self.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| no_such_bucket(bucket, prefix))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

fn no_such_bucket(bucket: &str, key: &str) -> crate::error::TallyError {
    StoreError::Object {
        key: key.to_string(),
        reason: format!("bucket '{bucket}' does not exist"),
    }
    .into()
}

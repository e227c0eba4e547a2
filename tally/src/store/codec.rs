//! Key and payload encoding shared by every store backend.
//!
//! # Key Layout
//!
//! ```text
//! <subject>/<hex(query)>/<start_unix>-<end_unix>.json
//! <subject>/<hex(query)>/<start_unix>-<end_unix>-<labels_hash>.json
//! ```
//!
//! The label hash suffix is present only for labeled records, so records of
//! different series over the same span never share a key. Timestamps are
//! whole Unix seconds, which lets readers discard most keys of a listing
//! without fetching their payloads. Records with sub-second bounds have no
//! key: two of them could otherwise share one and overwrite each other. The
//! payload is the record's JSON document.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::range::Range;
use crate::record::BillingRecord;

/// File extension of every record key.
pub const RECORD_SUFFIX: &str = ".json";

/// Hex characters of the label hash kept in keys.
const LABEL_HASH_LEN: usize = 16;

/// Returns the key prefix, ending in `/`, under which all records of a
/// subject and query live.
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] if the subject is empty, `.` or `..`,
/// or contains a path separator.
pub fn series_prefix(subject: &str, query: &str) -> Result<String> {
    if subject.is_empty() || subject == "." || subject == ".." {
        return Err(StoreError::InvalidKey {
            reason: format!("subject {subject:?} cannot be used as a path segment"),
        }
        .into());
    }
    if subject.contains(['/', '\\']) {
        return Err(StoreError::InvalidKey {
            reason: format!("subject {subject:?} contains a path separator"),
        }
        .into());
    }
    Ok(format!("{subject}/{}/", hex::encode(query)))
}

/// Returns the bucket- or root-relative key of a record.
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] for an unusable subject, an inverted
/// record, a record starting before the Unix epoch, or a bound that is not a
/// whole second.
pub fn record_key(record: &BillingRecord) -> Result<String> {
    record.validate().map_err(|e| StoreError::InvalidKey {
        reason: e.to_string(),
    })?;
    let start = record.start.timestamp();
    let end = record.end.timestamp();
    if start < 0 {
        return Err(StoreError::InvalidKey {
            reason: format!("record starts before the Unix epoch: {}", record.range()),
        }
        .into());
    }
    if !record.range().is_whole_seconds() {
        return Err(StoreError::InvalidKey {
            reason: format!("record bounds are not whole seconds: {}", record.range()),
        }
        .into());
    }

    let prefix = series_prefix(&record.subject, &record.query)?;
    if record.labels.is_empty() {
        Ok(format!("{prefix}{start}-{end}{RECORD_SUFFIX}"))
    } else {
        let hash = labels_hash(&record.labels);
        Ok(format!("{prefix}{start}-{end}-{hash}{RECORD_SUFFIX}"))
    }
}

/// Short stable hash of a label set, used to keep keys of different series
/// apart.
pub fn labels_hash(labels: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in labels {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(LABEL_HASH_LEN);
    hash
}

/// Decodes the `(start_unix, end_unix)` span from a key or file name.
///
/// Returns `None` for names that are not record keys, such as temporary
/// files.
pub fn decode_key(key: &str) -> Option<(i64, i64)> {
    let name = key.rsplit('/').next()?;
    let stem = name.strip_suffix(RECORD_SUFFIX)?;
    let mut parts = stem.splitn(3, '-');

    let start = parse_secs(parts.next()?)?;
    let end = parse_secs(parts.next()?)?;
    if let Some(hash) = parts.next()
        && (hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()))
    {
        return None;
    }
    (start <= end).then_some((start, end))
}

/// Returns whether a key's encoded span may overlap `range`.
///
/// Keys hold floored seconds, so this is a superset test: every key whose
/// record overlaps `range` passes, and the payload decides the rest.
pub fn key_may_overlap(key: &str, range: &Range) -> Option<bool> {
    let (start, end) = decode_key(key)?;
    Some(start <= range.end().timestamp() && end >= range.start().timestamp())
}

/// Serializes a record, returning its key and payload.
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] if no key can be derived, or
/// [`StoreError::Serialize`] if encoding fails.
pub fn encode_record(record: &BillingRecord) -> Result<(String, Vec<u8>)> {
    let key = record_key(record)?;
    let payload = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Serialize {
        key: key.clone(),
        source,
    })?;
    Ok((key, payload))
}

/// Parses a record payload read from `key`.
///
/// # Errors
///
/// Returns [`StoreError::Deserialize`] for invalid JSON and
/// [`StoreError::CorruptRecord`] for a record ending before it starts.
pub fn decode_record(key: &str, payload: &[u8]) -> Result<BillingRecord> {
    let record: BillingRecord =
        serde_json::from_slice(payload).map_err(|source| StoreError::Deserialize {
            key: key.to_string(),
            source,
        })?;
    record.validate().map_err(|e| StoreError::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(record)
}

fn parse_secs(digits: &str) -> Option<i64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

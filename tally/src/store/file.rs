//! Filesystem store backend.
//!
//! # File Layout
//!
//! ```text
//! root/
//! └── tenant-a/                          <- subject
//!     └── 73756d28...29/                 <- hex(query)
//!         ├── 1700000000-1700000600.json
//!         └── 1700000600-1700001200-9f2c4e01a7b3d5e6.json
//! ```
//!
//! Writes go to a hidden temporary file in the destination directory and are
//! renamed into place, so readers and concurrent writers only ever see whole
//! documents.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, StoreError};
use crate::range::Range;
use crate::record::BillingRecord;
use crate::store::{Store, codec, keep_overlapping};

/// Disambiguates temporary files of concurrent writes within one process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A [`Store`] rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Store for FileStore {
    fn write(&self, record: &BillingRecord) -> Result<()> {
        let (key, payload) = codec::encode_record(record)?;
        let path = self.root.join(&key);
        let Some(dir) = path.parent() else {
            return Err(StoreError::InvalidKey {
                reason: format!("key '{key}' has no parent directory"),
            }
            .into());
        };
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dir.join(format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        replace_file(&temp, &path, &payload)?;

        tracing::debug!(path = %path.display(), "wrote billing record");
        Ok(())
    }

    fn read(&self, range: &Range, query: &str, subject: &str) -> Result<Vec<BillingRecord>> {
        let dir = self.root.join(codec::series_prefix(subject, query)?);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Nothing written yet for this series.
            Err(e) if e.kind() == ErrorKind::NotFound && self.root.is_dir() => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();

            match codec::key_may_overlap(&name, range) {
                Some(true) => {}
                Some(false) => continue,
                None => {
                    tracing::debug!(name = %name, dir = %dir.display(), "skipping non-record file");
                    continue;
                }
            }

            let path = entry.path();
            let payload = match fs::read(&path) {
                Ok(payload) => payload,
                // Replaced by a concurrent rename between listing and reading.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&path, e)),
            };
            keep_overlapping(&path.display().to_string(), &payload, range, &mut records)?;
        }

        tracing::debug!(
            dir = %dir.display(),
            range = %range,
            records = records.len(),
            "read billing records"
        );
        Ok(records)
    }
}

/// Writes `payload` to `temp` and renames it over `path`.
///
/// `temp` is removed if either step fails.
fn replace_file(temp: &Path, path: &Path, payload: &[u8]) -> Result<()> {
    if let Err(e) = fs::write(temp, payload) {
        let _ = fs::remove_file(temp);
        return Err(io_error(temp, e));
    }
    if let Err(e) = fs::rename(temp, path) {
        let _ = fs::remove_file(temp);
        return Err(io_error(path, e));
    }
    Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> crate::error::TallyError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
    .into()
}

//! Caller-supplied configuration: store URLs and interval strings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::TimeDelta;

use crate::error::ConfigError;

/// Location of a billing-record store.
///
/// - `file://<path>` selects the filesystem backend rooted at `<path>`
///   (`file:///var/lib/tally` is absolute, `file://./data` relative).
/// - `s3://<bucket>/<key-prefix>` selects the object-store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    /// A local directory.
    File {
        /// Root directory of the store.
        root: PathBuf,
    },
    /// An S3 bucket and key prefix.
    S3 {
        /// The bucket name.
        bucket: String,
        /// Key prefix inside the bucket, possibly empty.
        prefix: String,
    },
}

impl FromStr for StoreUrl {
    type Err = ConfigError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidStoreUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;

        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                if rest.is_empty() {
                    return Err(invalid("missing path"));
                }
                Ok(Self::File {
                    root: PathBuf::from(rest),
                })
            }
            "s3" => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(invalid("missing bucket"));
                }
                Ok(Self::S3 {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                })
            }
            _ => Err(ConfigError::UnsupportedScheme {
                scheme: scheme.to_string(),
                url: url.to_string(),
            }),
        }
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { root } => write!(f, "file://{}", root.display()),
            Self::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{prefix}"),
        }
    }
}

/// Parses an interval such as `90s`, `10m`, `1h` or `7d`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidInterval`] for empty, malformed, zero or
/// overflowing values, or an unknown unit.
pub fn parse_interval(value: &str) -> Result<TimeDelta, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidInterval {
        value: value.to_string(),
        reason,
    };

    let trimmed = value.trim();
    let Some(unit) = trimmed.chars().last() else {
        return Err(invalid("empty interval".to_string()));
    };
    let number = &trimmed[..trimmed.len() - unit.len_utf8()];
    let count: i64 = number
        .parse()
        .map_err(|e| invalid(format!("bad number {number:?}: {e}")))?;
    if count <= 0 {
        return Err(invalid("must be greater than zero".to_string()));
    }

    let delta = match unit {
        's' => TimeDelta::try_seconds(count),
        'm' => TimeDelta::try_minutes(count),
        'h' => TimeDelta::try_hours(count),
        'd' => TimeDelta::try_days(count),
        _ => return Err(invalid(format!("unknown unit '{unit}', use s, m, h or d"))),
    };
    delta.ok_or_else(|| invalid("too large".to_string()))
}

//! Time-range algebra.
//!
//! A [`Range`] is an immutable `[start, end]` interval of UTC instants. It is
//! the unit every other module works in: the meter tiles a range into
//! records, the gap detector subtracts covered ranges from a target range,
//! and the aggregator prorates records onto a reporting range.
//!
//! # Conventions
//!
//! - [`Range::within`] is inclusive on both ends.
//! - [`Range::segment`] treats the range as half-open `[start, end)` and
//!   produces contiguous pieces: the end of segment `i` is the start of
//!   segment `i + 1`.
//! - [`Range::overlaps`] is strict: ranges that only share an endpoint do not
//!   overlap.
//!
//! # Example
//!
//! ```rust
//! use chrono::TimeDelta;
//! use tally::Range;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let range = Range::from_unix_secs(0, 130)?;
//! let segments = range.segment(TimeDelta::seconds(25));
//! assert_eq!(segments.len(), 6);
//! assert_eq!(segments[5], Range::from_unix_secs(125, 130)?);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::error::RangeError;

/// An immutable time interval `[start, end]` with `start <= end`.
///
/// A zero-length range is legal and denotes a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Range {
    /// Creates a range from its endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Inverted`] if `start` is after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Inverted {
                start: start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                end: end.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            });
        }
        Ok(Self { start, end })
    }

    /// Builds a range whose ordering the caller has already established.
    pub(crate) fn new_unchecked(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end, "range start after end");
        Self { start, end }
    }

    /// Creates a range from Unix timestamps in whole seconds.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Timestamp`] if either value cannot be
    /// represented, or [`RangeError::Inverted`] if `start > end`.
    pub fn from_unix_secs(start: i64, end: i64) -> Result<Self, RangeError> {
        let to_time =
            |secs| DateTime::from_timestamp(secs, 0).ok_or(RangeError::Timestamp { secs });
        Self::new(to_time(start)?, to_time(end)?)
    }

    /// Creates the range `[end - lookback, end]`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Timestamp`] if the start underflows the
    /// representable time span, or [`RangeError::Inverted`] for a negative
    /// lookback.
    pub fn ending_at(end: DateTime<Utc>, lookback: TimeDelta) -> Result<Self, RangeError> {
        let start = end
            .checked_sub_signed(lookback)
            .ok_or(RangeError::Timestamp {
                secs: end.timestamp(),
            })?;
        Self::new(start, end)
    }

    /// The inclusive start of the range.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// The inclusive end of the range.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// The length of the range.
    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Returns whether the range has zero length.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns whether both endpoints fall on whole Unix seconds.
    pub fn is_whole_seconds(&self) -> bool {
        self.start.timestamp_subsec_nanos() == 0 && self.end.timestamp_subsec_nanos() == 0
    }

    /// Returns true iff `start <= t <= end`.
    pub fn within(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }

    /// Returns true if both ranges share more than a single endpoint.
    ///
    /// A zero-length range overlaps another range when its instant falls
    /// strictly inside it.
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the inclusive intersection of two ranges, if any.
    ///
    /// Ranges that only touch at an endpoint intersect in a zero-length range.
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(Range { start, end })
    }

    /// Splits the range into consecutive pieces of length `interval`.
    ///
    /// The last piece is shorter when the range is not a whole multiple of
    /// `interval`. A non-positive `interval` yields no segments; an interval
    /// at least as long as the range yields the range itself.
    pub fn segment(&self, interval: TimeDelta) -> Vec<Range> {
        if interval <= TimeDelta::zero() {
            return Vec::new();
        }

        let mut segments = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor
                .checked_add_signed(interval)
                .map_or(self.end, |next| next.min(self.end));
            segments.push(Range {
                start: cursor,
                end: next,
            });
            cursor = next;
        }

        if segments.is_empty() {
            segments.push(*self);
        }
        segments
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }
}

/// Converts a time delta to fractional seconds.
#[allow(clippy::cast_precision_loss)] // Billing spans are far below 2^53 seconds
pub(crate) fn delta_secs(delta: TimeDelta) -> f64 {
    delta.num_seconds() as f64 + f64::from(delta.subsec_nanos()) / 1e9
}

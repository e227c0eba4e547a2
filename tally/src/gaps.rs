//! Coverage analysis over stored billing records.
//!
//! Before metering a range, the meter asks which parts of it already have
//! records so that usage is never computed twice. [`find_gaps`] answers that
//! question; [`covered`] returns the complement.

use crate::range::Range;
use crate::record::BillingRecord;

/// Returns the merged, sorted intervals of `target` covered by `records`.
///
/// Records may be unsorted, overlapping or partly outside `target`; each is
/// clipped to the target first. Touching intervals are joined. Records ending
/// before they start cover nothing.
pub fn covered(records: &[BillingRecord], target: &Range) -> Vec<Range> {
    let mut clipped: Vec<Range> = records
        .iter()
        .filter_map(|record| Range::new(record.start, record.end).ok())
        .filter_map(|range| range.intersection(target))
        .filter(|range| !range.is_empty())
        .collect();
    clipped.sort_by_key(|range| (range.start(), range.end()));

    let mut merged: Vec<Range> = Vec::with_capacity(clipped.len());
    for range in clipped {
        match merged.last_mut() {
            Some(last) if range.start() <= last.end() => {
                if range.end() > last.end() {
                    *last = Range::new_unchecked(last.start(), range.end());
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Returns the maximal sub-ranges of `target` not covered by any record.
///
/// The result is sorted and never contains zero-length gaps. When the
/// records cover the whole target the result is empty.
pub fn find_gaps(records: &[BillingRecord], target: &Range) -> Vec<Range> {
    let mut gaps = Vec::new();
    let mut cursor = target.start();

    for range in covered(records, target) {
        if range.start() > cursor {
            gaps.push(Range::new_unchecked(cursor, range.start()));
        }
        cursor = cursor.max(range.end());
    }

    if cursor < target.end() {
        gaps.push(Range::new_unchecked(cursor, target.end()));
    }

    tracing::debug!(window = %target, gaps = gaps.len(), "computed coverage gaps");
    gaps
}

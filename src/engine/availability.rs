use chrono::TimeDelta;

use crate::model::TimeRange;

/// Merge start-sorted ranges into disjoint ones. Touching ranges are joined.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both must be sorted and disjoint.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                result.push(TimeRange { start: cursor, end: r.start });
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(TimeRange { start: cursor, end: b.end });
        }
    }

    result
}

/// Gaps in `opening` not covered by `booked`, at least `min` long.
/// `booked` may be unsorted and overlapping.
pub fn free_windows(opening: TimeRange, booked: &[TimeRange], min: TimeDelta) -> Vec<TimeRange> {
    let mut booked = booked.to_vec();
    booked.sort_by_key(|r| r.start);
    let booked = merge_overlapping(&booked);
    subtract_ranges(&[opening], &booked)
        .into_iter()
        .filter(|r| r.duration() >= min)
        .collect()
}

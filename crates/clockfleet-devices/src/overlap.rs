//! Half-open interval admission for scheduled notices.
//!
//! Intervals are `[start, start + duration)`. Two intervals conflict when
//! `s1 < e2 && e1 > s2`; touching boundaries (`e1 == s2`) do not conflict and
//! a zero-length interval never conflicts with anything.

use crate::types::ScheduledNotice;

/// Whether `[a_start, a_start + a_dur)` and `[b_start, b_start + b_dur)` intersect.
pub fn intervals_overlap(a_start: i64, a_dur: i64, b_start: i64, b_dur: i64) -> bool {
    if a_dur <= 0 || b_dur <= 0 {
        return false;
    }
    let a_end = a_start.saturating_add(a_dur);
    let b_end = b_start.saturating_add(b_dur);
    a_start < b_end && a_end > b_start
}

/// First existing entry that the proposed interval would overlap, if any.
pub fn find_conflict(
    existing: &[ScheduledNotice],
    start_ms: i64,
    duration_ms: i64,
) -> Option<&ScheduledNotice> {
    existing
        .iter()
        .find(|n| intervals_overlap(n.start_ms, n.duration_ms, start_ms, duration_ms))
}

/// True when the proposed interval may be admitted next to `existing`.
pub fn admits(existing: &[ScheduledNotice], start_ms: i64, duration_ms: i64) -> bool {
    find_conflict(existing, start_ms, duration_ms).is_none()
}

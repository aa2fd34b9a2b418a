use serde::Serialize;

/// Half-open time range `[start, end)` in epoch milliseconds.
///
/// `version` is stamped by the owning window from a monotonically
/// increasing counter. Two intervals with the same bounds but different
/// versions are different intervals: a recovery step that captured an
/// older interval must not overwrite a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
    pub version: u64,
}

impl Interval {
    pub fn new(start: i64, end: i64, version: u64) -> Self {
        Self {
            start,
            end,
            version,
        }
    }

    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// `start <= now < end`
    pub fn contains(&self, now: i64) -> bool {
        self.start <= now && now < self.end
    }

    /// True when `duration` is within `tolerance_ms` of this interval's
    /// own length. Used to drop redundant re-trips.
    pub fn similar(&self, duration: i64, tolerance_ms: i64) -> bool {
        tolerance_ms >= 0 && self.duration().abs_diff(duration) <= tolerance_ms as u64
    }
}

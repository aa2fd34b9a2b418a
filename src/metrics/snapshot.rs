use serde::Serialize;

/// Immutable result of one histogram rotation.
/// Latencies are aligned milliseconds, see [`align`](super::histogram::align).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Percentage in 0.0..=100.0
    pub availability: f64,
    pub records: u64,
    pub data_size: u64,
    /// Sum of all aligned latencies
    pub elapsed_time: u64,
    pub min: u64,
    pub max: u64,
    pub avg: u64,
    pub tp30: u64,
    pub tp50: u64,
    pub tp90: u64,
    pub tp99: u64,
    pub tp999: u64,
}

impl Snapshot {
    /// All-zero snapshot used before the first rotation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Convenience: did the window see any traffic at all?
    pub fn has_data(&self) -> bool {
        self.requests > 0
    }
}

/// `successes / (successes + failures) * 100`, or 100 with no failures.
pub(crate) fn availability(successes: u64, failures: u64) -> f64 {
    if failures == 0 {
        return 100.0;
    }
    successes as f64 * 100.0 / (successes + failures) as f64
}

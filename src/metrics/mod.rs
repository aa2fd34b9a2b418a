pub mod histogram;
pub mod interval;
pub mod snapshot;
pub mod window;

pub use histogram::{align, Histogram};
pub use interval::Interval;
pub use snapshot::Snapshot;
pub use window::{Gauge, GaugeGuard, LiveView, ViewReport, Window};

/// One successful call as seen by a window.
/// This is the "write" side: the invocation pipeline builds these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    /// Wall time of the call; negative values are dropped
    pub latency_ms: i64,
    /// Records carried by the response, if the protocol reports them
    pub records: i64,
    /// Payload size in bytes
    pub bytes: i64,
}

impl Sample {
    pub fn new(latency_ms: i64) -> Self {
        Self {
            latency_ms,
            ..Self::default()
        }
    }

    pub fn record_into(&self, window: &Window) {
        window.success_with(self.latency_ms, self.records, self.bytes);
    }
}

//! Client-side call telemetry for an RPC runtime.
//!
//! Every outbound call reports its outcome into a [`Window`]: a rolling,
//! lock-free latency histogram plus the live gauges and breaker periods a
//! circuit-breaker policy and a load balancer read. A [`Dashboard`] routes
//! call events to the per-node and per-method windows of one target;
//! [`Dashboards`] keys dashboards by target.

pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod metrics;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Settings, UntimedPolicy, WindowConfig};
pub use dashboard::{
    Binding, BreakerPolicy, CallEvent, Dashboard, DashboardReport, Dashboards, NeverTrip, Outcome,
};
pub use error::ConfigError;
pub use metrics::{
    align, Gauge, GaugeGuard, Histogram, Interval, LiveView, Sample, Snapshot, ViewReport, Window,
};

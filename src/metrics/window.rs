use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::histogram::Histogram;
use super::interval::Interval;
use super::snapshot::Snapshot;
use crate::clock::Clock;
use crate::config::{Settings, WindowConfig};
use crate::error::ConfigError;

// ─── Configuration ───────────────────────────────────────────────

/// A breaker/weak call whose duration is this close to the running
/// interval's duration is treated as a repeat and ignored
const DEBOUNCE_MS: i64 = 100;

// ─── Gauges ──────────────────────────────────────────────────────

/// Shared signed counter (in-flight calls, queued calls).
///
/// Every `incr` must be paired with exactly one `decr`; prefer
/// [`Gauge::enter`], which pairs them through `Drop`.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Last-writer-wins overwrite.
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn incr(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn decr(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::Relaxed) - 1
    }

    /// Increments now, decrements when the guard drops (including unwinds).
    pub fn enter(&self) -> GaugeGuard<'_> {
        self.incr();
        GaugeGuard(self)
    }
}

#[must_use = "the gauge is decremented as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.decr();
    }
}

/// Counters owned by a window and shared with every view it hands out.
#[derive(Debug, Default)]
struct Gauges {
    successive_failures: AtomicU64,
    actives: Gauge,
    distribution: Gauge,
}

// ─── Live view ───────────────────────────────────────────────────

/// Result of the most recent rotation.
///
/// `snapshot()` and `broken()` are fixed at rotation time. The gauge
/// accessors read the window's own counters, so their values may change
/// after the call returns. Use [`LiveView::freeze`] for a detached copy.
#[derive(Debug)]
pub struct LiveView {
    gauges: Arc<Gauges>,
    broken: bool,
    rotated_at: i64,
    snapshot: Snapshot,
}

/// Detached, serializable copy of a [`LiveView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewReport {
    pub successive_failures: u64,
    pub actives: i64,
    pub distribution: i64,
    pub broken: bool,
    pub rotated_at: i64,
    pub snapshot: Snapshot,
}

impl LiveView {
    fn new(gauges: Arc<Gauges>, broken: bool, rotated_at: i64, snapshot: Snapshot) -> Self {
        Self {
            gauges,
            broken,
            rotated_at,
            snapshot,
        }
    }

    /// Live value.
    pub fn successive_failures(&self) -> u64 {
        self.gauges.successive_failures.load(Ordering::Relaxed)
    }

    /// Live value.
    pub fn actives(&self) -> i64 {
        self.gauges.actives.get()
    }

    /// Live value.
    pub fn distribution(&self) -> i64 {
        self.gauges.distribution.get()
    }

    /// Whether the window was broken when this view was taken.
    pub fn broken(&self) -> bool {
        self.broken
    }

    pub fn rotated_at(&self) -> i64 {
        self.rotated_at
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn freeze(&self) -> ViewReport {
        ViewReport {
            successive_failures: self.successive_failures(),
            actives: self.actives(),
            distribution: self.distribution(),
            broken: self.broken,
            rotated_at: self.rotated_at,
            snapshot: self.snapshot,
        }
    }
}

// ─── Window ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BreakerMarks {
    broken: Option<Interval>,
    weak: Option<Interval>,
}

/// Metrics for one (target, method) key over a rolling period.
///
/// Writers go straight to the active [`Histogram`] through an atomic
/// pointer load. [`Window::snapshot`] swaps in a fresh histogram once the
/// period has expired and scans the retired one. A writer that loaded the
/// old pointer just before the swap may still land its sample in the
/// retired histogram while it is being scanned; the sample is then either
/// counted in that snapshot or lost. Percentiles are approximate anyway,
/// so the hot path stays lock-free instead.
pub struct Window {
    settings: Settings,
    clock: Arc<dyn Clock>,
    active: ArcSwap<Histogram>,
    last_rotation: AtomicI64,
    /// Held only while swapping and scanning
    rotation: Mutex<()>,
    last: ArcSwap<LiveView>,
    gauges: Arc<Gauges>,
    breaker: Mutex<BreakerMarks>,
    versions: AtomicU64,
}

impl Window {
    pub fn new(settings: Settings, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let gauges = Arc::new(Gauges::default());
        Self {
            settings,
            active: ArcSwap::from_pointee(Histogram::with_shift(settings.shift)),
            last_rotation: AtomicI64::new(now),
            rotation: Mutex::new(()),
            last: ArcSwap::from_pointee(LiveView::new(
                Arc::clone(&gauges),
                false,
                now,
                Snapshot::empty(),
            )),
            gauges,
            breaker: Mutex::new(BreakerMarks::default()),
            versions: AtomicU64::new(0),
            clock,
        }
    }

    pub fn from_config(config: &WindowConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        Ok(Self::new(config.validate()?, clock))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ── Hot path ────────────────────────────────────────────────

    pub fn success(&self, latency_ms: i64) {
        self.success_with(latency_ms, 0, 0);
    }

    pub fn success_with(&self, latency_ms: i64, records: i64, bytes: i64) {
        self.active.load().success(latency_ms, records, bytes);
        self.gauges.successive_failures.store(0, Ordering::Relaxed);
    }

    /// Success without usable timing; counted, never bucketed.
    pub fn untimed_success(&self, records: i64, bytes: i64) {
        self.active.load().untimed_success(records, bytes);
        self.gauges.successive_failures.store(0, Ordering::Relaxed);
    }

    pub fn failure(&self) {
        self.active.load().failure();
        self.gauges.successive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn actives(&self) -> &Gauge {
        &self.gauges.actives
    }

    pub fn distribution(&self) -> &Gauge {
        &self.gauges.distribution
    }

    pub fn successive_failures(&self) -> u64 {
        self.gauges.successive_failures.load(Ordering::Relaxed)
    }

    // ── Rotation ────────────────────────────────────────────────

    pub fn is_expired(&self) -> bool {
        self.expired_at(self.clock.now_millis())
    }

    fn expired_at(&self, now: i64) -> bool {
        now.saturating_sub(self.last_rotation.load(Ordering::Acquire)) > self.settings.window_ms
    }

    /// Rotates if the period has expired and returns the latest view.
    /// Calling it again within the same period changes nothing.
    pub fn snapshot(&self) -> Arc<LiveView> {
        let _rotation = self.rotation.lock();
        let now = self.clock.now_millis();
        if !self.expired_at(now) {
            return self.last.load_full();
        }

        let retired = self
            .active
            .swap(Arc::new(Histogram::with_shift(self.settings.shift)));
        self.last_rotation.store(now, Ordering::Release);

        let view = Arc::new(LiveView::new(
            Arc::clone(&self.gauges),
            self.is_broken_at(now),
            now,
            retired.snapshot(),
        ));
        self.last.store(Arc::clone(&view));

        debug!(
            requests = view.snapshot.requests,
            availability = view.snapshot.availability,
            tp99 = view.snapshot.tp99,
            "window rotated"
        );
        view
    }

    /// Latest rotated view, without attempting a rotation.
    pub fn last(&self) -> Arc<LiveView> {
        self.last.load_full()
    }

    // ── Breaker periods ─────────────────────────────────────────

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Opens `[now, now + duration)` as broken, followed by a weak period
    /// of `decubation_ms`. Ignored while a broken period of about the same
    /// length is still running.
    pub fn broken(&self, duration_ms: i64, decubation_ms: i64) {
        let now = self.clock.now_millis();
        let mut marks = self.breaker.lock();
        if let Some(current) = marks.broken {
            if now < current.end && current.similar(duration_ms, DEBOUNCE_MS) {
                debug!(duration_ms, "breaker trip debounced");
                return;
            }
        }

        let broken = Interval::new(now, now.saturating_add(duration_ms), self.next_version());
        let weak = Interval::new(
            broken.end,
            broken.end.saturating_add(decubation_ms),
            self.next_version(),
        );
        marks.broken = Some(broken);
        marks.weak = Some(weak);
        drop(marks);

        warn!(
            start = broken.start,
            end = broken.end,
            weak_end = weak.end,
            "breaker opened"
        );
    }

    /// Restarts the weak period as `[now, now + duration)`.
    ///
    /// `interval` must be the weak interval the caller read earlier
    /// through [`Window::weak_interval`]; if it has been replaced since,
    /// the call is stale and ignored. Also debounced like
    /// [`Window::broken`].
    pub fn weak(&self, interval: &Interval, duration_ms: i64) {
        let now = self.clock.now_millis();
        let mut marks = self.breaker.lock();
        let Some(current) = marks.weak else { return };
        if current.version != interval.version {
            return;
        }
        if now < current.end && current.similar(duration_ms, DEBOUNCE_MS) {
            debug!(duration_ms, "weak period debounced");
            return;
        }

        let weak = Interval::new(now, now.saturating_add(duration_ms), self.next_version());
        marks.weak = Some(weak);
        drop(marks);

        debug!(start = weak.start, end = weak.end, "weak period restarted");
    }

    pub fn is_broken(&self) -> bool {
        self.is_broken_at(self.clock.now_millis())
    }

    fn is_broken_at(&self, now: i64) -> bool {
        self.breaker
            .lock()
            .broken
            .is_some_and(|broken| broken.contains(now))
    }

    pub fn broken_interval(&self) -> Option<Interval> {
        self.breaker.lock().broken
    }

    pub fn weak_interval(&self) -> Option<Interval> {
        self.breaker.lock().weak
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("settings", &self.settings)
            .field("active", &*self.active.load())
            .field("last_rotation", &self.last_rotation.load(Ordering::Relaxed))
            .field("gauges", &self.gauges)
            .field("breaker", &*self.breaker.lock())
            .finish()
    }
}

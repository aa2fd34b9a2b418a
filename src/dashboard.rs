use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{Settings, UntimedPolicy, WindowConfig};
use crate::error::ConfigError;
use crate::metrics::{Sample, ViewReport, Window};

// ─── Events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<E> {
    Success,
    /// The error, when the pipeline has one to hand over
    Failure(Option<E>),
}

/// One finished remote call, as reported by the invocation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEvent<E> {
    pub target: String,
    pub method: String,
    pub outcome: Outcome<E>,
    /// Epoch millis; ≤ 0 means the pipeline never timed the call
    pub start_ms: i64,
    pub end_ms: i64,
    /// In-flight calls observed when this one completed
    pub concurrency: i64,
    pub records: i64,
    pub bytes: i64,
}

impl<E> CallEvent<E> {
    pub fn success(
        target: impl Into<String>,
        method: impl Into<String>,
        start_ms: i64,
        end_ms: i64,
    ) -> Self {
        Self::new(target, method, Outcome::Success, start_ms, end_ms)
    }

    pub fn failure(
        target: impl Into<String>,
        method: impl Into<String>,
        error: Option<E>,
        start_ms: i64,
        end_ms: i64,
    ) -> Self {
        Self::new(target, method, Outcome::Failure(error), start_ms, end_ms)
    }

    fn new(
        target: impl Into<String>,
        method: impl Into<String>,
        outcome: Outcome<E>,
        start_ms: i64,
        end_ms: i64,
    ) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            outcome,
            start_ms,
            end_ms,
            concurrency: 0,
            records: 0,
            bytes: 0,
        }
    }

    pub fn with_concurrency(mut self, concurrency: i64) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_payload(mut self, records: i64, bytes: i64) -> Self {
        self.records = records;
        self.bytes = bytes;
        self
    }

    /// `None` when either timestamp is missing.
    pub fn elapsed_ms(&self) -> Option<i64> {
        (self.start_ms > 0 && self.end_ms > 0).then(|| self.end_ms - self.start_ms)
    }
}

// ─── Breaker policy seam ─────────────────────────────────────────

/// Decides which failures feed the circuit breaker and what to do about
/// them. Implementations drive [`Window::broken`] and [`Window::weak`].
pub trait BreakerPolicy: Send + Sync {
    type Error;

    fn supports(&self, error: &Self::Error) -> bool;

    fn apply(&self, error: &Self::Error, window: &Window);
}

/// Policy for deployments without a breaker: no error ever qualifies.
#[derive(Debug)]
pub struct NeverTrip<E>(PhantomData<fn(&E)>);

impl<E> Default for NeverTrip<E> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E> BreakerPolicy for NeverTrip<E> {
    type Error = E;

    fn supports(&self, _error: &E) -> bool {
        false
    }

    fn apply(&self, _error: &E, _window: &Window) {}
}

// ─── Dashboard ───────────────────────────────────────────────────

/// What the dashboard key stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// A single remote node: outcomes also aggregate into the node window
    #[default]
    Node,
    /// A logical cluster: only per-method windows are kept
    Cluster,
}

/// Serializable state of one dashboard after the last rotation.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardReport {
    pub target: String,
    pub binding: Binding,
    pub node: Option<ViewReport>,
    pub methods: BTreeMap<String, ViewReport>,
}

/// Windows for one target: an aggregate window plus one per method,
/// created on the first call that names the method.
pub struct Dashboard<P: BreakerPolicy> {
    target: String,
    binding: Binding,
    settings: Settings,
    clock: Arc<dyn Clock>,
    policy: Arc<P>,
    node: Window,
    methods: DashMap<String, Arc<Window>>,
}

impl<P: BreakerPolicy> Dashboard<P> {
    pub fn new(
        target: impl Into<String>,
        binding: Binding,
        settings: Settings,
        clock: Arc<dyn Clock>,
        policy: Arc<P>,
    ) -> Self {
        Self {
            target: target.into(),
            binding,
            settings,
            node: Window::new(settings, Arc::clone(&clock)),
            clock,
            policy,
            methods: DashMap::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// Target-level window. Only fed when bound to a single node.
    pub fn node(&self) -> &Window {
        &self.node
    }

    /// Returns the window for `method`, creating it if needed.
    pub fn method(&self, method: &str) -> Arc<Window> {
        if let Some(window) = self.methods.get(method) {
            return Arc::clone(window.value());
        }
        let entry = self.methods.entry(method.to_owned()).or_insert_with(|| {
            debug!(peer = %self.target, method, "method window created");
            Arc::new(Window::new(self.settings, Arc::clone(&self.clock)))
        });
        Arc::clone(entry.value())
    }

    pub fn get_method(&self, method: &str) -> Option<Arc<Window>> {
        self.methods.get(method).map(|window| Arc::clone(window.value()))
    }

    /// Drops the window for `method`. Views already handed out stay valid.
    pub fn remove_method(&self, method: &str) -> Option<Arc<Window>> {
        self.methods.remove(method).map(|(_, window)| window)
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn handle(&self, event: &CallEvent<P::Error>) {
        let method = self.method(&event.method);
        let aggregate = self.binding == Binding::Node;
        let elapsed = event.elapsed_ms();
        let counted = elapsed.is_some() || self.settings.untimed == UntimedPolicy::Count;

        match &event.outcome {
            Outcome::Failure(error) => {
                if counted {
                    method.failure();
                    if aggregate {
                        self.node.failure();
                    }
                }
                if let Some(error) = error {
                    if self.policy.supports(error) {
                        self.policy.apply(error, &method);
                    }
                }
            }
            Outcome::Success => {
                match elapsed {
                    Some(latency_ms) => {
                        let sample = Sample {
                            latency_ms,
                            records: event.records,
                            bytes: event.bytes,
                        };
                        sample.record_into(&method);
                        if aggregate {
                            sample.record_into(&self.node);
                        }
                    }
                    None if counted => {
                        method.untimed_success(event.records, event.bytes);
                        if aggregate {
                            self.node.untimed_success(event.records, event.bytes);
                        }
                    }
                    None => {}
                }
                method.actives().set(event.concurrency);
                if aggregate {
                    self.node.actives().set(event.concurrency);
                }
            }
        }
    }

    /// Rotates every expired window. Scheduler-driven; not for the hot path.
    pub fn snapshot(&self) {
        self.node.snapshot();
        for window in self.methods.iter() {
            window.value().snapshot();
        }
    }

    pub fn report(&self) -> DashboardReport {
        DashboardReport {
            target: self.target.clone(),
            binding: self.binding,
            node: (self.binding == Binding::Node).then(|| self.node.last().freeze()),
            methods: self
                .methods
                .iter()
                .map(|window| (window.key().clone(), window.value().last().freeze()))
                .collect(),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────

/// Dashboards keyed by target, created on the first event for a target
/// and torn down explicitly with [`Dashboards::remove`].
pub struct Dashboards<P: BreakerPolicy> {
    binding: Binding,
    settings: Settings,
    clock: Arc<dyn Clock>,
    policy: Arc<P>,
    targets: DashMap<String, Arc<Dashboard<P>>>,
}

impl<P: BreakerPolicy> Dashboards<P> {
    /// Validates `config` once; every window created later reuses it.
    pub fn new(
        config: &WindowConfig,
        binding: Binding,
        policy: Arc<P>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            binding,
            settings: config.validate()?,
            clock,
            policy,
            targets: DashMap::new(),
        })
    }

    pub fn dashboard(&self, target: &str) -> Arc<Dashboard<P>> {
        if let Some(dashboard) = self.targets.get(target) {
            return Arc::clone(dashboard.value());
        }
        let entry = self.targets.entry(target.to_owned()).or_insert_with(|| {
            debug!(peer = target, binding = ?self.binding, "dashboard created");
            Arc::new(Dashboard::new(
                target,
                self.binding,
                self.settings,
                Arc::clone(&self.clock),
                Arc::clone(&self.policy),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, target: &str) -> Option<Arc<Dashboard<P>>> {
        self.targets.get(target).map(|dashboard| Arc::clone(dashboard.value()))
    }

    /// Tears down a target and all of its method windows.
    pub fn remove(&self, target: &str) -> Option<Arc<Dashboard<P>>> {
        let removed = self.targets.remove(target).map(|(_, dashboard)| dashboard);
        if let Some(dashboard) = &removed {
            info!(peer = target, methods = dashboard.method_count(), "dashboard removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn handle(&self, event: &CallEvent<P::Error>) {
        self.dashboard(&event.target).handle(event);
    }

    pub fn snapshot(&self) {
        for dashboard in self.targets.iter() {
            dashboard.value().snapshot();
        }
    }

    /// Reports sorted by target.
    pub fn reports(&self) -> Vec<DashboardReport> {
        let mut reports: Vec<_> = self
            .targets
            .iter()
            .map(|dashboard| dashboard.value().report())
            .collect();
        reports.sort_by(|a, b| a.target.cmp(&b.target));
        reports
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.reports())
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::{Stream, StreamExt};
use tracing::trace;

use crate::dashboard::{BreakerPolicy, DashboardReport, Dashboards};

// ─── Periodic rotation ───────────────────────────────────────────

/// Spawns a task that rotates every window once per `period`.
/// Abort the returned handle to stop it.
pub fn spawn_rotation<P>(dashboards: Arc<Dashboards<P>>, period: Duration) -> JoinHandle<()>
where
    P: BreakerPolicy + 'static,
{
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        loop {
            ticks.tick().await;
            dashboards.snapshot();
            trace!(targets = dashboards.len(), "rotation tick");
        }
    })
}

// ─── Report stream ───────────────────────────────────────────────

/// Rotates on every tick and yields the resulting reports.
/// The first tick fires immediately.
pub fn report_stream<P>(
    dashboards: Arc<Dashboards<P>>,
    period: Duration,
) -> impl Stream<Item = Vec<DashboardReport>>
where
    P: BreakerPolicy + 'static,
{
    let interval = tokio::time::interval(period);

    IntervalStream::new(interval).map(move |_| {
        dashboards.snapshot();
        dashboards.reports()
    })
}

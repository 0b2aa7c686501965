use super::TimerService;
use crate::config::{TimersConfig, MIN_TIMER_POLL_MS};
use crate::coordinator::{Coordinator, Outcome};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use tokio::time::{self, Duration};

const TIMERS_COMPONENT: &str = "timers";
/// Upper bound on timers fired per poll.
const DUE_BATCH_LIMIT: usize = 64;

/// Poll the durable timer table and fire every due key through the coordinator.
pub async fn run(
    config: TimersConfig,
    coordinator: Arc<Coordinator>,
    timers: Arc<dyn TimerService>,
) -> Result<()> {
    let poll_ms = config.poll_interval_ms.max(MIN_TIMER_POLL_MS);
    let mut interval = time::interval(Duration::from_millis(poll_ms));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    crate::health::mark_component_ok(TIMERS_COMPONENT);

    loop {
        interval.tick().await;
        match fire_due_timers(&coordinator, timers.as_ref(), Utc::now(), config.max_concurrent).await
        {
            Ok(_) => crate::health::mark_component_ok(TIMERS_COMPONENT),
            Err(e) => {
                crate::health::mark_component_error(TIMERS_COMPONENT, e.to_string());
                tracing::warn!("Timer query failed: {e:#}");
            }
        }
    }
}

/// Fire every timer due at `now`. Each key is handled independently; a
/// failure on one key is logged and never stops the others.
pub async fn fire_due_timers(
    coordinator: &Arc<Coordinator>,
    timers: &dyn TimerService,
    now: DateTime<Utc>,
    max_concurrent: usize,
) -> Result<usize> {
    let due = timers.due(now, DUE_BATCH_LIMIT)?;
    let fired = due.len();

    let mut in_flight = stream::iter(due.into_iter().map(|key| {
        let coordinator = Arc::clone(coordinator);
        async move {
            let result = coordinator.fire_timer_at(&key, now).await;
            (key, result)
        }
    }))
    .buffer_unordered(max_concurrent.max(1));

    while let Some((key, result)) = in_flight.next().await {
        match result {
            Ok(Outcome::NoOp) => tracing::debug!(key = %key, "Timer fired with nothing to do"),
            Ok(outcome) => tracing::debug!(key = %key, ?outcome, "Timer fired"),
            Err(e) => tracing::warn!(key = %key, "Timer fire failed: {e}"),
        }
    }

    Ok(fired)
}

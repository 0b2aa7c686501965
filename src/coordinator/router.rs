use super::actor::Actor;
use super::snapshot::{ActorSnapshot, SnapshotStore};
use super::types::{CorrelationKey, Link, Outcome, StreamEvent};
use super::CoordinatorError;
use crate::channels::MessageTransport;
use crate::compose::NotificationComposer;
use crate::config::CoordinatorConfig;
use crate::store::{MessageRecordStore, SubscriptionStore};
use crate::timers::TimerService;
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Collaborators shared by every actor.
pub struct CoordinatorDeps {
    pub records: Arc<dyn MessageRecordStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub timers: Arc<dyn TimerService>,
    pub transport: Arc<dyn MessageTransport>,
    pub composer: NotificationComposer,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub wait_window: Duration,
    /// Snapshots older than this are expired by [`Coordinator::recover`].
    pub stale_after: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            wait_window: config.wait_window(),
            stale_after: Duration::from_secs(config.stale_snapshot_secs),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rearmed: usize,
    pub expired: usize,
}

/// In-memory state behind one key's lock. `snapshot` is loaded on first use
/// and stays authoritative even when a save fails.
#[derive(Default)]
struct ActorSlot {
    snapshot: Option<ActorSnapshot>,
    saved: bool,
}

impl ActorSlot {
    fn evictable(&self) -> bool {
        self.saved && self.snapshot.as_ref().is_none_or(ActorSnapshot::is_idle)
    }
}

type SlotHandle = Arc<tokio::sync::Mutex<ActorSlot>>;

/// Routes events and timer fires to per-key actors.
///
/// Each key gets its own async mutex, held across every await of a
/// transition. Different keys never contend. Transitions run on their own
/// task, so a caller that stops waiting cannot leave one half-applied.
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    deps: CoordinatorDeps,
    settings: CoordinatorSettings,
    actors: Mutex<HashMap<CorrelationKey, SlotHandle>>,
}

enum Input {
    Event(StreamEvent, Option<Link>),
    TimerFired(DateTime<Utc>),
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps, settings: CoordinatorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                actors: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of keys currently held in memory.
    pub fn active_actors(&self) -> usize {
        self.inner.actors.lock().len()
    }

    #[instrument(skip(self, event, link), fields(key = %key, platform = %event.platform, status = ?event.payload.status))]
    pub async fn handle_event(
        &self,
        key: &CorrelationKey,
        event: StreamEvent,
        link: Option<&Link>,
    ) -> Result<Outcome, CoordinatorError> {
        self.run(key, Input::Event(event, link.cloned())).await
    }

    pub async fn fire_timer(&self, key: &CorrelationKey) -> Result<Outcome, CoordinatorError> {
        self.fire_timer_at(key, Utc::now()).await
    }

    /// Deliver a timer fire observed at `now`. A fire that arrives before the
    /// actor's wait deadline is ignored and the timer is re-armed.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn fire_timer_at(
        &self,
        key: &CorrelationKey,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoordinatorError> {
        self.run(key, Input::TimerFired(now)).await
    }

    async fn run(&self, key: &CorrelationKey, input: Input) -> Result<Outcome, CoordinatorError> {
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        let task = tokio::spawn(async move { inner.transition(&key, input).await });
        task.await
            .map_err(|e| CoordinatorError::TransitionAborted(e.to_string()))?
    }

    /// Current snapshot for `key` (the Idle shape if none exists).
    pub async fn snapshot(&self, key: &CorrelationKey) -> ActorSnapshot {
        self.inner.snapshot(key).await
    }

    /// Startup pass: expire stale snapshots and re-arm timers for every actor
    /// that was awaiting correlation when the process stopped.
    pub async fn recover(&self) -> Result<RecoveryReport, CoordinatorError> {
        self.inner.recover().await
    }
}

impl Inner {
    async fn transition(
        &self,
        key: &CorrelationKey,
        input: Input,
    ) -> Result<Outcome, CoordinatorError> {
        let slot = self.slot(key);
        let result = {
            let mut guard = slot.lock().await;
            let mut snapshot = self.loaded(key, &mut guard);
            let before = snapshot.clone();
            let mut actor = Actor::new(key, &mut snapshot, &self.deps, &self.settings);
            let result = match input {
                Input::Event(event, link) => actor.handle_event(event, link.as_ref()).await,
                Input::TimerFired(now) => actor.fire_timer(now).await,
            };
            self.commit(key, &mut guard, snapshot, &before);
            result
        };
        self.evict_if_idle(key, &slot);
        result
    }

    async fn snapshot(&self, key: &CorrelationKey) -> ActorSnapshot {
        let slot = self.slot(key);
        let snapshot = {
            let mut guard = slot.lock().await;
            self.loaded(key, &mut guard)
        };
        self.evict_if_idle(key, &slot);
        snapshot
    }

    async fn recover(&self) -> Result<RecoveryReport, CoordinatorError> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .context("stale_snapshot_secs out of range")?;
        let mut report = RecoveryReport::default();

        for (key, _) in self.deps.snapshots.list_updated_before(now - stale_after)? {
            let slot = self.slot(&key);
            let expired = {
                let mut guard = slot.lock().await;
                let mut snapshot = self.loaded(&key, &mut guard);
                let expired = !snapshot.is_idle();
                if expired {
                    let before = snapshot.clone();
                    if let Err(e) = self.deps.timers.cancel(&key) {
                        tracing::warn!(key = %key, "Failed to cancel stale timer: {e:#}");
                    }
                    snapshot.reset();
                    self.commit(&key, &mut guard, snapshot, &before);
                }
                expired
            };
            self.evict_if_idle(&key, &slot);
            if expired {
                tracing::info!(key = %key, "Expired stale actor snapshot");
                report.expired += 1;
            }
        }

        for (key, persisted) in self.deps.snapshots.list_armed()? {
            let fire_at = persisted.wait_deadline.unwrap_or(now);
            match self.deps.timers.arm_at(&key, fire_at) {
                Ok(deadline) => {
                    tracing::info!(key = %key, deadline = %deadline, "Re-armed wait timer");
                    report.rearmed += 1;
                }
                Err(e) => tracing::error!(key = %key, "Failed to re-arm wait timer: {e:#}"),
            }
        }

        Ok(report)
    }

    fn slot(&self, key: &CorrelationKey) -> SlotHandle {
        self.actors.lock().entry(key.clone()).or_default().clone()
    }

    fn loaded(&self, key: &CorrelationKey, slot: &mut ActorSlot) -> ActorSnapshot {
        if let Some(snapshot) = &slot.snapshot {
            return snapshot.clone();
        }
        let snapshot = match self.deps.snapshots.load(key) {
            Ok(found) => {
                slot.saved = true;
                found.unwrap_or_default()
            }
            Err(e) => {
                tracing::warn!(key = %key, "Failed to load actor snapshot; starting from Idle: {e:#}");
                ActorSnapshot::default()
            }
        };
        slot.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Persist `snapshot` if the transition changed it. Save failures are
    /// logged and the in-memory copy stays authoritative.
    fn commit(
        &self,
        key: &CorrelationKey,
        slot: &mut ActorSlot,
        mut snapshot: ActorSnapshot,
        before: &ActorSnapshot,
    ) {
        if snapshot != *before || !slot.saved {
            if snapshot.is_idle() {
                snapshot.reset();
            }
            snapshot.last_updated = Some(Utc::now());
            match self.deps.snapshots.save(key, &snapshot) {
                Ok(()) => slot.saved = true,
                Err(e) => {
                    slot.saved = false;
                    tracing::error!(key = %key, "Failed to save actor snapshot: {e:#}");
                }
            }
        }
        slot.snapshot = Some(snapshot);
    }

    /// Drop the slot for `key` once it is idle, persisted and unused.
    fn evict_if_idle(&self, key: &CorrelationKey, slot: &SlotHandle) {
        let mut actors = self.actors.lock();
        // One reference in the registry plus the caller's.
        if Arc::strong_count(slot) > 2 {
            return;
        }
        let idle = slot.try_lock().is_ok_and(|s| s.evictable());
        if idle {
            actors.remove(key);
        }
    }
}

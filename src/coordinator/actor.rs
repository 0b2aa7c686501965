//! Transitions of one correlation actor.
//!
//! An [`Actor`] borrows the key's snapshot for the duration of a single
//! invocation. The caller holds the key's lock, so nothing here needs to
//! guard against interleaving with another event for the same key.

use super::policy::{self, MergeContext, MergeDecision};
use super::router::{CoordinatorDeps, CoordinatorSettings};
use super::snapshot::ActorSnapshot;
use super::types::{
    CorrelationKey, Link, MessageRecord, MessageRecordPatch, NewMessageRecord, Outcome, Platform,
    PlatformSide, StreamEvent, StreamMetadata, StreamStatus,
};
use super::CoordinatorError;
use crate::channels::TransportError;
use crate::compose::RenderedBody;
use chrono::{DateTime, Utc};

pub(super) struct Actor<'a> {
    key: &'a CorrelationKey,
    state: &'a mut ActorSnapshot,
    deps: &'a CoordinatorDeps,
    settings: &'a CoordinatorSettings,
}

impl<'a> Actor<'a> {
    pub(super) fn new(
        key: &'a CorrelationKey,
        state: &'a mut ActorSnapshot,
        deps: &'a CoordinatorDeps,
        settings: &'a CoordinatorSettings,
    ) -> Self {
        Self {
            key,
            state,
            deps,
            settings,
        }
    }

    pub(super) async fn handle_event(
        &mut self,
        event: StreamEvent,
        link: Option<&Link>,
    ) -> Result<Outcome, CoordinatorError> {
        match event.payload.status {
            StreamStatus::Live => self.on_live(event, link).await,
            StreamStatus::Offline => self.on_offline(event).await,
        }
    }

    // ── Live ─────────────────────────────────────────────────────

    async fn on_live(
        &mut self,
        event: StreamEvent,
        link: Option<&Link>,
    ) -> Result<Outcome, CoordinatorError> {
        let platform = event.platform;

        if self.state.is_live(platform) {
            if let Some(outcome) = self.refresh_metadata(&event)? {
                return Ok(outcome);
            }
        }

        if let Some(record) = self.rejoinable_record(platform, link) {
            tracing::info!(key = %self.key, record = %record.id, %platform, "Platform rejoined merged record");
            return self.join(record, event).await;
        }

        let pending = self
            .state
            .pending_message_record_id
            .clone()
            .and_then(|id| self.load_record(&id));

        let decision = policy::decide(MergeContext {
            pending: pending.as_ref(),
            incoming: platform,
            link,
            window_open: self.state.timer_armed,
            other_live: self.state.is_live(platform.other()),
        });
        tracing::debug!(key = %self.key, %platform, ?decision, "Merge decision");

        match (decision, pending) {
            (MergeDecision::Merge, Some(record)) => self.join(record, event).await,
            (MergeDecision::AwaitCorrelation, _) => self.open_and_wait(event, link).await,
            _ => self.open_and_send(event, link).await,
        }
    }

    /// Duplicate live delivery: refresh the stored metadata and nothing else.
    /// Returns `None` when the live flag points at a record that is gone, in
    /// which case the flag is cleared and the event is handled as a new live.
    fn refresh_metadata(&mut self, event: &StreamEvent) -> Result<Option<Outcome>, CoordinatorError> {
        let platform = event.platform;
        let record = self
            .state
            .record_id(platform)
            .map(str::to_string)
            .and_then(|id| self.load_record(&id))
            .filter(|r| !r.closed && r.side(platform).live);

        let Some(mut record) = record else {
            tracing::warn!(key = %self.key, %platform, "Live flag without an open record; starting over");
            self.clear_side(platform);
            return Ok(None);
        };

        let side = record.side_mut(platform);
        side.metadata = Some(event.payload.metadata.clone());
        side.subscription = Some(event.subscription.clone());
        self.deps
            .records
            .update(&record.id, MessageRecordPatch::sides_of(&record))?;

        tracing::debug!(key = %self.key, record = %record.id, %platform, "Duplicate live; metadata refreshed");
        Ok(Some(Outcome::MetadataRefreshed { record: record.id }))
    }

    /// A merged record whose `platform` side went offline while the other side
    /// stayed live takes that side back instead of opening a second message.
    fn rejoinable_record(&self, platform: Platform, link: Option<&Link>) -> Option<MessageRecord> {
        let link = link?;
        let other_id = self.state.record_id(platform.other())?;
        self.load_record(other_id).filter(|r| {
            !r.closed
                && r.merged
                && r.link_id.as_deref() == Some(link.id.as_str())
                && !r.side(platform).live
        })
    }

    /// Attach `event`'s platform to an existing record and deliver it merged.
    async fn join(
        &mut self,
        mut record: MessageRecord,
        event: StreamEvent,
    ) -> Result<Outcome, CoordinatorError> {
        let platform = event.platform;

        if self.state.pending_message_record_id.as_deref() == Some(record.id.as_str()) {
            self.cancel_timer();
            self.state.pending_message_record_id = None;
        }

        *record.side_mut(platform) = live_side(&event);
        record.merged = true;
        let record = self
            .deps
            .records
            .update(&record.id, MessageRecordPatch::sides_of(&record))?;
        self.state.set_side(platform, Some(record.id.clone()));

        tracing::info!(key = %self.key, record = %record.id, %platform, "Merged into existing record");
        Ok(self.deliver(record).await)
    }

    /// First live side of a linked pair: open the record and wait for the other side.
    async fn open_and_wait(
        &mut self,
        event: StreamEvent,
        link: Option<&Link>,
    ) -> Result<Outcome, CoordinatorError> {
        let platform = event.platform;
        let record = self.create_record(&event, link)?;
        self.state.set_side(platform, Some(record.id.clone()));

        match self.arm_wait_window() {
            Ok(deadline) => {
                self.state.pending_message_record_id = Some(record.id.clone());
                self.state.timer_armed = true;
                self.state.wait_deadline = Some(deadline);
                tracing::info!(
                    key = %self.key,
                    record = %record.id,
                    %platform,
                    deadline = %deadline,
                    "Awaiting correlation"
                );
                Ok(Outcome::AwaitingCorrelation { record: record.id })
            }
            Err(e) => {
                tracing::warn!(key = %self.key, record = %record.id, "Failed to arm wait timer; notifying now: {e:#}");
                Ok(self.deliver(record).await)
            }
        }
    }

    /// Arm a fresh wait window. Any row still stored for the key is left over
    /// from an earlier cycle and is replaced rather than reused.
    fn arm_wait_window(&self) -> anyhow::Result<DateTime<Utc>> {
        self.deps.timers.cancel(self.key)?;
        self.deps.timers.arm(self.key, self.settings.wait_window)
    }

    /// Open a record for `event` and notify immediately.
    async fn open_and_send(
        &mut self,
        event: StreamEvent,
        link: Option<&Link>,
    ) -> Result<Outcome, CoordinatorError> {
        let record = self.create_record(&event, link)?;
        self.state.set_side(event.platform, Some(record.id.clone()));
        Ok(self.deliver(record).await)
    }

    fn create_record(
        &self,
        event: &StreamEvent,
        link: Option<&Link>,
    ) -> Result<MessageRecord, CoordinatorError> {
        let mut draft = NewMessageRecord {
            key: self.key.clone(),
            destination: event.subscription.destination.clone(),
            link_id: link.map(|l| l.id.clone()),
            priority: policy::record_priority(link, event.platform),
            twitch: PlatformSide::default(),
            kick: PlatformSide::default(),
        };
        match event.platform {
            Platform::Twitch => draft.twitch = live_side(event),
            Platform::Kick => draft.kick = live_side(event),
        }
        Ok(self.deps.records.create(draft)?)
    }

    // ── Offline ──────────────────────────────────────────────────

    async fn on_offline(&mut self, event: StreamEvent) -> Result<Outcome, CoordinatorError> {
        let platform = event.platform;
        if !self.state.is_live(platform) {
            tracing::debug!(key = %self.key, %platform, "Offline for a platform that is not live; ignoring");
            return Ok(Outcome::NoOp);
        }

        let record = self
            .state
            .record_id(platform)
            .map(str::to_string)
            .and_then(|id| self.load_record(&id))
            .filter(|r| !r.closed);
        self.state.set_side(platform, None);

        let Some(mut record) = record else {
            tracing::warn!(key = %self.key, %platform, "Offline without an open record; clearing state");
            return Ok(Outcome::NoOp);
        };

        let side = record.side_mut(platform);
        side.live = false;
        side.ended_at = Some(Utc::now());
        if event.payload.metadata != StreamMetadata::default() {
            side.metadata = Some(event.payload.metadata.clone());
        }

        if record.any_live() {
            return self.partial_offline(record).await;
        }
        self.close(record).await
    }

    /// One side went offline while the other is still live on the same record.
    async fn partial_offline(&mut self, record: MessageRecord) -> Result<Outcome, CoordinatorError> {
        let record = self
            .deps
            .records
            .update(&record.id, MessageRecordPatch::sides_of(&record))?;
        if record.message_id.is_none() {
            tracing::debug!(key = %self.key, record = %record.id, "Partial offline on an undelivered record");
            return Ok(Outcome::NoOp);
        }
        Ok(self.deliver(record).await)
    }

    /// Last live side went offline: send the offline update(s) and close.
    async fn close(&mut self, record: MessageRecord) -> Result<Outcome, CoordinatorError> {
        if self.state.pending_message_record_id.as_deref() == Some(record.id.as_str()) {
            self.cancel_timer();
            self.state.pending_message_record_id = None;
        }

        let mut updates = 0;
        if let Some(message_id) = record.message_id.clone() {
            // Both updates edit the same message, so the later one replaces
            // the earlier. They are still applied one at a time: if the
            // combined edit fails the priority section stays visible.
            for body in self.offline_bodies(&record) {
                match self
                    .deps
                    .transport
                    .update(&record.destination, &message_id, &body)
                    .await
                {
                    Ok(_) => updates += 1,
                    Err(e) => self.report_transport_error(&record, &e),
                }
            }
        } else {
            tracing::info!(key = %self.key, record = %record.id, "Record went offline before any notification; closing silently");
        }

        let patch = MessageRecordPatch {
            closed: Some(true),
            ..MessageRecordPatch::sides_of(&record)
        };
        self.deps.records.update(&record.id, patch)?;

        tracing::info!(key = %self.key, record = %record.id, updates, "Record closed");
        Ok(Outcome::Closed {
            record: record.id,
            updates,
        })
    }

    /// A single-platform record gets one update. A merged record gets one
    /// combined update when both offline texts match, otherwise the priority
    /// section first and then both sections, leaving both texts in the final
    /// message.
    fn offline_bodies(&self, record: &MessageRecord) -> Vec<RenderedBody> {
        let composer = &self.deps.composer;
        let participants = record.participants();
        if participants.len() < 2 {
            return vec![composer.compose_offline(record, &participants)];
        }

        let first = composer.offline_text(record, participants[0]);
        let second = composer.offline_text(record, participants[1]);
        if first == second {
            vec![composer.compose_offline(record, &participants)]
        } else {
            vec![
                composer.compose_offline(record, &participants[..1]),
                composer.compose_offline(record, &participants),
            ]
        }
    }

    // ── Timer ────────────────────────────────────────────────────

    pub(super) async fn fire_timer(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Outcome, CoordinatorError> {
        if !self.state.timer_armed {
            // Late fire after a cancel raced with the scheduler.
            self.cancel_timer();
            return Ok(Outcome::NoOp);
        }
        if let Some(deadline) = self.state.wait_deadline.filter(|d| *d > now) {
            tracing::debug!(key = %self.key, deadline = %deadline, "Timer fired before the wait deadline; re-arming");
            self.rearm_at(deadline);
            return Ok(Outcome::NoOp);
        }
        self.cancel_timer();

        let Some(record_id) = self.state.pending_message_record_id.clone() else {
            return Ok(Outcome::NoOp);
        };
        let Some(record) = self.load_record(&record_id).filter(|r| !r.closed) else {
            self.state.pending_message_record_id = None;
            return Ok(Outcome::NoOp);
        };

        if !self.late_merge_allowed(&record) {
            self.state.pending_message_record_id = None;
        }

        if !record.any_live() {
            self.state.pending_message_record_id = None;
            return self.close(record).await;
        }
        if record.message_id.is_some() {
            return Ok(Outcome::NoOp);
        }

        tracing::info!(key = %self.key, record = %record.id, "Wait window elapsed; notifying unmerged");
        Ok(self.deliver(record).await)
    }

    /// Link lookup failures degrade to no late merge.
    fn late_merge_allowed(&self, record: &MessageRecord) -> bool {
        let Some(link_id) = record.link_id.as_deref() else {
            return false;
        };
        match self.deps.subscriptions.link(link_id) {
            Ok(link) => link.is_some_and(|l| l.late_merge),
            Err(e) => {
                tracing::warn!(key = %self.key, link = link_id, "Link lookup failed: {e:#}");
                false
            }
        }
    }

    /// Put the stored timer row back at `deadline`, replacing whatever fired.
    fn rearm_at(&self, deadline: DateTime<Utc>) {
        let rearmed = self
            .deps
            .timers
            .cancel(self.key)
            .and_then(|()| self.deps.timers.arm_at(self.key, deadline));
        if let Err(e) = rearmed {
            tracing::warn!(key = %self.key, "Failed to re-arm wait timer: {e:#}");
        }
    }

    fn cancel_timer(&mut self) {
        if let Err(e) = self.deps.timers.cancel(self.key) {
            tracing::warn!(key = %self.key, "Failed to cancel wait timer: {e:#}");
        }
        self.state.disarm();
    }

    // ── Delivery ─────────────────────────────────────────────────

    /// Send or update the destination message for `record`'s current state.
    /// Failures are isolated to this record and reported in the outcome.
    async fn deliver(&self, record: MessageRecord) -> Outcome {
        let body = self.deps.composer.compose(&record);
        let merged = record.merged;

        let result = match record.message_id.as_deref() {
            Some(message_id) => self
                .deps
                .transport
                .update(&record.destination, message_id, &body)
                .await
                .map(|_| false),
            None => match self.deps.transport.send(&record.destination, &body).await {
                Ok(message_id) => {
                    let patch = MessageRecordPatch {
                        message_id: Some(message_id),
                        ..MessageRecordPatch::default()
                    };
                    if let Err(e) = self.deps.records.update(&record.id, patch) {
                        tracing::error!(key = %self.key, record = %record.id, "Sent but failed to store message id: {e:#}");
                    }
                    Ok(true)
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(true) => {
                tracing::info!(key = %self.key, record = %record.id, merged, "Notification sent");
                Outcome::Sent {
                    record: record.id,
                    merged,
                }
            }
            Ok(false) => {
                tracing::info!(key = %self.key, record = %record.id, merged, "Notification updated");
                Outcome::Updated {
                    record: record.id,
                    merged,
                }
            }
            Err(e) => {
                self.report_transport_error(&record, &e);
                Outcome::DeliveryFailed {
                    record: record.id,
                    error: e.to_string(),
                }
            }
        }
    }

    fn report_transport_error(&self, record: &MessageRecord, error: &TransportError) {
        tracing::warn!(
            key = %self.key,
            record = %record.id,
            destination = %record.destination,
            "Delivery failed: {error}"
        );
        crate::health::mark_component_error("transport", error);

        if error.is_permanent() {
            match self
                .deps
                .subscriptions
                .mark_destination_failed(&record.destination, &error.to_string())
            {
                Ok(disabled) => tracing::warn!(
                    destination = %record.destination,
                    disabled,
                    "Destination permanently unavailable; subscriptions disabled"
                ),
                Err(e) => tracing::error!(
                    destination = %record.destination,
                    "Failed to mark destination as failed: {e:#}"
                ),
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn load_record(&self, id: &str) -> Option<MessageRecord> {
        match self.deps.records.get(id) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = %self.key, record = id, "Failed to load message record: {e:#}");
                None
            }
        }
    }

    fn clear_side(&mut self, platform: Platform) {
        let stale = self.state.record_id(platform).map(str::to_string);
        self.state.set_side(platform, None);
        if stale.is_some() && self.state.pending_message_record_id == stale {
            self.cancel_timer();
            self.state.pending_message_record_id = None;
        }
    }
}

fn live_side(event: &StreamEvent) -> PlatformSide {
    PlatformSide {
        live: true,
        started_at: Some(Utc::now()),
        ended_at: None,
        metadata: Some(event.payload.metadata.clone()),
        subscription: Some(event.subscription.clone()),
    }
}

//! Upstream event ingestion.
//!
//! A raw platform event names a channel, not a correlation key. The
//! [`Dispatcher`] fans it out to every enabled subscription following that
//! channel, resolves each subscription's link and forwards one
//! [`StreamEvent`] per subscription to the coordinator.

use crate::coordinator::{
    Coordinator, CorrelationKey, Link, Outcome, Platform, StreamEvent, StreamMetadata,
    StreamPayload, StreamStatus, Subscription,
};
use crate::store::SubscriptionStore;
use anyhow::Result;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Event as delivered by an upstream platform webhook or poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub platform: Platform,
    pub channel_name: String,
    pub status: StreamStatus,
    #[serde(default)]
    pub metadata: StreamMetadata,
}

/// Settled result for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub subscription: String,
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Delivery {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<Coordinator>, subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            coordinator,
            subscriptions,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Forward `event` to every subscription following its channel. Each
    /// subscription settles on its own; one failure never aborts the rest.
    pub async fn ingest(&self, event: PlatformEvent) -> Result<Vec<Delivery>> {
        let subscriptions = self
            .subscriptions
            .subscriptions_for(event.platform, &event.channel_name)?;

        if subscriptions.is_empty() {
            tracing::debug!(
                platform = %event.platform,
                channel = %event.channel_name,
                "No subscriptions for event"
            );
            return Ok(Vec::new());
        }

        let payload = StreamPayload {
            status: event.status,
            metadata: event.metadata,
        };
        let deliveries = join_all(
            subscriptions
                .into_iter()
                .map(|subscription| self.forward(event.platform, payload.clone(), subscription)),
        )
        .await;

        let failed = deliveries.iter().filter(|d| !d.is_ok()).count();
        tracing::info!(
            platform = %event.platform,
            channel = %event.channel_name,
            status = ?event.status,
            subscriptions = deliveries.len(),
            failed,
            "Event dispatched"
        );
        Ok(deliveries)
    }

    async fn forward(
        &self,
        platform: Platform,
        payload: StreamPayload,
        subscription: Subscription,
    ) -> Delivery {
        let subscription_id = subscription.id.clone();
        let link = self.resolve_link(&subscription);

        let key = match CorrelationKey::for_subscription(&subscription, link.as_ref()) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(subscription = %subscription_id, "Cannot derive correlation key: {e}");
                return Delivery {
                    subscription: subscription_id,
                    key: None,
                    outcome: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let event = StreamEvent {
            platform,
            payload,
            subscription,
        };
        match self
            .coordinator
            .handle_event(&key, event, link.as_ref())
            .await
        {
            Ok(outcome) => Delivery {
                subscription: subscription_id,
                key: Some(key.to_string()),
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => {
                tracing::warn!(key = %key, subscription = %subscription_id, "Coordinator rejected event: {e}");
                Delivery {
                    subscription: subscription_id,
                    key: Some(key.to_string()),
                    outcome: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Lookup failures degrade to unlinked handling.
    fn resolve_link(&self, subscription: &Subscription) -> Option<Link> {
        match self.subscriptions.link_for(&subscription.id) {
            Ok(link) => link.filter(|l| l.contains(&subscription.id)),
            Err(e) => {
                tracing::warn!(
                    subscription = %subscription.id,
                    "Link lookup failed; handling as unlinked: {e:#}"
                );
                None
            }
        }
    }
}

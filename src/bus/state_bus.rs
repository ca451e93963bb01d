//! State Bus
//!
//! Publishes `StateEvent`s on per-record channels and hands out independent
//! subscription streams. Ordering holds per channel only.

use super::events::*;
use crate::connection::{ChannelMessage, ConnectionManager, Delivery, MessageStream};
use crate::error::Result;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Lazy, infinite stream of state events
pub type EventStream = BoxStream<'static, StateEvent>;

/// Like `EventStream`, but also reporting dropped events
pub type SignalStream = BoxStream<'static, BusSignal>;

#[derive(Clone)]
pub struct StateBus {
    conn: ConnectionManager,
    namespace: Arc<str>,
}

impl StateBus {
    pub fn new(conn: ConnectionManager, namespace: impl Into<Arc<str>>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn channel_for(&self, record_type: &str, id: &str) -> String {
        record_channel(&self.namespace, record_type, id)
    }

    /// Publish `event` on `channel`
    pub async fn publish(&self, channel: &str, event: &StateEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload())?;
        let channel = channel.to_string();
        tracing::debug!(
            "Publishing {} v{} on {}",
            event.record_id,
            event.new_version,
            channel
        );
        self.conn
            .execute(None, move |backend| {
                let channel = channel.clone();
                let payload = payload.clone();
                async move { backend.publish(&channel, &payload).await }
            })
            .await
    }

    /// Subscribe to one channel.
    ///
    /// Every call creates a fresh stream that sees only events published after
    /// it returns; history is not replayed. Gaps are logged and skipped.
    pub async fn subscribe(&self, channel: &str) -> Result<EventStream> {
        Ok(events_only(self.subscribe_signals(channel).await?))
    }

    /// Subscribe to every channel matching a `*` pattern
    pub async fn subscribe_pattern(&self, pattern: &str) -> Result<EventStream> {
        Ok(events_only(self.subscribe_pattern_signals(pattern).await?))
    }

    /// Subscribe to changes of one record
    pub async fn subscribe_record(&self, record_type: &str, id: &str) -> Result<EventStream> {
        self.subscribe(&self.channel_for(record_type, id)).await
    }

    /// Subscribe to changes of every record of a type
    pub async fn subscribe_type(&self, record_type: &str) -> Result<EventStream> {
        self.subscribe_pattern(&type_channel_pattern(&self.namespace, record_type))
            .await
    }

    /// `subscribe`, reporting dropped events as `BusSignal::Lagged`
    pub async fn subscribe_signals(&self, channel: &str) -> Result<SignalStream> {
        let channel = channel.to_string();
        let messages = self
            .conn
            .execute(None, move |backend| {
                let channel = channel.clone();
                async move { backend.subscribe(&channel).await }
            })
            .await?;
        Ok(self.decode(messages))
    }

    /// `subscribe_pattern`, reporting dropped events as `BusSignal::Lagged`
    pub async fn subscribe_pattern_signals(&self, pattern: &str) -> Result<SignalStream> {
        let pattern = pattern.to_string();
        let messages = self
            .conn
            .execute(None, move |backend| {
                let pattern = pattern.clone();
                async move { backend.psubscribe(&pattern).await }
            })
            .await?;
        Ok(self.decode(messages))
    }

    /// `subscribe_type`, reporting dropped events as `BusSignal::Lagged`
    pub async fn subscribe_type_signals(&self, record_type: &str) -> Result<SignalStream> {
        self.subscribe_pattern_signals(&type_channel_pattern(&self.namespace, record_type))
            .await
    }

    fn decode(&self, messages: MessageStream) -> SignalStream {
        let namespace = self.namespace.clone();
        messages
            .filter_map(move |delivery| {
                let signal = match delivery {
                    Delivery::Message(message) => {
                        decode_message(&namespace, message).map(BusSignal::Event)
                    }
                    Delivery::Lagged(skipped) => Some(BusSignal::Lagged(skipped)),
                };
                async move { signal }
            })
            .boxed()
    }
}

fn events_only(signals: SignalStream) -> EventStream {
    signals
        .filter_map(|signal| async move {
            match signal {
                BusSignal::Event(event) => Some(event),
                BusSignal::Lagged(skipped) => {
                    tracing::warn!("Event subscriber missed {} events", skipped);
                    None
                }
            }
        })
        .boxed()
}

fn decode_message(namespace: &str, message: ChannelMessage) -> Option<StateEvent> {
    let payload: EventPayload = match serde_json::from_str(&message.payload) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Dropping malformed event on {}: {}", message.channel, e);
            return None;
        }
    };
    let event = StateEvent::from_payload(namespace, &message.channel, payload);
    if event.is_none() {
        tracing::warn!("Dropping event on unrecognized channel {}", message.channel);
    }
    event
}

impl std::fmt::Debug for StateBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBus")
            .field("namespace", &self.namespace)
            .finish()
    }
}

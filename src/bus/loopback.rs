//! In-process loopback broker
//!
//! Publishes are recorded and re-broadcast to observers; inbound traffic
//! comes from [`LoopbackBus::inject`] and is delivered only for topics the
//! client subscribed to, like a real broker would.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{BusClient, BusMessage, filtered_messages, topic_matches};
use crate::{Error, Result};

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// Number of published messages kept in the history
pub const HISTORY_LIMIT: usize = 1024;

/// A message published through the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    subscriptions: Vec<String>,
    history: VecDeque<PublishedMessage>,
}

/// In-process broker
#[derive(Debug)]
pub struct LoopbackBus {
    inbound: broadcast::Sender<BusMessage>,
    outbound: broadcast::Sender<PublishedMessage>,
    state: Mutex<State>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LoopbackBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (inbound, _) = broadcast::channel(capacity);
        let (outbound, _) = broadcast::channel(capacity);
        Self {
            inbound,
            outbound,
            state: Mutex::new(State::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Deliver a message as if it came from the broker
    ///
    /// Returns whether any subscription matched.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let subscribed = self.with_state(|state| {
            state
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, topic))
        });
        if !subscribed {
            tracing::debug!(topic, "no subscription for injected message");
            return false;
        }
        // No receivers is not an error for a broker
        let _ = self.inbound.send(BusMessage::new(topic, payload));
        true
    }

    /// The most recent published messages, oldest first
    ///
    /// At most [`HISTORY_LIMIT`] messages are kept.
    #[must_use]
    pub fn history(&self) -> Vec<PublishedMessage> {
        self.with_state(|state| state.history.iter().cloned().collect())
    }

    /// Stream of messages published from now on
    pub fn published(&self) -> BoxStream<'static, PublishedMessage> {
        BroadcastStream::new(self.outbound.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.with_state(|state| state.connected)
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.with_state(|state| state.subscriptions.clone())
    }
}

#[async_trait]
impl BusClient for LoopbackBus {
    async fn connect(&self) -> Result<()> {
        self.with_state(|state| state.connected = true);
        tracing::debug!("loopback bus connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.with_state(|state| state.connected = false);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        };

        self.with_state(|state| {
            if !state.connected {
                return Err(Error::Bus(format!("not connected, cannot publish to {topic}")));
            }
            if state.history.len() == HISTORY_LIMIT {
                state.history.pop_front();
            }
            state.history.push_back(message.clone());
            Ok(())
        })?;

        tracing::trace!(topic, retain, "published");
        let _ = self.outbound.send(message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        self.with_state(|state| {
            if !state.subscriptions.iter().any(|f| f == filter) {
                state.subscriptions.push(filter.to_string());
            }
        });
        tracing::debug!(filter, "subscribed");
        Ok(())
    }

    fn messages(&self, filter: &str) -> BoxStream<'static, BusMessage> {
        filtered_messages(&self.inbound, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_reaches_matching_streams_only() {
        let bus = LoopbackBus::default();
        bus.subscribe("home/#").await.unwrap();

        let mut lamp = bus.messages("home/light/lamp/#");
        let mut fan = bus.messages("home/fan/#");

        assert!(bus.inject("home/light/lamp/set", b"{}".to_vec()));
        assert!(!bus.inject("away/light/lamp/set", b"{}".to_vec()));

        let message = lamp.next().await.unwrap();
        assert_eq!(message.topic, "home/light/lamp/set");

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(20), fan.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn publish_requires_connection_and_is_recorded() {
        let bus = LoopbackBus::default();
        assert!(bus.publish("t", b"x".to_vec(), false).await.is_err());

        bus.connect().await.unwrap();
        let mut published = bus.published();
        bus.publish("t", b"x".to_vec(), true).await.unwrap();

        let history = bus.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].retain);
        assert_eq!(published.next().await.unwrap().topic, "t");
    }

    #[tokio::test]
    async fn history_keeps_only_recent_messages() {
        let bus = LoopbackBus::default();
        bus.connect().await.unwrap();

        for i in 0..HISTORY_LIMIT + 5 {
            bus.publish(&format!("t/{i}"), Vec::new(), false).await.unwrap();
        }

        let history = bus.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].topic, "t/5");
        assert_eq!(history[HISTORY_LIMIT - 1].topic, format!("t/{}", HISTORY_LIMIT + 4));
    }
}

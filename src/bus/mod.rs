//! Publish/subscribe bus collaborator
//!
//! The gateway talks to the broker through [`BusClient`]. [`MqttBus`]
//! connects to a real MQTT broker; [`LoopbackBus`] is the in-process
//! implementation used by tests and offline runs.

mod loopback;
mod messenger;
mod mqtt;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

pub use loopback::{LoopbackBus, PublishedMessage};
pub use messenger::Messenger;
pub use mqtt::MqttBus;

use crate::Result;

/// Inbound bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Pub/sub broker client
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Connect to the broker
    async fn connect(&self) -> Result<()>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<()>;

    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    /// Subscribe to a topic filter at the broker
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Stream of received messages matching `filter`
    ///
    /// Only messages the client is subscribed to arrive at all.
    fn messages(&self, filter: &str) -> BoxStream<'static, BusMessage>;
}

/// MQTT-style topic filter matching
///
/// `+` matches exactly one level, a trailing `#` matches any remaining
/// levels (including none).
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Stream of inbound messages from `inbound` that match `filter`
fn filtered_messages(
    inbound: &broadcast::Sender<BusMessage>,
    filter: &str,
) -> BoxStream<'static, BusMessage> {
    let filter = filter.to_string();
    BroadcastStream::new(inbound.subscribe())
        .filter_map(move |item| {
            let message = match item {
                Ok(message) if topic_matches(&filter, &message.topic) => Some(message),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(filter = %filter, error = %e, "bus receiver lagged");
                    None
                }
            };
            async move { message }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_wildcard_matching() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));

        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(!topic_matches("a/+/c", "a/x/y/c"));

        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/#/c", "a/b/c"));
        assert!(!topic_matches("b/#", "a/b"));
    }
}

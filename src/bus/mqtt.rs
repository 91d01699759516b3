//! MQTT broker client
//!
//! Wraps a `rumqttc` client. The event loop runs in a background task that
//! forwards inbound publishes to [`BusClient::messages`] streams and
//! restores subscriptions whenever the broker connection comes back.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BusClient, BusMessage, filtered_messages};
use crate::config::MqttConfig;
use crate::{Error, Result};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Pending requests between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

const INBOUND_CAPACITY: usize = 256;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Time the event loop gets to flush the disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct Connection {
    client: AsyncClient,
    token: CancellationToken,
    events: JoinHandle<()>,
}

/// Client for an MQTT broker
pub struct MqttBus {
    address: String,
    options: MqttOptions,
    inbound: broadcast::Sender<BusMessage>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MqttBus {
    /// Client for the broker named in `config`
    ///
    /// Nothing is sent until [`BusClient::connect`].
    #[must_use]
    pub fn new(config: &MqttConfig) -> Self {
        // Short enough for brokers that cap client ids at 23 bytes
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let client_id = format!("mesh-gateway-{}", &suffix[..8]);

        let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            address: format!("{}:{}", config.broker, config.port),
            options,
            inbound,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            connection: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn client(&self) -> Result<AsyncClient> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|connection| connection.client.clone())
            .ok_or_else(|| Error::Bus(format!("not connected to {}", self.address)))
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let token = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let events = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            self.inbound.clone(),
            Arc::clone(&self.subscriptions),
            token.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Bus("broker event loop ended".to_string())),
        }

        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(Connection {
            client,
            token,
            events,
        });
        tracing::info!(broker = %self.address, "connected to broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut connection) = connection else {
            return Ok(());
        };

        if let Err(e) = connection.client.disconnect().await {
            tracing::warn!(broker = %self.address, error = %e, "failed to send disconnect");
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut connection.events)
            .await
            .is_err()
        {
            connection.token.cancel();
        }

        tracing::info!(broker = %self.address, "disconnected from broker");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| Error::Bus(format!("publish to {topic} failed: {e}")))?;
        tracing::trace!(topic, retain, "published");
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        let client = self.client()?;
        {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subscriptions.iter().any(|f| f == filter) {
                subscriptions.push(filter.to_string());
            }
        }

        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Bus(format!("subscribe to {filter} failed: {e}")))?;
        tracing::debug!(filter, "subscribed");
        Ok(())
    }

    fn messages(&self, filter: &str) -> BoxStream<'static, BusMessage> {
        filtered_messages(&self.inbound, filter)
    }
}

/// Drive the broker connection until cancelled or disconnected
///
/// `ready` resolves on the first connection acknowledgement, or with the
/// error of the first failed attempt. Later failures are retried.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound: broadcast::Sender<BusMessage>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    token: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                } else {
                    tracing::info!("reconnected to broker");
                    resubscribe(&client, &subscriptions);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // No open stream is not an error
                let _ = inbound.send(BusMessage::new(publish.topic, publish.payload.to_vec()));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(Error::Bus(format!("cannot connect to broker: {e}"))));
                    break;
                }
                tracing::warn!(error = %e, "broker connection lost, retrying");
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    tracing::debug!("broker event loop stopped");
}

/// Queue subscriptions again after a clean-session reconnect
///
/// Runs inside the event loop task, so requests must not wait for it.
fn resubscribe(client: &AsyncClient, subscriptions: &Mutex<Vec<String>>) {
    let filters = subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for filter in filters {
        if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
            tracing::warn!(filter = %filter, error = %e, "failed to restore subscription");
        }
    }
}

use crate::config::{Config, TlsOptions};
use crate::config_store::RuntimeConfig;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("broker rejected the connection: {0:?}")]
    Rejected(ConnectReturnCode),
    #[error("broker request failed: {0}")]
    Request(#[from] ClientError),
    #[error("publish to '{topic}' failed after reconnect: {reason}")]
    Publish { topic: String, reason: String },
    #[error("could not read trust anchor '{path}': {source}")]
    TrustAnchor {
        path: String,
        source: std::io::Error,
    },
}

/// Message delivered by the broker on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Broker operations the routing engine needs. The live implementation is
/// [`MqttService`]; tests substitute recording mocks.
#[allow(async_fn_in_trait)]
pub trait BrokerClient {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Operations of one live broker session, QoS and retain policy applied.
/// Splitting this from [`BrokerClient`] keeps the reconnect logic above it
/// testable without a broker.
#[allow(async_fn_in_trait)]
trait RawSession {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

impl RawSession for AsyncClient {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        AsyncClient::subscribe(self, topic, QoS::ExactlyOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        AsyncClient::unsubscribe(self, topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        AsyncClient::publish(self, topic, QoS::ExactlyOnce, true, payload).await?;
        Ok(())
    }
}

/// Subscribe a fresh session to every data topic of the current table. A
/// new session starts with a clean slate, so this runs after every
/// (re)connect; without it a dropped connection would silently stop all
/// inbound telemetry.
async fn subscribe_routes<S: RawSession>(
    session: &S,
    runtime: &RuntimeConfig,
) -> Result<(), BrokerError> {
    for route in &runtime.routes {
        if route.data_topic.is_empty() {
            continue;
        }
        session.subscribe(&route.data_topic).await?;
        debug!("session subscribed to '{}'", route.data_topic);
    }
    Ok(())
}

/// Publish with one bounded retry: a failed attempt gets a fresh session
/// from `reconnect` and tries once more; the second failure propagates.
async fn publish_with_reconnect<S, R, Fut>(
    session: &S,
    reconnect: R,
    topic: &str,
    payload: Vec<u8>,
) -> Result<(), BrokerError>
where
    S: RawSession,
    R: FnOnce() -> Fut,
    Fut: Future<Output = Result<S, BrokerError>>,
{
    match session.publish(topic, payload.clone()).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!("publish to '{}' failed ({first}); reconnecting once", topic);
            let fresh = reconnect().await?;
            fresh
                .publish(topic, payload)
                .await
                .map_err(|second| BrokerError::Publish {
                    topic: topic.to_string(),
                    reason: second.to_string(),
                })
        }
    }
}

/// One live broker session. The client half is cheap to clone; `alive` is
/// flipped by the event-loop task when the connection dies.
struct ConnectionHandle {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
}

impl ConnectionHandle {
    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Owns the single logical connection to the broker. Connections are made
/// lazily: every operation goes through [`MqttService::ensure_connected`],
/// which reuses the current session while it is live and dials a new one
/// otherwise. The broker address and port come from the latest
/// [`RuntimeConfig`] snapshot, so a remote configuration push takes effect
/// on the next (re)connect.
pub struct MqttService {
    handle: Mutex<Option<ConnectionHandle>>,
    config: Arc<Config>,
    runtime: watch::Receiver<Arc<RuntimeConfig>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

fn tls_configuration(options: &TlsOptions) -> Result<TlsConfiguration, BrokerError> {
    let ca = std::fs::read(&options.trust_anchor_path).map_err(|source| BrokerError::TrustAnchor {
        path: options.trust_anchor_path.clone(),
        source,
    })?;
    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: None,
    })
}

impl MqttService {
    pub fn new(
        config: Arc<Config>,
        runtime: watch::Receiver<Arc<RuntimeConfig>>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(None),
            config,
            runtime,
            inbound_tx,
        })
    }

    /// Return a client for the current session, dialing a new one if the
    /// previous session is gone. The handle lock is held across the dial so
    /// concurrent callers never race to create two live sessions.
    pub async fn ensure_connected(&self) -> Result<AsyncClient, BrokerError> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if handle.is_live() {
                return Ok(handle.client.clone());
            }
            debug!("previous broker session is dead; reconnecting");
        }

        let handle = self.connect().await?;
        let client = handle.client.clone();
        *guard = Some(handle);
        Ok(client)
    }

    /// Dial the broker and drive the handshake to completion before handing
    /// the session out. The event loop then moves to a background task that
    /// pumps inbound publishes into the message channel, and the session is
    /// subscribed to the current table's data topics.
    async fn connect(&self) -> Result<ConnectionHandle, BrokerError> {
        let runtime = self.runtime.borrow().clone();
        let client_id = format!("{}-{}", self.config.mqtt_client_id, Uuid::new_v4());
        debug!(
            "connecting to broker at {}:{} as '{}'",
            runtime.broker_address, runtime.broker_port, client_id
        );

        let mut options = MqttOptions::new(client_id, &runtime.broker_address, runtime.broker_port);
        options.set_keep_alive(Duration::from_secs(10));
        options.set_clean_session(true);
        if let Some(tls) = &self.config.mqtt_tls {
            options.set_transport(Transport::tls_with_config(tls_configuration(tls)?));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!(
                            "connected to broker at {}:{}",
                            runtime.broker_address, runtime.broker_port
                        );
                        break;
                    }
                    return Err(BrokerError::Rejected(ack.code));
                }
                Ok(_) => continue,
                Err(e) => return Err(BrokerError::Connect(e.to_string())),
            }
        }

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            qos: publish.qos,
                        };
                        if inbound_tx.send(message).await.is_err() {
                            debug!("inbound channel closed; stopping event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(packet)) => debug!("incoming packet: {:?}", packet),
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        error!("broker event loop error: {e}");
                        alive_flag.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        if let Err(e) = subscribe_routes(&client, &runtime).await {
            let _ = client.disconnect().await;
            return Err(e);
        }

        Ok(ConnectionHandle { client, alive })
    }

    /// Tear the current session down. Used at process shutdown; in-flight
    /// messages are not drained.
    pub async fn disconnect(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            if let Err(e) = handle.client.disconnect().await {
                warn!("broker disconnect failed: {e}");
            } else {
                info!("disconnected from broker");
            }
        }
    }

    async fn drop_dead_handle(&self) {
        let mut guard = self.handle.lock().await;
        *guard = None;
    }
}

impl BrokerClient for MqttService {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let client = self.ensure_connected().await?;
        RawSession::subscribe(&client, topic).await?;
        info!("subscribed to '{}'", topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let client = self.ensure_connected().await?;
        RawSession::unsubscribe(&client, topic).await?;
        info!("unsubscribed from '{}'", topic);
        Ok(())
    }

    /// Publish at QoS 2 with the retain flag, reconnecting and retrying
    /// exactly once on failure.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let client = self.ensure_connected().await?;
        publish_with_reconnect(
            &client,
            || async {
                self.drop_dead_handle().await;
                self.ensure_connected().await
            },
            topic,
            payload,
        )
        .await
    }
}

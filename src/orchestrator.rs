use crate::config_store::{ConfigStore, RuntimeConfig};
use crate::forwarder::{ForwardingSink, UpstreamChannel};
use crate::models::TelemetryMessage;
use crate::mqtt_service::{BrokerClient, InboundMessage};
use crate::reconciler::SubscriptionReconciler;
use crate::router;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Wires the two event sources together: configuration documents flow into
/// the store and the subscription reconciler, broker messages flow through
/// the router to the alert publisher and the upstream sink. Every event is
/// handled at its own failure boundary; nothing here terminates the
/// process.
pub struct Orchestrator<B, U> {
    store: ConfigStore,
    snapshot_tx: watch::Sender<Arc<RuntimeConfig>>,
    reconciler: SubscriptionReconciler,
    subscribed: HashSet<String>,
    broker: Arc<B>,
    sink: ForwardingSink<U>,
}

impl<B: BrokerClient, U: UpstreamChannel> Orchestrator<B, U> {
    pub fn new(
        store: ConfigStore,
        snapshot_tx: watch::Sender<Arc<RuntimeConfig>>,
        broker: Arc<B>,
        sink: ForwardingSink<U>,
    ) -> Self {
        Self {
            store,
            snapshot_tx,
            reconciler: SubscriptionReconciler,
            subscribed: HashSet::new(),
            broker,
            sink,
        }
    }

    pub async fn run(
        mut self,
        mut config_rx: mpsc::Receiver<HashMap<String, String>>,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
    ) {
        loop {
            tokio::select! {
                Some(document) = config_rx.recv() => self.handle_config_update(document).await,
                Some(message) = inbound_rx.recv() => self.handle_message(message).await,
                else => break,
            }
        }
        info!("event channels closed; orchestrator stopping");
    }

    /// Fold a configuration document in and reconcile subscriptions. The new
    /// snapshot is published before subscribing, so a message arriving on a
    /// freshly subscribed topic always finds its route.
    pub async fn handle_config_update(&mut self, document: HashMap<String, String>) {
        let snapshot = self.store.apply(&document);
        if self.snapshot_tx.is_closed() {
            warn!("no snapshot readers are listening");
        }
        self.snapshot_tx.send_replace(snapshot.clone());

        match self
            .reconciler
            .reconcile(&mut self.subscribed, &snapshot, self.broker.as_ref())
            .await
        {
            Ok(()) => info!(
                "configuration applied: {} device routes, threshold {}",
                snapshot.routes.len(),
                snapshot.alert_threshold
            ),
            Err(e) => error!("subscription reconcile failed: {e}; keeping current subscriptions"),
        }
    }

    /// Route one inbound message. Alert publishing and upstream forwarding
    /// are isolated failure domains: either can fail without suppressing
    /// the other.
    pub async fn handle_message(&self, message: InboundMessage) {
        debug!(
            "message on '{}' ({:?}, {} bytes)",
            message.topic,
            message.qos,
            message.payload.len()
        );
        let snapshot = self.snapshot_tx.borrow().clone();

        let classification = match router::classify(&snapshot, &message.topic, &message.payload) {
            Ok(classification) => classification,
            Err(e) => {
                warn!("{e}; dropping message");
                return;
            }
        };

        if classification.alert {
            if let Some(decoded) = &classification.decoded {
                let payload = alert_payload(decoded, snapshot.alert_threshold);
                info!(
                    "alert for device '{}': temperature {} >= {}",
                    classification.route.id, decoded.machine.temperature, snapshot.alert_threshold
                );
                if let Err(e) = self
                    .broker
                    .publish(&classification.route.feedback_topic, payload.into_bytes())
                    .await
                {
                    error!(
                        "alert publish to '{}' failed: {e}",
                        classification.route.feedback_topic
                    );
                }
            }
        }

        if let Err(e) = self.sink.forward(classification.forward).await {
            error!("upstream forward for '{}' failed: {e}", message.topic);
        }
    }
}

fn alert_payload(message: &TelemetryMessage, threshold: i64) -> String {
    format!(
        "ALERT: machine '{}' temperature {:.1} reached threshold {} at {}",
        message.machine.id, message.machine.temperature, threshold, message.time_created
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::SendError;
    use crate::mqtt_service::BrokerError;
    use rumqttc::QoS;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroker {
        subscribes: Mutex<Vec<String>>,
        publishes: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl BrokerClient for RecordingBroker {
        async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.subscribes.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            self.publishes.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUpstream {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl UpstreamChannel for Arc<RecordingUpstream> {
        async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<(), SendError> {
            self.sent.lock().unwrap().push((channel.to_string(), payload));
            Ok(())
        }
    }

    fn scenario_document() -> HashMap<String, String> {
        [
            ("alertThreshold", "25"),
            ("deviceCount", "1"),
            ("Device1_ID", "d1"),
            ("Device1_Schema", "DefaultEngine"),
            ("Device1_DataTopic", "t/in"),
            ("Device1_FeedbackTopic", "t/fb"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn telemetry(temperature: f64) -> Vec<u8> {
        format!(
            r#"{{"machine":{{"id":"d1","temperature":{},"pressure":1}},"ambient":{{"temperature":20,"humidity":40}},"timeCreated":"2024-01-01T00:00:00Z"}}"#,
            temperature
        )
        .into_bytes()
    }

    fn build() -> (
        Orchestrator<RecordingBroker, Arc<RecordingUpstream>>,
        Arc<RecordingBroker>,
        Arc<RecordingUpstream>,
    ) {
        let initial = RuntimeConfig {
            alert_threshold: 25,
            broker_address: "127.0.0.1".to_string(),
            broker_port: 8883,
            device_count: 0,
            routes: Vec::new(),
        };
        let (snapshot_tx, _snapshot_rx) = watch::channel(Arc::new(initial.clone()));
        let broker = Arc::new(RecordingBroker::default());
        let upstream = Arc::new(RecordingUpstream::default());
        let sink = ForwardingSink::new(upstream.clone(), "output1".to_string());
        let orchestrator = Orchestrator::new(ConfigStore::new(initial), snapshot_tx, broker.clone(), sink);
        (orchestrator, broker, upstream)
    }

    fn inbound(topic: &str, payload: Vec<u8>) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload,
            qos: QoS::ExactlyOnce,
        }
    }

    #[tokio::test]
    async fn over_threshold_message_alerts_and_forwards() {
        let (mut orchestrator, broker, upstream) = build();
        orchestrator.handle_config_update(scenario_document()).await;
        assert_eq!(*broker.subscribes.lock().unwrap(), vec!["t/in".to_string()]);

        orchestrator.handle_message(inbound("t/in", telemetry(30.0))).await;

        let publishes = broker.publishes.lock().unwrap();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].0, "t/fb");
        let alert = String::from_utf8(publishes[0].1.clone()).unwrap();
        assert!(alert.contains("d1"));

        let sent = upstream.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "output1");
        let forwarded: TelemetryMessage = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(forwarded.machine.id, "d1");
        assert_eq!(forwarded.machine.temperature, 30.0);
    }

    #[tokio::test]
    async fn below_threshold_message_forwards_without_alert() {
        let (mut orchestrator, broker, upstream) = build();
        orchestrator.handle_config_update(scenario_document()).await;

        orchestrator.handle_message(inbound("t/in", telemetry(10.0))).await;

        assert!(broker.publishes.lock().unwrap().is_empty());
        assert_eq!(upstream.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn message_on_unknown_topic_is_dropped() {
        let (mut orchestrator, broker, upstream) = build();
        orchestrator.handle_config_update(scenario_document()).await;

        orchestrator
            .handle_message(inbound("t/unknown", telemetry(30.0)))
            .await;

        assert!(broker.publishes.lock().unwrap().is_empty());
        assert!(upstream.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn threshold_update_changes_alert_decision() {
        let (mut orchestrator, broker, _upstream) = build();
        orchestrator.handle_config_update(scenario_document()).await;

        let mut raise = HashMap::new();
        raise.insert("alertThreshold".to_string(), "50".to_string());
        orchestrator.handle_config_update(raise).await;

        orchestrator.handle_message(inbound("t/in", telemetry(30.0))).await;
        assert!(broker.publishes.lock().unwrap().is_empty());
    }
}

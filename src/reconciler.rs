use crate::config_store::RuntimeConfig;
use crate::mqtt_service::{BrokerClient, BrokerError};
use std::collections::HashSet;
use tracing::{debug, info};

/// Keeps the broker's live subscription set equal to the data-topic set of
/// the current routing table. Runs synchronously inside the configuration
/// update path, so a newly added topic is subscribed before the update is
/// considered applied.
pub struct SubscriptionReconciler;

impl SubscriptionReconciler {
    /// Diff `subscribed` against the table in `next` and issue the minimal
    /// set of subscribe/unsubscribe calls. `subscribed` is updated as each
    /// call succeeds, so on failure it still reflects reality and the next
    /// reconcile converges.
    pub async fn reconcile<B: BrokerClient>(
        &self,
        subscribed: &mut HashSet<String>,
        next: &RuntimeConfig,
        broker: &B,
    ) -> Result<(), BrokerError> {
        let target: HashSet<String> = next
            .routes
            .iter()
            .map(|route| route.data_topic.clone())
            .filter(|topic| !topic.is_empty())
            .collect();

        let stale: Vec<String> = subscribed.difference(&target).cloned().collect();
        for topic in stale {
            broker.unsubscribe(&topic).await?;
            subscribed.remove(&topic);
            info!("dropped stale subscription '{}'", topic);
        }

        let missing: Vec<String> = target.difference(subscribed).cloned().collect();
        for topic in missing {
            broker.subscribe(&topic).await?;
            subscribed.insert(topic);
        }

        debug!("subscription set reconciled: {} topics", subscribed.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::DeviceRoute;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroker {
        subscribes: Mutex<Vec<String>>,
        unsubscribes: Mutex<Vec<String>>,
    }

    impl BrokerClient for RecordingBroker {
        async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.subscribes.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
            self.unsubscribes.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn config_with_topics(topics: &[&str]) -> RuntimeConfig {
        RuntimeConfig {
            alert_threshold: 25,
            broker_address: "127.0.0.1".to_string(),
            broker_port: 8883,
            device_count: topics.len(),
            routes: topics
                .iter()
                .enumerate()
                .map(|(i, topic)| DeviceRoute {
                    id: format!("d{}", i + 1),
                    schema: "DefaultEngine".to_string(),
                    data_topic: topic.to_string(),
                    feedback_topic: format!("{}/fb", topic),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn subscribes_once_per_new_topic() {
        let broker = RecordingBroker::default();
        let mut subscribed = HashSet::new();

        SubscriptionReconciler
            .reconcile(&mut subscribed, &config_with_topics(&["a", "b"]), &broker)
            .await
            .unwrap();

        let mut calls = broker.subscribes.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(subscribed.len(), 2);
    }

    #[tokio::test]
    async fn already_subscribed_topics_are_not_resubscribed() {
        let broker = RecordingBroker::default();
        let mut subscribed: HashSet<String> = ["a".to_string()].into_iter().collect();

        SubscriptionReconciler
            .reconcile(&mut subscribed, &config_with_topics(&["a", "b"]), &broker)
            .await
            .unwrap();

        assert_eq!(*broker.subscribes.lock().unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn removed_topics_are_unsubscribed() {
        let broker = RecordingBroker::default();
        let mut subscribed: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();

        SubscriptionReconciler
            .reconcile(&mut subscribed, &config_with_topics(&["b"]), &broker)
            .await
            .unwrap();

        assert_eq!(*broker.unsubscribes.lock().unwrap(), vec!["a".to_string()]);
        assert!(broker.subscribes.lock().unwrap().is_empty());
        assert_eq!(subscribed.len(), 1);
    }

    #[tokio::test]
    async fn routes_without_a_data_topic_are_skipped() {
        let broker = RecordingBroker::default();
        let mut subscribed = HashSet::new();

        SubscriptionReconciler
            .reconcile(&mut subscribed, &config_with_topics(&["a", ""]), &broker)
            .await
            .unwrap();

        assert_eq!(*broker.subscribes.lock().unwrap(), vec!["a".to_string()]);
    }
}

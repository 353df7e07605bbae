//! Pub/sub facade.
//!
//! The routing core does not move messages between processes itself. A
//! provider plugs in here; inbound messages reach subscribers as ordinary
//! envelopes on their route, with a `type` header for control messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use relay_core::{Envelope, Headers, Value};
use tracing::{debug, warn};

use crate::error::PubSubError;
use crate::post_office::PostOffice;

/// Header naming the topic a message came from.
pub const TOPIC_HEADER: &str = "topic";
/// Header naming the partition a message came from.
pub const PARTITION_HEADER: &str = "partition";
/// Control-message discriminator header.
pub const TYPE_HEADER: &str = "type";
/// Control message sent to a route when its subscription starts.
pub const INIT: &str = "init";

/// A pub/sub backend.
#[async_trait]
pub trait PubSubProvider: Send + Sync + 'static {
    /// Creates a topic. Returns `false` if it already existed.
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<bool, PubSubError>;

    async fn delete_topic(&self, topic: &str) -> Result<(), PubSubError>;

    async fn exists(&self, topic: &str) -> bool;

    /// Number of partitions; 0 for an unpartitioned topic.
    async fn partition_count(&self, topic: &str) -> Result<u32, PubSubError>;

    async fn list_topics(&self) -> Vec<String>;

    async fn publish(
        &self,
        topic: &str,
        partition: Option<u32>,
        headers: Headers,
        body: Value,
    ) -> Result<(), PubSubError>;

    /// Delivers messages on `topic` (or one partition of it) to `route`.
    async fn subscribe(
        &self,
        topic: &str,
        partition: Option<u32>,
        route: &str,
        params: &[String],
    ) -> Result<(), PubSubError>;

    async fn unsubscribe(&self, topic: &str, partition: Option<u32>) -> Result<(), PubSubError>;
}

/// Entry point for pub/sub. Disabled until a provider is enabled.
#[derive(Default)]
pub struct PubSub {
    provider: RwLock<Option<Arc<dyn PubSubProvider>>>,
}

impl PubSub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs the provider. Only one provider may be enabled.
    ///
    /// # Errors
    ///
    /// [`PubSubError::AlreadyEnabled`] on a second call.
    pub fn enable_feature(&self, provider: Arc<dyn PubSubProvider>) -> Result<(), PubSubError> {
        let mut slot = self.provider.write();
        if slot.is_some() {
            return Err(PubSubError::AlreadyEnabled);
        }
        *slot = Some(provider);
        Ok(())
    }

    #[must_use]
    pub fn feature_enabled(&self) -> bool {
        self.provider.read().is_some()
    }

    pub(crate) fn disable(&self) {
        self.provider.write().take();
    }

    fn provider(&self) -> Result<Arc<dyn PubSubProvider>, PubSubError> {
        self.provider.read().clone().ok_or(PubSubError::NotEnabled)
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider, or the provider's error.
    pub async fn create_topic(&self, topic: &str, partitions: u32) -> Result<bool, PubSubError> {
        self.provider()?.create_topic(topic, partitions).await
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider, or the provider's error.
    pub async fn delete_topic(&self, topic: &str) -> Result<(), PubSubError> {
        self.provider()?.delete_topic(topic).await
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider.
    pub async fn exists(&self, topic: &str) -> Result<bool, PubSubError> {
        Ok(self.provider()?.exists(topic).await)
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider, or the provider's error.
    pub async fn partition_count(&self, topic: &str) -> Result<u32, PubSubError> {
        self.provider()?.partition_count(topic).await
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider.
    pub async fn list_topics(&self) -> Result<Vec<String>, PubSubError> {
        Ok(self.provider()?.list_topics().await)
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider, or the provider's error.
    pub async fn publish(
        &self,
        topic: &str,
        partition: Option<u32>,
        headers: Headers,
        body: impl Into<Value>,
    ) -> Result<(), PubSubError> {
        self.provider()?
            .publish(topic, partition, headers, body.into())
            .await
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider, or the provider's error.
    pub async fn subscribe(
        &self,
        topic: &str,
        partition: Option<u32>,
        route: &str,
        params: &[String],
    ) -> Result<(), PubSubError> {
        self.provider()?
            .subscribe(topic, partition, route, params)
            .await
    }

    /// # Errors
    ///
    /// [`PubSubError::NotEnabled`] without a provider, or the provider's error.
    pub async fn unsubscribe(&self, topic: &str, partition: Option<u32>) -> Result<(), PubSubError> {
        self.provider()?.unsubscribe(topic, partition).await
    }
}

// ---------------------------------------------------------------------------
// LocalPubSub
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Subscription {
    route: String,
    partition: Option<u32>,
}

#[derive(Debug, Default)]
struct Topic {
    partitions: u32,
    subscriptions: Vec<Subscription>,
}

/// In-process provider: publishes straight to subscriber routes.
pub struct LocalPubSub {
    post_office: PostOffice,
    topics: RwLock<HashMap<String, Topic>>,
}

impl LocalPubSub {
    #[must_use]
    pub fn new(post_office: PostOffice) -> Self {
        Self {
            post_office,
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn check_partition(topic: &str, partitions: u32, partition: Option<u32>) -> Result<(), PubSubError> {
        match partition {
            Some(p) if p >= partitions => Err(PubSubError::InvalidTopic {
                topic: topic.to_string(),
                reason: format!("partition {p} out of range 0..{partitions}"),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PubSubProvider for LocalPubSub {
    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<bool, PubSubError> {
        relay_core::validate_route(topic).map_err(|e| PubSubError::InvalidTopic {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let mut topics = self.topics.write();
        if topics.contains_key(topic) {
            return Ok(false);
        }
        topics.insert(
            topic.to_string(),
            Topic {
                partitions,
                subscriptions: Vec::new(),
            },
        );
        debug!(topic, partitions, "topic created");
        Ok(true)
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), PubSubError> {
        self.topics
            .write()
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| PubSubError::TopicNotFound(topic.to_string()))
    }

    async fn exists(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }

    async fn partition_count(&self, topic: &str) -> Result<u32, PubSubError> {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.partitions)
            .ok_or_else(|| PubSubError::TopicNotFound(topic.to_string()))
    }

    async fn list_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    async fn publish(
        &self,
        topic: &str,
        partition: Option<u32>,
        headers: Headers,
        body: Value,
    ) -> Result<(), PubSubError> {
        let targets: Vec<String> = {
            let topics = self.topics.read();
            let state = topics
                .get(topic)
                .ok_or_else(|| PubSubError::TopicNotFound(topic.to_string()))?;
            Self::check_partition(topic, state.partitions, partition)?;
            state
                .subscriptions
                .iter()
                .filter(|s| s.partition.is_none() || s.partition == partition)
                .map(|s| s.route.clone())
                .collect()
        };
        for route in targets {
            let mut envelope = Envelope::to_route(route.as_str())
                .with_headers(headers.clone())
                .with_header(TOPIC_HEADER, topic)
                .with_body(body.clone());
            if let Some(p) = partition {
                envelope = envelope.with_header(PARTITION_HEADER, p.to_string());
            }
            if let Err(e) = self.post_office.send(envelope) {
                warn!(topic, route = %route, "message not delivered: {e}");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: Option<u32>,
        route: &str,
        params: &[String],
    ) -> Result<(), PubSubError> {
        if !self.post_office.exists(&[route]) {
            return Err(crate::error::RouteError::not_found(route).into());
        }
        {
            let mut topics = self.topics.write();
            let state = topics
                .get_mut(topic)
                .ok_or_else(|| PubSubError::TopicNotFound(topic.to_string()))?;
            Self::check_partition(topic, state.partitions, partition)?;
            state.subscriptions.retain(|s| !(s.route == route && s.partition == partition));
            state.subscriptions.push(Subscription {
                route: route.to_string(),
                partition,
            });
        }
        debug!(topic, route, ?params, "subscribed");
        let mut init = Envelope::to_route(route)
            .with_header(TYPE_HEADER, INIT)
            .with_header(TOPIC_HEADER, topic);
        if let Some(p) = partition {
            init = init.with_header(PARTITION_HEADER, p.to_string());
        }
        self.post_office.send(init)?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, partition: Option<u32>) -> Result<(), PubSubError> {
        let mut topics = self.topics.write();
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| PubSubError::TopicNotFound(topic.to_string()))?;
        state.subscriptions.retain(|s| s.partition != partition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::error::RouteError;
    use crate::handler::{handler_fn, Output};
    use crate::registry::ServiceDef;
    use crate::{Platform, PlatformConfig};

    fn subscriber(platform: &Platform, route: &str) -> mpsc::UnboundedReceiver<(Headers, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        platform
            .register(ServiceDef::new(
                route,
                handler_fn(move |headers, payload, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((headers, payload.into_body()));
                        Ok(Output::none())
                    }
                }),
            ))
            .unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(Headers, Value)>) -> (Headers, Value) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn enabled(platform: &Platform) -> &PubSub {
        let pubsub = platform.pubsub();
        pubsub
            .enable_feature(Arc::new(LocalPubSub::new(platform.post_office())))
            .unwrap();
        pubsub
    }

    #[tokio::test]
    async fn disabled_facade_reports_not_enabled() {
        let platform = Platform::start(PlatformConfig::default()).unwrap();
        let pubsub = platform.pubsub();
        assert!(!pubsub.feature_enabled());
        assert!(matches!(
            pubsub.create_topic("events.user", 0).await,
            Err(PubSubError::NotEnabled)
        ));
        assert!(matches!(pubsub.list_topics().await, Err(PubSubError::NotEnabled)));
        platform.shutdown().await;
    }

    #[tokio::test]
    async fn provider_can_only_be_enabled_once() {
        let platform = Platform::start(PlatformConfig::default()).unwrap();
        let pubsub = enabled(&platform);
        assert!(pubsub.feature_enabled());
        assert!(matches!(
            pubsub.enable_feature(Arc::new(LocalPubSub::new(platform.post_office()))),
            Err(PubSubError::AlreadyEnabled)
        ));
        platform.shutdown().await;
        assert!(!platform.pubsub().feature_enabled());
    }

    #[tokio::test]
    async fn topic_lifecycle() {
        let platform = Platform::start(PlatformConfig::default()).unwrap();
        let pubsub = enabled(&platform);

        assert!(pubsub.create_topic("events.user", 4).await.unwrap());
        assert!(!pubsub.create_topic("events.user", 4).await.unwrap());
        assert!(pubsub.create_topic("events.audit", 0).await.unwrap());
        assert!(matches!(
            pubsub.create_topic("BadTopic", 0).await,
            Err(PubSubError::InvalidTopic { .. })
        ));
        assert!(pubsub.exists("events.user").await.unwrap());
        assert_eq!(pubsub.partition_count("events.user").await.unwrap(), 4);
        assert_eq!(
            pubsub.list_topics().await.unwrap(),
            vec!["events.audit".to_string(), "events.user".to_string()]
        );

        pubsub.delete_topic("events.audit").await.unwrap();
        assert!(!pubsub.exists("events.audit").await.unwrap());
        assert!(matches!(
            pubsub.delete_topic("events.audit").await,
            Err(PubSubError::TopicNotFound(_))
        ));
        platform.shutdown().await;
    }

    #[tokio::test]
    async fn subscriber_gets_init_then_messages() {
        let platform = Platform::start(PlatformConfig::default()).unwrap();
        let mut inbox = subscriber(&platform, "user.listener");
        let pubsub = enabled(&platform);
        pubsub.create_topic("events.user", 0).await.unwrap();

        pubsub
            .subscribe("events.user", None, "user.listener", &[])
            .await
            .unwrap();
        let (headers, body) = next(&mut inbox).await;
        assert_eq!(headers.get(TYPE_HEADER).map(String::as_str), Some(INIT));
        assert_eq!(headers.get(TOPIC_HEADER).map(String::as_str), Some("events.user"));
        assert!(body.is_null());

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_string(), "created".to_string());
        pubsub
            .publish("events.user", None, headers, "alice")
            .await
            .unwrap();
        let (headers, body) = next(&mut inbox).await;
        assert_eq!(headers.get(TYPE_HEADER).map(String::as_str), Some("created"));
        assert_eq!(headers.get(TOPIC_HEADER).map(String::as_str), Some("events.user"));
        assert_eq!(body, Value::from("alice"));
        platform.shutdown().await;
    }

    #[tokio::test]
    async fn partitioned_subscription_filters_messages() {
        let platform = Platform::start(PlatformConfig::default()).unwrap();
        let mut inbox = subscriber(&platform, "user.partition");
        let pubsub = enabled(&platform);
        pubsub.create_topic("events.user", 2).await.unwrap();
        pubsub
            .subscribe("events.user", Some(1), "user.partition", &[])
            .await
            .unwrap();
        let (init, _) = next(&mut inbox).await;
        assert_eq!(init.get(PARTITION_HEADER).map(String::as_str), Some("1"));

        pubsub
            .publish("events.user", Some(0), Headers::new(), "skip")
            .await
            .unwrap();
        pubsub
            .publish("events.user", Some(1), Headers::new(), "take")
            .await
            .unwrap();
        let (headers, body) = next(&mut inbox).await;
        assert_eq!(body, Value::from("take"));
        assert_eq!(headers.get(PARTITION_HEADER).map(String::as_str), Some("1"));

        assert!(matches!(
            pubsub.publish("events.user", Some(5), Headers::new(), "x").await,
            Err(PubSubError::InvalidTopic { .. })
        ));
        pubsub.unsubscribe("events.user", Some(1)).await.unwrap();
        pubsub
            .publish("events.user", Some(1), Headers::new(), "gone")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inbox.try_recv().is_err());
        platform.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_requires_registered_route() {
        let platform = Platform::start(PlatformConfig::default()).unwrap();
        let pubsub = enabled(&platform);
        pubsub.create_topic("events.user", 0).await.unwrap();
        assert!(matches!(
            pubsub.subscribe("events.user", None, "no.listener", &[]).await,
            Err(PubSubError::Route(RouteError::RouteNotFound { .. }))
        ));
        platform.shutdown().await;
    }
}

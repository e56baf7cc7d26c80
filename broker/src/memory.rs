//! In-process broker used by the test suite and the demo app. It implements
//! the same capability set a real broker client exposes: competing-consumer
//! queues, fan-out topics, durable subscription backlogs, simple equality
//! selectors and redelivery of unacknowledged client-ack messages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use bindings::{AckMode, ConsumerType, DestinationBinding, DestinationKind};
use internals::Message;

use crate::{
    BrokerClient, BrokerConnection, BrokerConsumer, BrokerSession, ConnectionConfig,
    ConnectionError, ConsumerError, ReceiveError, SessionError,
};

/// Connection id used by [`MemoryBroker::publish`], never handed out to a
/// real connection, so `no_local` filtering cannot match it.
const EXTERNAL_PRODUCER: u64 = 0;

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    All,
    HeaderEquals { key: String, value: String },
}

impl Selector {
    /// Accepts the empty selector and single `key = 'value'` equality;
    /// anything richer is rejected at consumer creation.
    fn parse(raw: &str) -> Result<Self, ConsumerError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Selector::All);
        }
        let invalid = || ConsumerError::InvalidSelector {
            selector: raw.to_string(),
        };
        let (key, value) = raw.split_once('=').ok_or_else(invalid)?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty()
            || value.len() < 2
            || !value.starts_with('\'')
            || !value.ends_with('\'')
        {
            return Err(invalid());
        }
        Ok(Selector::HeaderEquals {
            key: key.to_string(),
            value: value[1..value.len() - 1].to_string(),
        })
    }

    fn matches(&self, message: &Message) -> bool {
        match self {
            Selector::All => true,
            Selector::HeaderEquals { key, value } => message.header(key) == Some(value.as_str()),
        }
    }
}

/// One delivery target: the backlog of a queue, of a durable/shared
/// subscription, or of a single anonymous topic subscriber.
struct Mailbox {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    fault: AtomicBool,
    durable: bool,
    attached: AtomicUsize,
    owner_conn: AtomicU64,
    no_local: AtomicBool,
}

impl Mailbox {
    fn new(durable: bool) -> Arc<Self> {
        Arc::new(Mailbox {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            fault: AtomicBool::new(false),
            durable,
            attached: AtomicUsize::new(0),
            owner_conn: AtomicU64::new(EXTERNAL_PRODUCER),
            no_local: AtomicBool::new(false),
        })
    }

    fn push_back(&self, message: Message) {
        self.messages.lock().unwrap().push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: Message) {
        self.messages.lock().unwrap().push_front(message);
        self.notify.notify_waiters();
    }

    fn pop_matching(&self, selector: &Selector) -> Option<Message> {
        let mut messages = self.messages.lock().unwrap();
        let position = messages.iter().position(|msg| selector.matches(msg))?;
        messages.remove(position)
    }

    fn depth(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn raise_fault(&self) {
        self.fault.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn attach(&self, connection_id: u64, no_local: bool) {
        self.fault.store(false, Ordering::SeqCst);
        self.attached.fetch_add(1, Ordering::SeqCst);
        self.owner_conn.store(connection_id, Ordering::SeqCst);
        self.no_local.store(no_local, Ordering::SeqCst);
    }

    fn skips_publisher(&self, connection_id: u64) -> bool {
        connection_id != EXTERNAL_PRODUCER
            && self.no_local.load(Ordering::SeqCst)
            && self.owner_conn.load(Ordering::SeqCst) == connection_id
    }
}

#[derive(Default)]
struct TopicState {
    anonymous: HashMap<u64, Arc<Mailbox>>,
    named: HashMap<String, Arc<Mailbox>>,
}

#[derive(Default)]
struct BrokerState {
    queues: RwLock<HashMap<String, Arc<Mailbox>>>,
    topics: RwLock<HashMap<String, TopicState>>,
    connect_calls: AtomicU64,
    conn_seq: AtomicU64,
    sub_seq: AtomicU64,
    refuse_connections: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish as an external producer (not tied to any client connection).
    pub fn publish(&self, kind: DestinationKind, name: &str, message: Message) {
        self.publish_from(EXTERNAL_PRODUCER, kind, name, message);
    }

    /// Publish as if the producer shared connection `connection_id`, which
    /// lets `no_local` subscriptions filter the message out.
    pub fn publish_from(
        &self,
        connection_id: u64,
        kind: DestinationKind,
        name: &str,
        message: Message,
    ) {
        match kind {
            DestinationKind::Queue => {
                let mailbox = {
                    let mut queues = self.state.queues.write().unwrap();
                    queues
                        .entry(name.to_string())
                        .or_insert_with(|| Mailbox::new(true))
                        .clone()
                };
                debug!(queue = %name, uuid = %message.uuid, "message enqueued");
                mailbox.push_back(message);
            }
            DestinationKind::Topic => {
                let topics = self.state.topics.read().unwrap();
                let Some(topic) = topics.get(name) else {
                    // topic with no subscribers drops the message
                    debug!(topic = %name, uuid = %message.uuid, "no subscribers, message dropped");
                    return;
                };
                for mailbox in topic.anonymous.values().chain(topic.named.values()) {
                    if mailbox.skips_publisher(connection_id) {
                        continue;
                    }
                    mailbox.push_back(message.clone());
                }
            }
        }
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .queues
            .read()
            .unwrap()
            .get(name)
            .map(|mailbox| mailbox.depth())
            .unwrap_or(0)
    }

    /// Number of physical connections opened since the broker was created.
    pub fn connection_count(&self) -> u64 {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Fault injection: every open consumer observes a lost connection.
    pub fn drop_connections(&self) {
        warn!("dropping all broker connections");
        for mailbox in self.state.queues.read().unwrap().values() {
            mailbox.raise_fault();
        }
        for topic in self.state.topics.read().unwrap().values() {
            for mailbox in topic.anonymous.values().chain(topic.named.values()) {
                mailbox.raise_fault();
            }
        }
    }

    /// Fault injection: make subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect {
                url: config.provider_url.clone(),
                reason: "connection refused".to_string(),
            });
        }
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.state.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        info!(connection_id = id, url = %config.provider_url, "broker connection opened");
        Ok(Box::new(MemoryConnection {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_session(
        &self,
        ack_mode: AckMode,
    ) -> Result<Box<dyn BrokerSession>, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        Ok(Box::new(MemorySession {
            connection_id: self.id,
            ack_mode,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemorySession {
    connection_id: u64,
    ack_mode: AckMode,
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn create_consumer(
        &self,
        binding: &DestinationBinding,
    ) -> Result<Box<dyn BrokerConsumer>, ConsumerError> {
        let selector = Selector::parse(&binding.message_selector)?;

        let (mailbox, origin) = match binding.kind {
            DestinationKind::Queue => {
                let mailbox = {
                    let mut queues = self.state.queues.write().unwrap();
                    queues
                        .entry(binding.name.clone())
                        .or_insert_with(|| Mailbox::new(true))
                        .clone()
                };
                (mailbox, ConsumerOrigin::Queue)
            }
            DestinationKind::Topic => {
                let mut topics = self.state.topics.write().unwrap();
                let topic = topics.entry(binding.name.clone()).or_default();
                match binding.consumer_type {
                    ConsumerType::Durable => {
                        let key = binding.subscriber_name.clone().ok_or_else(|| {
                            ConsumerError::CreateFailed {
                                kind: binding.kind,
                                name: binding.name.clone(),
                                reason: "durable subscription without subscriber name".to_string(),
                            }
                        })?;
                        let mailbox = topic
                            .named
                            .entry(key.clone())
                            .or_insert_with(|| Mailbox::new(true))
                            .clone();
                        (
                            mailbox,
                            ConsumerOrigin::TopicNamed {
                                topic: binding.name.clone(),
                                key,
                            },
                        )
                    }
                    ConsumerType::Shared => {
                        let key = binding
                            .subscriber_name
                            .clone()
                            .unwrap_or_else(|| binding.name.clone());
                        let mailbox = topic
                            .named
                            .entry(key.clone())
                            .or_insert_with(|| Mailbox::new(false))
                            .clone();
                        (
                            mailbox,
                            ConsumerOrigin::TopicNamed {
                                topic: binding.name.clone(),
                                key,
                            },
                        )
                    }
                    ConsumerType::Default => {
                        let key = self.state.sub_seq.fetch_add(1, Ordering::SeqCst) + 1;
                        let mailbox = Mailbox::new(false);
                        topic.anonymous.insert(key, mailbox.clone());
                        (
                            mailbox,
                            ConsumerOrigin::TopicAnonymous {
                                topic: binding.name.clone(),
                                key,
                            },
                        )
                    }
                }
            }
        };

        mailbox.attach(self.connection_id, binding.no_local);
        debug!(
            destination = %binding.name,
            kind = %binding.kind,
            "consumer attached"
        );
        Ok(Box::new(MemoryConsumer {
            state: self.state.clone(),
            mailbox,
            selector,
            ack_mode: self.ack_mode,
            origin,
            pending: HashMap::new(),
            closed: false,
        }))
    }

    async fn close(&self) {}
}

enum ConsumerOrigin {
    Queue,
    TopicAnonymous { topic: String, key: u64 },
    TopicNamed { topic: String, key: String },
}

struct MemoryConsumer {
    state: Arc<BrokerState>,
    mailbox: Arc<Mailbox>,
    selector: Selector,
    ack_mode: AckMode,
    origin: ConsumerOrigin,
    pending: HashMap<String, Message>,
    closed: bool,
}

impl MemoryConsumer {
    /// Unacknowledged client-ack deliveries go back to the front of the
    /// backlog, flagged as redelivered.
    fn requeue_pending(&mut self) {
        for (_, mut message) in self.pending.drain() {
            message.mark_redelivered();
            debug!(uuid = %message.uuid, "requeueing unacknowledged message");
            self.mailbox.push_front(message);
        }
    }

    fn detach(&mut self) {
        let remaining = self.mailbox.attached.fetch_sub(1, Ordering::SeqCst) - 1;
        match &self.origin {
            ConsumerOrigin::Queue => {}
            ConsumerOrigin::TopicAnonymous { topic, key } => {
                let mut topics = self.state.topics.write().unwrap();
                if let Some(state) = topics.get_mut(topic) {
                    state.anonymous.remove(key);
                }
            }
            ConsumerOrigin::TopicNamed { topic, key } => {
                // durable backlogs survive the subscriber going away
                if !self.mailbox.durable && remaining == 0 {
                    let mut topics = self.state.topics.write().unwrap();
                    if let Some(state) = topics.get_mut(topic) {
                        state.named.remove(key);
                    }
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.requeue_pending();
        self.detach();
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn receive(&mut self) -> Result<Option<Message>, ReceiveError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            // register for wakeups before checking, so a publish landing
            // between the check and the await is not missed
            let notified = self.mailbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.mailbox.fault.load(Ordering::SeqCst) {
                return Err(ReceiveError::ConnectionLost);
            }
            if let Some(message) = self.mailbox.pop_matching(&self.selector) {
                if self.ack_mode == AckMode::Client {
                    self.pending.insert(message.uuid.clone(), message.clone());
                }
                return Ok(Some(message));
            }
            notified.await;
        }
    }

    async fn acknowledge(&mut self, message: &Message) -> Result<(), ReceiveError> {
        if self.closed {
            return Err(ReceiveError::Closed);
        }
        if self.pending.remove(&message.uuid).is_none() && self.ack_mode == AckMode::Client {
            warn!(uuid = %message.uuid, "acknowledge for unknown delivery");
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.cleanup();
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bindings::{ConsumerType, DestinationConfig, ServiceConfig};
    use std::time::Duration;

    fn queue_binding(name: &str, ack_mode: AckMode) -> DestinationBinding {
        DestinationBinding::from_config(&ServiceConfig::queue(name).with_ack_mode(ack_mode))
            .unwrap()
    }

    fn topic_binding(name: &str) -> DestinationBinding {
        DestinationBinding::from_config(&ServiceConfig::topic(name)).unwrap()
    }

    fn durable_binding(name: &str, subscriber: &str) -> DestinationBinding {
        DestinationBinding::from_config(&ServiceConfig::durable_topic(name, subscriber)).unwrap()
    }

    async fn consumer_for(
        broker: &MemoryBroker,
        binding: &DestinationBinding,
    ) -> Box<dyn BrokerConsumer> {
        let connection = broker
            .connect(&ConnectionConfig::new("memory://test"))
            .await
            .unwrap();
        let session = connection.create_session(binding.ack_mode).await.unwrap();
        session.create_consumer(binding).await.unwrap()
    }

    #[tokio::test]
    async fn queue_delivers_in_fifo_order() {
        let broker = MemoryBroker::new();
        let binding = queue_binding("orders", AckMode::Auto);
        let mut consumer = consumer_for(&broker, &binding).await;

        for idx in 0..3 {
            broker.publish(
                DestinationKind::Queue,
                "orders",
                Message::new(format!("m{}", idx)),
            );
        }

        for idx in 0..3 {
            let message = consumer.receive().await.unwrap().unwrap();
            assert_eq!(message.payload, format!("m{}", idx));
        }
    }

    #[tokio::test]
    async fn queue_retains_backlog_without_consumer() {
        let broker = MemoryBroker::new();
        broker.publish(DestinationKind::Queue, "orders", Message::new("early"));
        assert_eq!(broker.queue_depth("orders"), 1);

        let binding = queue_binding("orders", AckMode::Auto);
        let mut consumer = consumer_for(&broker, &binding).await;
        let message = consumer.receive().await.unwrap().unwrap();
        assert_eq!(message.payload, "early");
    }

    #[tokio::test]
    async fn topic_fans_out_to_every_subscriber() {
        let broker = MemoryBroker::new();
        let binding = topic_binding("alerts");
        let mut first = consumer_for(&broker, &binding).await;
        let mut second = consumer_for(&broker, &binding).await;

        broker.publish(DestinationKind::Topic, "alerts", Message::new("ping"));

        assert_eq!(first.receive().await.unwrap().unwrap().payload, "ping");
        assert_eq!(second.receive().await.unwrap().unwrap().payload, "ping");
    }

    #[tokio::test]
    async fn topic_without_subscribers_drops_messages() {
        let broker = MemoryBroker::new();
        broker.publish(DestinationKind::Topic, "alerts", Message::new("lost"));

        let binding = topic_binding("alerts");
        let mut consumer = consumer_for(&broker, &binding).await;
        broker.publish(DestinationKind::Topic, "alerts", Message::new("kept"));
        assert_eq!(consumer.receive().await.unwrap().unwrap().payload, "kept");
    }

    #[tokio::test]
    async fn durable_subscription_keeps_backlog_while_detached() {
        let broker = MemoryBroker::new();
        let binding = durable_binding("alerts", "sub1");

        let mut consumer = consumer_for(&broker, &binding).await;
        broker.publish(DestinationKind::Topic, "alerts", Message::new("before"));
        assert_eq!(consumer.receive().await.unwrap().unwrap().payload, "before");
        consumer.close().await;

        broker.publish(DestinationKind::Topic, "alerts", Message::new("while-away"));

        let mut consumer = consumer_for(&broker, &binding).await;
        assert_eq!(
            consumer.receive().await.unwrap().unwrap().payload,
            "while-away"
        );
    }

    #[tokio::test]
    async fn selector_filters_deliveries() {
        let broker = MemoryBroker::new();
        let config = ServiceConfig::queue("orders").with_selector("region = 'eu'");
        let binding = DestinationBinding::from_config(&config).unwrap();
        let mut consumer = consumer_for(&broker, &binding).await;

        broker.publish(
            DestinationKind::Queue,
            "orders",
            Message::new("us-order").with_header("region", "us"),
        );
        broker.publish(
            DestinationKind::Queue,
            "orders",
            Message::new("eu-order").with_header("region", "eu"),
        );

        let message = consumer.receive().await.unwrap().unwrap();
        assert_eq!(message.payload, "eu-order");
        // the non-matching message stays queued
        assert_eq!(broker.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn invalid_selector_is_rejected_at_consumer_creation() {
        let broker = MemoryBroker::new();
        let config = ServiceConfig::queue("orders").with_selector("region IN ('eu', 'us')");
        let binding = DestinationBinding::from_config(&config).unwrap();

        let connection = broker
            .connect(&ConnectionConfig::new("memory://test"))
            .await
            .unwrap();
        let session = connection.create_session(AckMode::Auto).await.unwrap();
        let result = session.create_consumer(&binding).await;
        assert!(matches!(
            result.unwrap_err(),
            ConsumerError::InvalidSelector { .. }
        ));
    }

    #[tokio::test]
    async fn no_local_skips_messages_from_own_connection() {
        let broker = MemoryBroker::new();
        let mut config = ServiceConfig::topic("alerts");
        if let DestinationConfig::Topic { no_local, .. } = &mut config.destination {
            *no_local = true;
        }
        let binding = DestinationBinding::from_config(&config).unwrap();

        let connection = broker
            .connect(&ConnectionConfig::new("memory://test"))
            .await
            .unwrap();
        let session = connection.create_session(AckMode::Auto).await.unwrap();
        let mut consumer = session.create_consumer(&binding).await.unwrap();

        // first connection opened gets id 1
        broker.publish_from(1, DestinationKind::Topic, "alerts", Message::new("own"));
        broker.publish(DestinationKind::Topic, "alerts", Message::new("foreign"));

        assert_eq!(consumer.receive().await.unwrap().unwrap().payload, "foreign");
    }

    #[tokio::test]
    async fn unacknowledged_messages_are_redelivered_after_close() {
        let broker = MemoryBroker::new();
        let binding = queue_binding("orders", AckMode::Client);

        let mut consumer = consumer_for(&broker, &binding).await;
        broker.publish(DestinationKind::Queue, "orders", Message::new("work"));
        let message = consumer.receive().await.unwrap().unwrap();
        assert!(!message.is_redelivered());
        // no acknowledge before close
        consumer.close().await;

        let mut consumer = consumer_for(&broker, &binding).await;
        let redelivered = consumer.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.uuid, message.uuid);
        assert!(redelivered.is_redelivered());
    }

    #[tokio::test]
    async fn acknowledged_messages_are_not_redelivered() {
        let broker = MemoryBroker::new();
        let binding = queue_binding("orders", AckMode::Client);

        let mut consumer = consumer_for(&broker, &binding).await;
        broker.publish(DestinationKind::Queue, "orders", Message::new("work"));
        let message = consumer.receive().await.unwrap().unwrap();
        consumer.acknowledge(&message).await.unwrap();
        consumer.close().await;

        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[tokio::test]
    async fn drop_connections_faults_open_consumers() {
        let broker = MemoryBroker::new();
        let binding = queue_binding("orders", AckMode::Auto);
        let mut consumer = consumer_for(&broker, &binding).await;

        let broker_clone = broker.clone();
        let dropper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            broker_clone.drop_connections();
        });

        assert_eq!(
            consumer.receive().await.unwrap_err(),
            ReceiveError::ConnectionLost
        );
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn refuse_connections_fails_connect() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let result = broker.connect(&ConnectionConfig::new("memory://test")).await;
        assert!(matches!(
            result.unwrap_err(),
            ConnectionError::Connect { .. }
        ));
        assert_eq!(broker.connection_count(), 0);

        broker.refuse_connections(false);
        assert!(broker
            .connect(&ConnectionConfig::new("memory://test"))
            .await
            .is_ok());
        assert_eq!(broker.connection_count(), 1);
    }

    #[test]
    fn selector_parsing_rules() {
        assert_eq!(Selector::parse("").unwrap(), Selector::All);
        assert_eq!(Selector::parse("   ").unwrap(), Selector::All);
        assert_eq!(
            Selector::parse("region = 'eu'").unwrap(),
            Selector::HeaderEquals {
                key: "region".to_string(),
                value: "eu".to_string()
            }
        );
        assert!(Selector::parse("region").is_err());
        assert!(Selector::parse("region = eu").is_err());
        assert!(Selector::parse("= 'eu'").is_err());
    }
}

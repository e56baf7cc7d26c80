pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use bindings::{AckMode, DestinationBinding, DestinationKind, DestinationName};
use internals::Message;

pub use memory::MemoryBroker;

/// Broker connection parameters, immutable after listener construction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionConfig {
    pub initial_context_factory: String,
    pub provider_url: String,
    pub connection_factory_name: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl ConnectionConfig {
    pub fn new(provider_url: impl Into<String>) -> Self {
        ConnectionConfig {
            initial_context_factory: "memory".to_string(),
            provider_url: provider_url.into(),
            connection_factory_name: "ConnectionFactory".to_string(),
            credentials: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to '{url}': {reason}")]
    Connect { url: String, reason: String },
    #[error("connection retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create session: {reason}")]
    CreateFailed { reason: String },
    #[error("no open broker connection")]
    NotConnected,
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to create consumer for {kind} '{name}': {reason}")]
    CreateFailed {
        kind: DestinationKind,
        name: DestinationName,
        reason: String,
    },
    #[error("unsupported message selector '{selector}'")]
    InvalidSelector { selector: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ReceiveError {
    #[error("connection to the broker was lost")]
    ConnectionLost,
    #[error("consumer is closed")]
    Closed,
}

/// Entry point of the broker client library the dispatch layer sits on.
/// The wire protocol behind it is none of this crate's business.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Broker connections are not assumed safe for concurrent session
    /// creation; callers serialize on their side.
    async fn create_session(&self, ack_mode: AckMode)
        -> Result<Box<dyn BrokerSession>, SessionError>;
    async fn close(&self);
}

impl std::fmt::Debug for dyn BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BrokerConnection")
    }
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_consumer(
        &self,
        binding: &DestinationBinding,
    ) -> Result<Box<dyn BrokerConsumer>, ConsumerError>;
    async fn close(&self);
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Blocks until a message arrives. `Ok(None)` means the consumer was
    /// closed cleanly; `Err(ConnectionLost)` means the transport dropped and
    /// every consumer on the same connection is affected.
    async fn receive(&mut self) -> Result<Option<Message>, ReceiveError>;
    async fn acknowledge(&mut self, message: &Message) -> Result<(), ReceiveError>;
    async fn close(&mut self);
}

impl std::fmt::Debug for dyn BrokerConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BrokerConsumer")
    }
}

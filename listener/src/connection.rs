use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use bindings::AckMode;
use broker::{
    BrokerClient, BrokerConnection, BrokerSession, ConnectionConfig, ConnectionError, SessionError,
};

/// Bounded exponential backoff applied when the broker connection drops.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(50),
            max_attempts: 5,
        }
    }
}

/// Owns the one physical broker connection every consumer session shares.
pub struct ConnectionManager {
    client: Arc<dyn BrokerClient>,
    config: ConnectionConfig,
    retry: RetryPolicy,
    connection: Mutex<Option<Box<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(client: Arc<dyn BrokerClient>, config: ConnectionConfig, retry: RetryPolicy) -> Self {
        ConnectionManager {
            client,
            config,
            retry,
            connection: Mutex::new(None),
        }
    }

    #[instrument(skip_all, fields(url = %self.config.provider_url))]
    pub async fn open(&self) -> Result<(), ConnectionError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Ok(());
        }
        info!("opening broker connection");
        *connection = Some(self.client.connect(&self.config).await?);
        info!("broker connection opened");
        Ok(())
    }

    /// Drops the current connection and re-establishes it under the retry
    /// policy. Exhausted retries surface as a listener-level fault.
    #[instrument(skip_all, fields(url = %self.config.provider_url))]
    pub async fn reopen(&self) -> Result<(), ConnectionError> {
        let mut connection = self.connection.lock().await;
        if let Some(old) = connection.take() {
            old.close().await;
        }

        let mut delay = self.retry.base_delay;
        for attempt in 1..=self.retry.max_attempts {
            match self.client.connect(&self.config).await {
                Ok(reconnected) => {
                    info!(attempt, "broker connection re-established");
                    *connection = Some(reconnected);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        error!("reconnect retries exhausted");
        Err(ConnectionError::RetriesExhausted {
            attempts: self.retry.max_attempts,
        })
    }

    /// Session creation is serialized on the connection lock; broker
    /// connections are not assumed safe for concurrent session creation.
    pub async fn create_session(
        &self,
        ack_mode: AckMode,
    ) -> Result<Box<dyn BrokerSession>, SessionError> {
        let connection = self.connection.lock().await;
        match connection.as_ref() {
            Some(connection) => connection.create_session(ack_mode).await,
            None => Err(SessionError::NotConnected),
        }
    }

    #[instrument(skip_all)]
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            info!("closing broker connection");
            connection.close().await;
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, instrument, warn};

use bindings::ServiceId;
use broker::{ConnectionError, ConsumerError, SessionError};
use registry::{RegistryError, ServiceRegistry};

use crate::connection::ConnectionManager;
use crate::session::{ConsumerSession, SessionState};

#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("service '{0}' is already active")]
    AlreadyActive(ServiceId),
    #[error("service '{0}' is not active")]
    NotActive(ServiceId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// The multiplexing core: bridges registered services to consumer sessions
/// over the one shared connection, one session per active service.
///
/// All activation and deactivation transitions serialize on the active-set
/// lock; message delivery runs in the session tasks and never takes it.
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    connection: Arc<ConnectionManager>,
    active: Mutex<HashMap<ServiceId, ConsumerSession>>,
    fault_tx: mpsc::UnboundedSender<ServiceId>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        connection: Arc<ConnectionManager>,
        fault_tx: mpsc::UnboundedSender<ServiceId>,
    ) -> Self {
        Dispatcher {
            registry,
            connection,
            active: Mutex::new(HashMap::new()),
            fault_tx,
        }
    }

    #[instrument(skip_all, fields(service_id = %service_id))]
    pub async fn activate(&self, service_id: &ServiceId) -> Result<(), ActivateError> {
        info!("activating service");
        let mut active = self.active.lock().await;

        if active.contains_key(service_id) {
            warn!("service is already active");
            return Err(ActivateError::AlreadyActive(service_id.clone()));
        }

        let record = self.registry.record(service_id)?;
        let session = self
            .connection
            .create_session(record.binding.ack_mode)
            .await?;
        let consumer = match session.create_consumer(&record.binding).await {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(error = %e, "consumer creation failed");
                session.close().await;
                return Err(e.into());
            }
        };

        let consumer_session = ConsumerSession::spawn(
            service_id.clone(),
            record.binding,
            session,
            consumer,
            record.handler,
            self.fault_tx.clone(),
        );
        active.insert(service_id.clone(), consumer_session);

        info!("service activated");
        Ok(())
    }

    #[instrument(skip_all, fields(service_id = %service_id))]
    pub async fn deactivate(
        &self,
        service_id: &ServiceId,
        grace: Duration,
    ) -> Result<(), ActivateError> {
        info!("deactivating service");
        let session = self.active.lock().await.remove(service_id);
        match session {
            Some(session) => {
                session.shutdown(grace).await;
                info!("service deactivated");
                Ok(())
            }
            None => {
                warn!("service is not active");
                Err(ActivateError::NotActive(service_id.clone()))
            }
        }
    }

    /// Tears down every active session and returns their service ids, so a
    /// reconnect can re-activate the same set.
    #[instrument(skip_all)]
    pub async fn deactivate_all(&self, grace: Duration) -> Vec<ServiceId> {
        let sessions: Vec<ConsumerSession> = {
            let mut active = self.active.lock().await;
            active.drain().map(|(_, session)| session).collect()
        };

        let mut service_ids = Vec::with_capacity(sessions.len());
        for session in sessions {
            service_ids.push(session.service_id().clone());
            session.shutdown(grace).await;
        }
        service_ids
    }

    pub async fn is_active(&self, service_id: &ServiceId) -> bool {
        self.active.lock().await.contains_key(service_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn active_services(&self) -> Vec<ServiceId> {
        self.active.lock().await.keys().cloned().collect()
    }

    pub async fn session_state(&self, service_id: &ServiceId) -> Option<SessionState> {
        self.active
            .lock()
            .await
            .get(service_id)
            .map(|session| session.state())
    }

    pub async fn watch_session(
        &self,
        service_id: &ServiceId,
    ) -> Option<watch::Receiver<SessionState>> {
        self.active
            .lock()
            .await
            .get(service_id)
            .map(|session| session.watch_state())
    }
}

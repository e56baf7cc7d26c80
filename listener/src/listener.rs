pub mod connection;
pub mod dispatcher;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, instrument, warn, Instrument};

use bindings::{ServiceConfig, ServiceId};
use broker::{BrokerClient, ConnectionConfig, ConnectionError};
use registry::{MessageHandler, RegistryError, ServiceRegistry};

pub use crate::connection::{ConnectionManager, RetryPolicy};
pub use crate::dispatcher::{ActivateError, Dispatcher};
pub use crate::session::SessionState;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Stopped,
    Running,
    /// Connection lost, reconnect in progress.
    Degraded,
    /// Reconnect retries exhausted.
    Failed,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Activate(#[from] ActivateError),
}

/// Per-service outcome of `start()`. One service failing to activate does
/// not abort the others.
#[derive(Debug)]
pub struct StartReport {
    pub results: Vec<(ServiceId, Result<(), ActivateError>)>,
}

impl StartReport {
    pub fn activated(&self) -> Vec<&ServiceId> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(service_id, _)| service_id)
            .collect()
    }

    pub fn failed(&self) -> Vec<(&ServiceId, &ActivateError)> {
        self.results
            .iter()
            .filter_map(|(service_id, result)| {
                result.as_ref().err().map(|error| (service_id, error))
            })
            .collect()
    }

    pub fn fully_activated(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }
}

/// A shared listener multiplexing many message-handling services over one
/// broker connection. Services attach before or after `start()`; each gets
/// its own session, consumer and acknowledgement scope.
pub struct ServiceListener {
    registry: Arc<ServiceRegistry>,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    health_tx: Arc<watch::Sender<Health>>,
    grace_period: Duration,
    running: Arc<AtomicBool>,
    fault_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ServiceId>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceListener {
    pub fn new(client: Arc<dyn BrokerClient>, config: ConnectionConfig) -> Self {
        Self::with_options(
            client,
            config,
            RetryPolicy::default(),
            DEFAULT_GRACE_PERIOD,
            false,
        )
    }

    pub fn with_options(
        client: Arc<dyn BrokerClient>,
        config: ConnectionConfig,
        retry: RetryPolicy,
        grace_period: Duration,
        allow_shared_subscriptions: bool,
    ) -> Self {
        let registry =
            Arc::new(ServiceRegistry::new().allow_shared_subscriptions(allow_shared_subscriptions));
        let connection = Arc::new(ConnectionManager::new(client, config, retry));
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            connection.clone(),
            fault_tx,
        ));

        ServiceListener {
            registry,
            connection,
            dispatcher,
            health_tx: Arc::new(watch::channel(Health::Stopped).0),
            grace_period,
            running: Arc::new(AtomicBool::new(false)),
            fault_rx: std::sync::Mutex::new(Some(fault_rx)),
            supervisor: Mutex::new(None),
        }
    }

    /// Attach a service. Before `start()` this only records it; while the
    /// listener runs the service is activated immediately.
    #[instrument(skip_all, fields(service_id = %service_id))]
    pub async fn register(
        &self,
        service_id: &ServiceId,
        config: &ServiceConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ListenerError> {
        self.registry.register(service_id, config, handler)?;
        if self.running.load(Ordering::SeqCst) {
            self.dispatcher.activate(service_id).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(service_id = %service_id))]
    pub async fn unregister(&self, service_id: &ServiceId) -> Result<(), ListenerError> {
        if self.dispatcher.is_active(service_id).await {
            self.dispatcher
                .deactivate(service_id, self.grace_period)
                .await?;
        }
        self.registry.unregister(service_id)?;
        Ok(())
    }

    /// Opens the connection and activates every registered service.
    /// Activation failures are collected per service, not propagated.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<StartReport, ListenerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("listener is already running");
            return Err(ListenerError::AlreadyRunning);
        }

        info!("starting listener");
        if let Err(e) = self.connection.open().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let mut service_ids = match self.registry.service_ids() {
            Ok(service_ids) => service_ids,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        service_ids.sort();

        let mut results = Vec::with_capacity(service_ids.len());
        for service_id in service_ids {
            let result = self.dispatcher.activate(&service_id).await;
            if let Err(error) = &result {
                warn!(service_id = %service_id, %error, "service activation failed");
            }
            results.push((service_id, result));
        }

        self.spawn_supervisor().await;
        self.health_tx.send_replace(Health::Running);
        info!(activated = results.iter().filter(|(_, r)| r.is_ok()).count(), "listener started");
        Ok(StartReport { results })
    }

    /// Deactivates every session, allowing in-flight handler calls up to
    /// `grace_period` to finish, then closes the connection. Calling it on a
    /// stopped listener is a no-op.
    #[instrument(skip_all)]
    pub async fn stop(&self, grace_period: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            info!("listener is already stopped");
            return;
        }

        info!("stopping listener");
        let _ = self.dispatcher.deactivate_all(grace_period).await;
        self.connection.close().await;
        self.health_tx.send_replace(Health::Stopped);
        info!("listener stopped");
    }

    pub fn health(&self) -> Health {
        *self.health_tx.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<Health> {
        self.health_tx.subscribe()
    }

    pub async fn active_services(&self) -> Vec<ServiceId> {
        self.dispatcher.active_services().await
    }

    pub async fn session_state(&self, service_id: &ServiceId) -> Option<SessionState> {
        self.dispatcher.session_state(service_id).await
    }

    pub async fn watch_session(
        &self,
        service_id: &ServiceId,
    ) -> Option<watch::Receiver<SessionState>> {
        self.dispatcher.watch_session(service_id).await
    }

    /// The supervisor reacts to connection faults reported by session tasks:
    /// it suspends every session, reopens the connection under the retry
    /// policy and re-activates the previously active set. Spawned once; it
    /// ignores faults that arrive while the listener is stopped.
    async fn spawn_supervisor(&self) {
        let fault_rx = self.fault_rx.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut fault_rx) = fault_rx else {
            return;
        };

        let dispatcher = self.dispatcher.clone();
        let connection = self.connection.clone();
        let health_tx = self.health_tx.clone();
        let running = self.running.clone();
        let grace = self.grace_period;

        let handle = tokio::spawn(
            async move {
                while let Some(service_id) = fault_rx.recv().await {
                    if !running.load(Ordering::SeqCst) {
                        continue;
                    }
                    warn!(service_id = %service_id, "connection fault reported");
                    health_tx.send_replace(Health::Degraded);

                    let suspended = dispatcher.deactivate_all(grace).await;
                    // sessions sharing the connection all report the same fault
                    while fault_rx.try_recv().is_ok() {}

                    match connection.reopen().await {
                        Ok(()) => {
                            if !running.load(Ordering::SeqCst) {
                                connection.close().await;
                                continue;
                            }
                            for service_id in suspended {
                                if let Err(error) = dispatcher.activate(&service_id).await {
                                    error!(service_id = %service_id, %error, "re-activation failed");
                                }
                            }
                            health_tx.send_replace(Health::Running);
                            info!("listener recovered after reconnect");
                        }
                        Err(error) => {
                            error!(%error, "reconnect failed, listener is degraded beyond recovery");
                            health_tx.send_replace(Health::Failed);
                        }
                    }
                }
            }
            .instrument(info_span!("supervisor")),
        );

        *self.supervisor.lock().await = Some(handle);
    }
}

#[cfg(test)]
mod tests_utils;

#[cfg(test)]
mod tests;

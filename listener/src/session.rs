use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use bindings::{AckMode, DestinationBinding, ServiceId};
use broker::{BrokerConsumer, BrokerSession, ReceiveError};
use internals::Message;
use registry::MessageHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Draining,
    Closed,
}

/// One broker session and consumer bound to one service, with its own
/// delivery task. Messages for this service are handled strictly one at a
/// time; sessions of other services run in parallel.
pub struct ConsumerSession {
    service_id: ServiceId,
    state_tx: Arc<watch::Sender<SessionState>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerSession {
    pub fn spawn(
        service_id: ServiceId,
        binding: DestinationBinding,
        session: Box<dyn BrokerSession>,
        consumer: Box<dyn BrokerConsumer>,
        handler: Arc<dyn MessageHandler>,
        fault_tx: mpsc::UnboundedSender<ServiceId>,
    ) -> Self {
        let state_tx = Arc::new(watch::channel(SessionState::Starting).0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let span = info_span!(
            "consumer_session",
            service_id = %service_id,
            destination = %binding.name
        );
        let task = tokio::spawn(
            run_delivery_loop(
                service_id.clone(),
                binding,
                session,
                consumer,
                handler,
                fault_tx,
                state_tx.clone(),
                shutdown_rx,
            )
            .instrument(span),
        );

        ConsumerSession {
            service_id,
            state_tx,
            shutdown_tx,
            task,
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Cooperative shutdown: stop accepting deliveries, let the in-flight
    /// handler call finish within `grace`, then abort the task.
    pub async fn shutdown(mut self, grace: Duration) {
        self.state_tx.send_replace(SessionState::Draining);
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!(service_id = %self.service_id, "grace period elapsed, aborting session task");
            self.task.abort();
            self.state_tx.send_replace(SessionState::Closed);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_delivery_loop(
    service_id: ServiceId,
    binding: DestinationBinding,
    session: Box<dyn BrokerSession>,
    mut consumer: Box<dyn BrokerConsumer>,
    handler: Arc<dyn MessageHandler>,
    fault_tx: mpsc::UnboundedSender<ServiceId>,
    state_tx: Arc<watch::Sender<SessionState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    state_tx.send_replace(SessionState::Active);
    info!("delivery started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            received = consumer.receive() => match received {
                Ok(Some(message)) => {
                    deliver(&binding, handler.as_ref(), consumer.as_mut(), message).await;
                }
                Ok(None) => {
                    info!("consumer closed, delivery finished");
                    break;
                }
                Err(ReceiveError::ConnectionLost) => {
                    warn!("connection lost, suspending session");
                    let _ = fault_tx.send(service_id.clone());
                    break;
                }
                Err(error) => {
                    error!(%error, "receive failed, delivery finished");
                    break;
                }
            }
        }
    }

    state_tx.send_replace(SessionState::Draining);
    consumer.close().await;
    session.close().await;
    state_tx.send_replace(SessionState::Closed);
    info!("session closed");
}

/// Invokes the handler and applies the binding's acknowledgement mode. A
/// handler fault leaves the message unacknowledged so the broker can
/// redeliver it.
async fn deliver(
    binding: &DestinationBinding,
    handler: &dyn MessageHandler,
    consumer: &mut dyn BrokerConsumer,
    message: Message,
) {
    match handler.handle(&message) {
        Ok(()) => {
            if binding.ack_mode == AckMode::Client {
                if let Err(error) = consumer.acknowledge(&message).await {
                    warn!(uuid = %message.uuid, %error, "acknowledge failed");
                }
            }
        }
        Err(fault) => {
            error!(uuid = %message.uuid, %fault, "handler fault, message left unacknowledged");
        }
    }
}

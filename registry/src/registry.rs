use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use bindings::{ConfigError, DestinationBinding, ServiceConfig, ServiceId};
use internals::Message;

/// Fault raised by a user-supplied message handler. Contained at the
/// dispatcher boundary; it never aborts the owning session.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("handler fault: {0}")]
pub struct HandlerFault(pub String);

pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Result<(), HandlerFault>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), HandlerFault> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerFault> {
        self(message)
    }
}

#[derive(Clone)]
pub struct ServiceRecord {
    pub service_id: ServiceId,
    pub binding: DestinationBinding,
    pub handler: Arc<dyn MessageHandler>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("service '{0}' is already registered")]
    DuplicateService(ServiceId),
    #[error("service '{0}' is not registered")]
    NotFound(ServiceId),
    #[error("service registry is unavailable")]
    Unavailable,
}

/// Maps service ids to validated destination bindings and their handlers.
/// The one piece of mutable shared state between registration and dispatch.
pub struct ServiceRegistry {
    records: RwLock<HashMap<ServiceId, ServiceRecord>>,
    allow_shared_subscriptions: bool,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        ServiceRegistry {
            records: RwLock::new(HashMap::new()),
            allow_shared_subscriptions: false,
        }
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate `(kind, name)` bindings are rejected by default; this toggle
    /// permits them when both sides declare a shared subscription.
    pub fn allow_shared_subscriptions(mut self, allow: bool) -> Self {
        self.allow_shared_subscriptions = allow;
        self
    }

    #[instrument(skip_all, fields(service_id = %service_id))]
    pub fn register(
        &self,
        service_id: &ServiceId,
        config: &ServiceConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), RegistryError> {
        info!("registering service");
        let binding = DestinationBinding::from_config(config)?;

        let mut records = self.records.write().map_err(|e| {
            error!(error = %e, "service records are unavailable");
            RegistryError::Unavailable
        })?;

        if records.contains_key(service_id) {
            warn!("service already registered");
            return Err(RegistryError::DuplicateService(service_id.clone()));
        }

        for existing in records.values() {
            if existing.binding.same_destination(&binding) {
                let shared_pair = self.allow_shared_subscriptions
                    && existing.binding.is_shared()
                    && binding.is_shared();
                if !shared_pair {
                    warn!(
                        conflicting_service = %existing.service_id,
                        "destination already bound"
                    );
                    return Err(ConfigError::ConflictingDestination {
                        first: existing.service_id.clone(),
                        second: service_id.clone(),
                        kind: binding.kind,
                        name: binding.name.clone(),
                    }
                    .into());
                }
            }
        }

        records.insert(
            service_id.clone(),
            ServiceRecord {
                service_id: service_id.clone(),
                binding,
                handler,
            },
        );

        info!("service registered");
        Ok(())
    }

    #[instrument(skip_all, fields(service_id = %service_id))]
    pub fn unregister(&self, service_id: &ServiceId) -> Result<(), RegistryError> {
        info!("unregistering service");
        let mut records = self.records.write().map_err(|e| {
            error!(error = %e, "service records are unavailable");
            RegistryError::Unavailable
        })?;

        if records.remove(service_id).is_none() {
            warn!("service does not exist");
            return Err(RegistryError::NotFound(service_id.clone()));
        }

        info!("service unregistered");
        Ok(())
    }

    pub fn resolve(&self, service_id: &ServiceId) -> Result<DestinationBinding, RegistryError> {
        Ok(self.record(service_id)?.binding)
    }

    #[instrument(skip_all, fields(service_id = %service_id))]
    pub fn record(&self, service_id: &ServiceId) -> Result<ServiceRecord, RegistryError> {
        let records = self.records.read().map_err(|e| {
            error!(error = %e, "service records are unavailable");
            RegistryError::Unavailable
        })?;

        match records.get(service_id) {
            Some(record) => Ok(record.clone()),
            None => {
                error!("service not found");
                Err(RegistryError::NotFound(service_id.clone()))
            }
        }
    }

    pub fn service_ids(&self) -> Result<Vec<ServiceId>, RegistryError> {
        let records = self.records.read().map_err(|e| {
            error!(error = %e, "service records are unavailable");
            RegistryError::Unavailable
        })?;
        Ok(records.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bindings::{AckMode, DestinationKind, ServiceConfig};

    fn noop_handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_message: &Message| Ok(()))
    }

    #[test]
    fn register_and_resolve() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                &"svc-a".to_string(),
                &ServiceConfig::queue("orders").with_ack_mode(AckMode::Client),
                noop_handler(),
            )
            .unwrap();

        let binding = registry.resolve(&"svc-a".to_string()).unwrap();
        assert_eq!(binding.kind, DestinationKind::Queue);
        assert_eq!(binding.name, "orders");
        assert_eq!(binding.ack_mode, AckMode::Client);
    }

    #[test]
    fn duplicate_service_id_is_rejected() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                &"svc-a".to_string(),
                &ServiceConfig::queue("orders"),
                noop_handler(),
            )
            .unwrap();

        let result = registry.register(
            &"svc-a".to_string(),
            &ServiceConfig::queue("other"),
            noop_handler(),
        );
        assert!(matches!(
            result.unwrap_err(),
            RegistryError::DuplicateService(_)
        ));
    }

    #[test]
    fn conflicting_destination_names_both_services() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                &"svc-a".to_string(),
                &ServiceConfig::queue("orders"),
                noop_handler(),
            )
            .unwrap();

        let result = registry.register(
            &"svc-b".to_string(),
            &ServiceConfig::queue("orders"),
            noop_handler(),
        );
        match result.unwrap_err() {
            RegistryError::Config(ConfigError::ConflictingDestination {
                first, second, ..
            }) => {
                assert_eq!(first, "svc-a");
                assert_eq!(second, "svc-b");
            }
            other => panic!("unexpected error: {}", other),
        }

        // the first registration is untouched
        assert!(registry.resolve(&"svc-a".to_string()).is_ok());
    }

    #[test]
    fn same_name_different_kind_is_not_a_conflict() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                &"svc-a".to_string(),
                &ServiceConfig::queue("events"),
                noop_handler(),
            )
            .unwrap();
        registry
            .register(
                &"svc-b".to_string(),
                &ServiceConfig::topic("events"),
                noop_handler(),
            )
            .unwrap();
    }

    #[test]
    fn shared_subscriptions_require_the_toggle() {
        let shared = |name: &str| {
            let mut config = ServiceConfig::topic("alerts");
            if let bindings::DestinationConfig::Topic {
                consumer_type,
                subscriber_name,
                ..
            } = &mut config.destination
            {
                *consumer_type = bindings::ConsumerType::Shared;
                *subscriber_name = Some(name.to_string());
            }
            config
        };

        let registry = ServiceRegistry::new();
        registry
            .register(&"svc-a".to_string(), &shared("grp"), noop_handler())
            .unwrap();
        assert!(registry
            .register(&"svc-b".to_string(), &shared("grp"), noop_handler())
            .is_err());

        let registry = ServiceRegistry::new().allow_shared_subscriptions(true);
        registry
            .register(&"svc-a".to_string(), &shared("grp"), noop_handler())
            .unwrap();
        registry
            .register(&"svc-b".to_string(), &shared("grp"), noop_handler())
            .unwrap();
    }

    #[test]
    fn invalid_durable_config_propagates() {
        let mut config = ServiceConfig::topic("alerts");
        if let bindings::DestinationConfig::Topic { consumer_type, .. } = &mut config.destination {
            *consumer_type = bindings::ConsumerType::Durable;
        }

        let registry = ServiceRegistry::new();
        let result = registry.register(&"svc-a".to_string(), &config, noop_handler());
        assert!(matches!(
            result.unwrap_err(),
            RegistryError::Config(ConfigError::InvalidDurableSubscriptionConfig { .. })
        ));
    }

    #[test]
    fn unregister_removes_record() {
        let registry = ServiceRegistry::new();
        registry
            .register(
                &"svc-a".to_string(),
                &ServiceConfig::queue("orders"),
                noop_handler(),
            )
            .unwrap();
        registry.unregister(&"svc-a".to_string()).unwrap();
        assert!(matches!(
            registry.resolve(&"svc-a".to_string()).unwrap_err(),
            RegistryError::NotFound(_)
        ));
        assert!(registry.unregister(&"svc-a".to_string()).is_err());
    }
}

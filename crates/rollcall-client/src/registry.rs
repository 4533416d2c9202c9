//! Registry Facade
//!
//! The public entry point: `register` and `unregister` hand intents to the
//! coordinator's bounded queue, `get_service` answers from the discovery
//! cache. Every method takes `&self` and is safe for concurrent callers.

use crate::backend::default_plugins;
use crate::cache::DiscoveryCache;
use crate::config::RegistryConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::entry::RegistrationStatus;
use crate::observability::describe_metrics;
use parking_lot::Mutex;
use rollcall_core::{Backend, BackendPlugins, Node, RegistryError, Result, Service};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Registry {
    handle: CoordinatorHandle,
    cache: DiscoveryCache,
    status: watch::Receiver<Vec<RegistrationStatus>>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    invalidation: Option<JoinHandle<()>>,
}

impl Registry {
    /// Start a registry on an already connected backend.
    ///
    /// Spawns the coordinator loop (and the invalidation watch when enabled),
    /// so it must be called from within a tokio runtime.
    pub fn start(backend: Arc<dyn Backend>, config: RegistryConfig) -> Self {
        describe_metrics();

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (coordinator, handle) = Coordinator::new(backend.clone(), &config, shutdown_rx);
        let status = coordinator.subscribe();

        let cache = DiscoveryCache::new(
            backend.clone(),
            config.options.register_path.clone(),
            config.call_timeout(),
        );
        let invalidation = config
            .watch_invalidation
            .then(|| cache.spawn_invalidation(config.watch_reconnect_delay));

        info!(
            backend = backend.name(),
            register_path = %config.options.register_path,
            heartbeat = config.options.heartbeat,
            watch_invalidation = config.watch_invalidation,
            "Registry started"
        );

        Self {
            handle,
            cache,
            status,
            shutdown_tx,
            coordinator: Mutex::new(Some(tokio::spawn(coordinator.run()))),
            invalidation,
        }
    }

    /// Resolve `backend` through the plugin table and start a registry on it.
    pub async fn connect(
        plugins: &BackendPlugins,
        backend: &str,
        config: RegistryConfig,
    ) -> Result<Self> {
        let backend = plugins.init(backend, &config.options).await?;
        Ok(Self::start(backend, config))
    }

    /// Connect with the built-in `etcd` and `memory` plugins.
    pub async fn connect_default(backend: &str, config: RegistryConfig) -> Result<Self> {
        let plugins = default_plugins(&config);
        Self::connect(&plugins, backend, config).await
    }

    /// Announce `service`. Returns once the intent is queued; the lease is
    /// obtained asynchronously and retried until it succeeds.
    pub fn register(&self, service: Service) -> Result<()> {
        validate(&service)?;
        self.handle.submit(service)
    }

    /// Withdraw `service`. The coordinator revokes its leases before taking
    /// the next intent, and the local cache entry for the name is dropped.
    pub fn unregister(&self, service: Service) -> Result<()> {
        if service.name.is_empty() {
            return Err(RegistryError::InvalidService("empty service name".into()));
        }
        let name = service.name.clone();
        self.handle.withdraw(service)?;
        self.cache.invalidate(&name);
        Ok(())
    }

    pub async fn get_service(&self, name: &str) -> Result<Arc<Vec<Node>>> {
        self.cache.get_service(name).await
    }

    /// Latest status of every locally registered service, sorted by name.
    pub fn registrations(&self) -> Vec<RegistrationStatus> {
        self.status.borrow().clone()
    }

    /// Watch receiver that changes whenever the coordinator republishes status.
    pub fn watch_registrations(&self) -> watch::Receiver<Vec<RegistrationStatus>> {
        self.status.clone()
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    /// Stop the coordinator and wait for it to release its leases. Later
    /// `register` calls fail with `ShutDown`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.coordinator.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
        if let Some(invalidation) = &self.invalidation {
            invalidation.abort();
        }
        info!("Registry shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(invalidation) = &self.invalidation {
            invalidation.abort();
        }
    }
}

fn validate(service: &Service) -> Result<()> {
    if service.name.is_empty() {
        return Err(RegistryError::InvalidService("empty service name".into()));
    }
    if service.name.contains('/') {
        return Err(RegistryError::InvalidService(format!(
            "service name {:?} contains '/'",
            service.name
        )));
    }

    let mut seen = HashSet::new();
    for node in &service.nodes {
        if node.address.is_empty() {
            return Err(RegistryError::InvalidService(format!(
                "node {:?} of {} has no address",
                node.id, service.name
            )));
        }
        if !seen.insert(node.endpoint()) {
            return Err(RegistryError::InvalidService(format!(
                "duplicate endpoint {} in {}",
                node.endpoint(),
                service.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::time::Duration;

    fn node(n: u8) -> Node {
        Node::new(format!("n{n}"), format!("10.0.0.{n}"), 8080)
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert!(validate(&Service::new("svc-a", vec![node(1), node(2)])).is_ok());
        assert!(validate(&Service::new("svc-a", vec![])).is_ok());

        let cases = [
            Service::new("", vec![node(1)]),
            Service::new("svc/a", vec![node(1)]),
            Service::new("svc-a", vec![Node::new("n1", "", 8080)]),
            Service::new("svc-a", vec![node(1), Node::new("other", "10.0.0.1", 8080)]),
        ];
        for service in cases {
            assert!(
                matches!(validate(&service), Err(RegistryError::InvalidService(_))),
                "{service:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_connect_unknown_backend() {
        let plugins = BackendPlugins::new();
        let err = Registry::connect(&plugins, "zookeeper", RegistryConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, RegistryError::UnknownBackend("zookeeper".into()));
    }

    #[tokio::test]
    async fn test_register_after_shutdown_fails() {
        let backend = MemoryBackend::new();
        let registry = Registry::start(Arc::new(backend), RegistryConfig::default());
        registry.shutdown().await;

        let err = registry
            .register(Service::new("svc-a", vec![node(1)]))
            .unwrap_err();
        assert_eq!(err, RegistryError::ShutDown);
        assert!(registry.registrations().is_empty());
    }

    #[tokio::test]
    async fn test_registrations_reports_state() {
        let backend = MemoryBackend::new();
        let mut config = RegistryConfig::default();
        config.maintenance_interval = Duration::from_millis(20);
        let registry = Registry::start(Arc::new(backend), config);

        registry
            .register(Service::new("svc-a", vec![node(1), node(2)]))
            .unwrap();

        let mut status = registry.watch_registrations();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| s.first().is_some_and(|e| e.lease_id.is_some())),
        )
        .await
        .unwrap()
        .unwrap();

        let registrations = registry.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].service, "svc-a");
        assert_eq!(registrations[0].nodes, 2);
        assert!(registrations[0].last_error.is_none());
        registry.shutdown().await;
    }
}

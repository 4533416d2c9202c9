//! Registration Coordinator
//!
//! A single control loop owns every [`RegisteredEntry`]. Callers only reach
//! it through the bounded intake queue, so no two tasks ever mutate the same
//! registration.
//!
//! Each wakeup does one of:
//! - shutdown: stop after the current tick, release keep-alive streams
//! - maintenance tick: sweep all entries (observe renewals, acquire pending)
//! - intake: apply one intent, then sweep if the queue has drained
//!
//! Ticks are polled before intake so a busy queue cannot starve maintenance.

use crate::config::RegistryConfig;
use crate::entry::{RegisteredEntry, RegistrationStatus};
use crate::lease::LeaseManager;
use crate::observability::{events, metrics};
use rollcall_core::{Backend, RegistryError, Result, Service};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Work submitted to the coordinator.
#[derive(Debug)]
pub(crate) enum Intent {
    Register(Service),
    Unregister(Service),
}

impl Intent {
    fn service_name(&self) -> &str {
        match self {
            Intent::Register(s) | Intent::Unregister(s) => &s.name,
        }
    }
}

/// Caller side of the intake queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    intake: mpsc::Sender<Intent>,
}

impl CoordinatorHandle {
    /// Queue a registration. Fails with `QueueFull` instead of waiting.
    pub fn submit(&self, service: Service) -> Result<()> {
        self.enqueue(Intent::Register(service))
    }

    /// Queue a removal on the same intake as registrations.
    pub fn withdraw(&self, service: Service) -> Result<()> {
        self.enqueue(Intent::Unregister(service))
    }

    fn enqueue(&self, intent: Intent) -> Result<()> {
        self.intake.try_send(intent).map_err(|e| match e {
            mpsc::error::TrySendError::Full(intent) => {
                RegistryError::QueueFull(intent.service_name().to_string())
            }
            mpsc::error::TrySendError::Closed(_) => RegistryError::ShutDown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    /// Driven by the maintenance ticker.
    Scheduled,
    /// Run right after the intake queue drained.
    Drained,
}

pub struct Coordinator {
    leases: LeaseManager,
    entries: HashMap<String, RegisteredEntry>,
    intake: mpsc::Receiver<Intent>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    status_tx: watch::Sender<Vec<RegistrationStatus>>,
    interval: Duration,
    revoke_on_shutdown: bool,
}

impl Coordinator {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: &RegistryConfig,
        shutdown_rx: mpsc::UnboundedReceiver<()>,
    ) -> (Self, CoordinatorHandle) {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (status_tx, _) = watch::channel(Vec::new());

        let leases = LeaseManager::new(
            backend,
            config.options.register_path.clone(),
            config.options.heartbeat,
            config.call_timeout(),
        );

        let coordinator = Self {
            leases,
            entries: HashMap::new(),
            intake: intake_rx,
            shutdown_rx,
            status_tx,
            interval: config.maintenance_interval,
            revoke_on_shutdown: config.revoke_on_shutdown,
        };
        (coordinator, CoordinatorHandle { intake: intake_tx })
    }

    /// Registration status, republished after every tick.
    pub fn subscribe(&self) -> watch::Receiver<Vec<RegistrationStatus>> {
        self.status_tx.subscribe()
    }

    /// Run the control loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Registration coordinator started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!("Coordinator: received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.sweep(Sweep::Scheduled).await;
                }

                intent = self.intake.recv() => {
                    let Some(intent) = intent else {
                        debug!("Coordinator: intake closed");
                        break;
                    };
                    self.apply(intent).await;
                    if self.intake.is_empty() {
                        self.sweep(Sweep::Drained).await;
                    }
                }
            }

            self.publish_status();
        }

        self.release().await;
        info!("Registration coordinator stopped");
    }

    async fn apply(&mut self, intent: Intent) {
        match intent {
            Intent::Register(service) => match self.entries.get_mut(&service.name) {
                Some(entry) if entry.service.same_nodes(&service) => {
                    debug!(service = %service.name, state = ?entry.state, "Service already known");
                }
                Some(entry) => {
                    info!(
                        service = %service.name,
                        node_count = service.nodes.len(),
                        "Node set changed, re-registering"
                    );
                    entry.replace_service(service);
                }
                None => {
                    debug!(service = %service.name, node_count = service.nodes.len(), "New registration");
                    self.entries
                        .insert(service.name.clone(), RegisteredEntry::new(service));
                }
            },
            Intent::Unregister(service) => {
                let (service, leases, known) = match self.entries.remove(&service.name) {
                    Some(mut entry) => {
                        let leases = entry
                            .lease
                            .take()
                            .map(|l| l.id)
                            .into_iter()
                            .chain(entry.stale_lease.take())
                            .collect();
                        (entry.service, leases, true)
                    }
                    None => (service, Vec::new(), false),
                };
                events::service_unregistered(&service.name, known);
                // Finish before the next intent so a re-register of the same
                // name cannot be undone by this removal.
                self.leases.withdraw(&service, leases).await;
            }
        }
    }

    /// Observe renewals of registered entries and attempt to acquire leases
    /// for pending ones. A lost lease is re-acquired in the same sweep.
    ///
    /// Scheduled sweeps retry every pending entry. Sweeps run after the intake
    /// drains skip entries that failed within the last interval.
    async fn sweep(&mut self, kind: Sweep) {
        let now = Instant::now();

        for entry in self.entries.values_mut() {
            if entry.is_registered() {
                self.leases.observe_keep_alive(entry);
            }

            let due = match kind {
                Sweep::Scheduled => !entry.is_registered(),
                Sweep::Drained => entry.due(now),
            };
            if due && self.leases.acquire_and_publish(entry).await.is_err() {
                entry.retry_at = Some(now + self.interval);
            }
        }

        let registered = self.entries.values().filter(|e| e.is_registered()).count();
        metrics::set_registered_entries(registered);
    }

    fn publish_status(&self) {
        let mut status: Vec<RegistrationStatus> =
            self.entries.values().map(RegisteredEntry::status).collect();
        status.sort_by(|a, b| a.service.cmp(&b.service));
        self.status_tx.send_replace(status);
    }

    async fn release(&mut self) {
        for entry in self.entries.values_mut() {
            if self.revoke_on_shutdown {
                self.leases.release(entry).await;
            } else {
                entry.keep_alive = None;
            }
        }
        self.entries.clear();
        self.publish_status();
        metrics::set_registered_entries(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::entry::EntryState;
    use async_trait::async_trait;
    use rollcall_core::{
        keys, KeepAliveStream, KeyValue, Lease, LeaseId, Node, RegistryOptions, WatchStream,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> RegistryConfig {
        let mut config = RegistryConfig::new(
            RegistryOptions::new()
                .with_register_path("/test")
                .with_heartbeat(5)
                .with_timeout(Duration::from_secs(1)),
        );
        config.maintenance_interval = Duration::from_millis(20);
        config
    }

    fn service(name: &str) -> Service {
        Service::new(name, vec![Node::new("n1", "10.0.0.1", 8080)])
    }

    #[test]
    fn test_queue_full_fails_fast() {
        let backend = MemoryBackend::new();
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (_coordinator, handle) = Coordinator::new(Arc::new(backend), &config(), shutdown_rx);

        for i in 0..8 {
            handle.submit(service(&format!("svc-{i}"))).unwrap();
        }
        let err = handle.submit(service("svc-8")).unwrap_err();
        assert_eq!(err, RegistryError::QueueFull("svc-8".into()));
        let err = handle.withdraw(service("svc-0")).unwrap_err();
        assert_eq!(err, RegistryError::QueueFull("svc-0".into()));
    }

    #[test]
    fn test_submit_after_stop_reports_shutdown() {
        let backend = MemoryBackend::new();
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (coordinator, handle) = Coordinator::new(Arc::new(backend), &config(), shutdown_rx);
        drop(coordinator);
        assert_eq!(handle.submit(service("svc-a")).unwrap_err(), RegistryError::ShutDown);
    }

    /// Store that refuses every lease grant and counts the attempts.
    #[derive(Default)]
    struct RefusingBackend {
        grants: AtomicUsize,
    }

    #[async_trait]
    impl Backend for RefusingBackend {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn grant_lease(&self, _ttl: i64) -> Result<Lease> {
            self.grants.fetch_add(1, Ordering::SeqCst);
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>, _lease: LeaseId) -> Result<()> {
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }

        async fn keep_alive(&self, _lease: &Lease) -> Result<KeepAliveStream> {
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }

        async fn get_prefix(&self, _prefix: &str) -> Result<Vec<KeyValue>> {
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }

        async fn watch_prefix(&self, _prefix: &str) -> Result<WatchStream> {
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }

        async fn revoke_lease(&self, _lease: LeaseId) -> Result<()> {
            Err(RegistryError::BackendUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let backend = MemoryBackend::new();
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (mut coordinator, _handle) =
            Coordinator::new(Arc::new(backend.clone()), &config(), shutdown_rx);

        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;
        let lease = coordinator.entries["svc-a"].lease_id().unwrap();

        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;

        assert_eq!(coordinator.entries.len(), 1);
        assert_eq!(coordinator.entries["svc-a"].lease_id(), Some(lease));
        assert_eq!(backend.grant_count(), 1);
    }

    #[tokio::test]
    async fn test_drained_sweep_backs_off_after_failure() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (mut coordinator, _handle) =
            Coordinator::new(Arc::new(backend.clone()), &config(), shutdown_rx);

        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;
        let entry = &coordinator.entries["svc-a"];
        assert_eq!(entry.state(), EntryState::Pending);
        assert!(matches!(entry.last_error(), Some(RegistryError::BackendUnavailable(_))));
        assert!(entry.retry_at.is_some());

        // Intake-driven sweeps inside the interval leave the entry alone.
        backend.set_available(true);
        coordinator.sweep(Sweep::Drained).await;
        assert_eq!(coordinator.entries["svc-a"].state(), EntryState::Pending);

        // The next scheduled sweep always retries.
        coordinator.sweep(Sweep::Scheduled).await;
        assert!(coordinator.entries["svc-a"].is_registered());
        assert!(coordinator.entries["svc-a"].last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_acquire_retried_every_tick() {
        let backend = Arc::new(RefusingBackend::default());
        let mut config = config();
        config.maintenance_interval = Duration::from_millis(100);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (coordinator, handle) = Coordinator::new(backend.clone(), &config, shutdown_rx);
        let task = tokio::spawn(coordinator.run());

        handle.submit(service("svc-a")).unwrap();
        tokio::time::sleep(Duration::from_millis(1050)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();

        // One attempt on intake, then one per tick at 100ms..=1000ms.
        let attempts = backend.grants.load(Ordering::SeqCst);
        assert!((10..=12).contains(&attempts), "attempts = {attempts}");
    }

    #[tokio::test]
    async fn test_lease_loss_reacquired_in_same_sweep() {
        let backend = MemoryBackend::new();
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (mut coordinator, _handle) =
            Coordinator::new(Arc::new(backend.clone()), &config(), shutdown_rx);

        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;
        let first = coordinator.entries["svc-a"].lease_id().unwrap();

        backend.sever_keep_alive(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.sweep(Sweep::Scheduled).await;

        let second = coordinator.entries["svc-a"].lease_id().unwrap();
        assert_ne!(first, second);
        assert!(coordinator.entries["svc-a"].is_registered());

        let key = keys::node_key("/test", "svc-a", &Node::new("n1", "10.0.0.1", 8080));
        assert_eq!(backend.lease_of(&key), Some(second));
    }

    #[tokio::test]
    async fn test_unregister_removes_entry_and_keys() {
        let backend = MemoryBackend::new();
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (mut coordinator, _handle) =
            Coordinator::new(Arc::new(backend.clone()), &config(), shutdown_rx);

        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;
        coordinator.apply(Intent::Unregister(service("svc-a"))).await;

        assert!(coordinator.entries.is_empty());
        assert!(backend.get_prefix("/test/").await.unwrap().is_empty());
        assert!(backend.live_leases().is_empty());
    }

    #[tokio::test]
    async fn test_register_right_after_unregister_keeps_keys() {
        let backend = MemoryBackend::new();
        let (_shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (mut coordinator, _handle) =
            Coordinator::new(Arc::new(backend.clone()), &config(), shutdown_rx);

        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;
        let first = coordinator.entries["svc-a"].lease_id().unwrap();

        coordinator.apply(Intent::Unregister(service("svc-a"))).await;
        coordinator.apply(Intent::Register(service("svc-a"))).await;
        coordinator.sweep(Sweep::Drained).await;
        let second = coordinator.entries["svc-a"].lease_id().unwrap();
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let kvs = backend.get_prefix("/test/svc-a/").await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(backend.lease_of(&kvs[0].key), Some(second));
        assert_eq!(backend.live_leases(), vec![second]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_revokes() {
        let backend = MemoryBackend::new();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (coordinator, handle) =
            Coordinator::new(Arc::new(backend.clone()), &config(), shutdown_rx);
        let mut status = coordinator.subscribe();
        let task = tokio::spawn(coordinator.run());

        handle.submit(service("svc-a")).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| s.iter().any(|e| e.state == EntryState::Registered)),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(backend.live_leases().is_empty());
        assert!(backend.get_prefix("/test/").await.unwrap().is_empty());
    }
}

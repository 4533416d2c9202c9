//! Lease Manager
//!
//! Grants a lease per registered entry, writes one key per node under it,
//! and watches the renewal stream. Every backend call is bounded by the
//! communication timeout so a stalled store cannot hold up the coordinator.

use crate::backend::bounded;
use crate::entry::{EntryState, RegisteredEntry};
use crate::observability::{events, metrics};
use futures::{FutureExt, StreamExt};
use rollcall_core::{
    keys, Backend, KeepAliveStream, Lease, LeaseId, RegistryError, Result, Service,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub struct LeaseManager {
    backend: Arc<dyn Backend>,
    register_path: String,
    heartbeat: i64,
    call_timeout: Duration,
}

impl LeaseManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        register_path: impl Into<String>,
        heartbeat: i64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            register_path: register_path.into(),
            heartbeat,
            call_timeout,
        }
    }

    /// Grant a lease, publish every node of the entry under it and open its
    /// keep-alive stream.
    ///
    /// On failure the entry is left pending with the error recorded. Keys
    /// written before the failing step age out with the orphaned lease.
    pub async fn acquire_and_publish(&self, entry: &mut RegisteredEntry) -> Result<()> {
        entry.demote();

        match self.publish(&entry.service).await {
            Ok((lease, keep_alive)) => {
                entry.state = EntryState::Registered;
                entry.lease = Some(lease);
                entry.keep_alive = Some(keep_alive);
                entry.last_error = None;
                entry.retry_at = None;

                metrics::record_lease_granted();
                events::service_registered(&entry.service.name, lease.id, entry.service.nodes.len());

                // Keys re-put under the new lease survive; whatever is still
                // attached to the old one belonged to nodes since removed.
                if let Some(stale) = entry.stale_lease.take() {
                    if stale != lease.id {
                        self.spawn_revoke(stale);
                    }
                }
                Ok(())
            }
            Err(e) => {
                metrics::record_registration_failure(&entry.service.name);
                events::registration_failed(&entry.service.name, &e);
                entry.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn publish(&self, service: &Service) -> Result<(Lease, KeepAliveStream)> {
        let lease = bounded(
            self.call_timeout,
            "lease grant",
            self.backend.grant_lease(self.heartbeat),
        )
        .await?;
        trace!(service = %service.name, lease_id = lease.id.0, ttl = lease.ttl, "Lease granted");

        for node in &service.nodes {
            let key = keys::node_key(&self.register_path, &service.name, node);
            let value = serde_json::to_vec(node)?;
            bounded(
                self.call_timeout,
                "put",
                self.backend.put(&key, value, lease.id),
            )
            .await?;
            debug!(key = %key, lease_id = lease.id.0, "Node published");
        }

        let keep_alive = bounded(
            self.call_timeout,
            "keep-alive",
            self.backend.keep_alive(&lease),
        )
        .await?;

        Ok((lease, keep_alive))
    }

    /// Drain the renewal acknowledgements that are already available.
    ///
    /// Returns `false` and demotes the entry to pending when the stream has
    /// ended, failed, or answered with a zero TTL. Never waits for an item.
    pub fn observe_keep_alive(&self, entry: &mut RegisteredEntry) -> bool {
        let Some(lease) = entry.lease else {
            entry.demote();
            return false;
        };

        let reason = match entry.keep_alive.as_mut() {
            None => "no keep-alive stream".to_string(),
            Some(stream) => loop {
                match stream.next().now_or_never() {
                    None => return true,
                    Some(Some(Ok(ack))) if ack.is_alive() => {
                        trace!(
                            service = %entry.service.name,
                            lease_id = ack.id.0,
                            ttl = ack.ttl,
                            "Keep-alive OK"
                        );
                    }
                    Some(Some(Ok(_))) => break "lease expired".to_string(),
                    Some(Some(Err(e))) => break e.to_string(),
                    Some(None) => break "keep-alive stream closed".to_string(),
                }
            },
        };

        self.lose(entry, lease.id, reason)
    }

    fn lose(&self, entry: &mut RegisteredEntry, lease: LeaseId, reason: String) -> bool {
        metrics::record_lease_lost(&entry.service.name);
        events::lease_lost(&entry.service.name, lease, &reason);
        entry.demote();
        entry.last_error = Some(RegistryError::LeaseLost(lease.0));
        false
    }

    /// Remove what `service` published.
    ///
    /// Held leases are revoked, which drops exactly the keys still attached
    /// to them; a key already re-put under a newer lease survives. Node keys
    /// are deleted by name only when no lease was held. Failures are logged
    /// and left to lease expiry.
    pub async fn withdraw(&self, service: &Service, leases: Vec<LeaseId>) {
        if leases.is_empty() {
            for node in &service.nodes {
                let key = keys::node_key(&self.register_path, &service.name, node);
                match bounded(self.call_timeout, "delete", self.backend.delete(&key)).await {
                    Ok(()) => debug!(key = %key, "Node key deleted"),
                    Err(e) => warn!(key = %key, error = %e, "Failed to delete node key"),
                }
            }
            return;
        }

        for lease in leases {
            let revoked = bounded(
                self.call_timeout,
                "lease revoke",
                self.backend.revoke_lease(lease),
            )
            .await;
            match revoked {
                Ok(()) => debug!(service = %service.name, lease_id = lease.0, "Lease revoked"),
                Err(e) => warn!(
                    service = %service.name,
                    lease_id = lease.0,
                    error = %e,
                    "Failed to revoke lease, keys expire with its TTL"
                ),
            }
        }
    }

    fn spawn_revoke(&self, lease: LeaseId) {
        let backend = self.backend.clone();
        let timeout = self.call_timeout;
        tokio::spawn(async move {
            match bounded(timeout, "lease revoke", backend.revoke_lease(lease)).await {
                Ok(()) => debug!(lease_id = lease.0, "Superseded lease revoked"),
                Err(e) => debug!(lease_id = lease.0, error = %e, "Superseded lease revoke failed"),
            }
        });
    }

    /// Revoke the entry's leases in place; used on shutdown.
    pub async fn release(&self, entry: &mut RegisteredEntry) {
        entry.keep_alive = None;
        let current = entry.lease.take().map(|l| l.id);
        let leases = current.into_iter().chain(entry.stale_lease.take());

        for lease in leases {
            let revoked = bounded(
                self.call_timeout,
                "lease revoke",
                self.backend.revoke_lease(lease),
            )
            .await;
            match revoked {
                Ok(()) => debug!(service = %entry.service.name, lease_id = lease.0, "Lease revoked"),
                Err(e) => warn!(
                    service = %entry.service.name,
                    lease_id = lease.0,
                    error = %e,
                    "Failed to revoke lease"
                ),
            }
        }
        entry.state = EntryState::Pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use rollcall_core::Node;

    const ROOT: &str = "/rollcall/services";

    fn manager(backend: &MemoryBackend) -> LeaseManager {
        LeaseManager::new(
            Arc::new(backend.clone()),
            ROOT,
            5,
            Duration::from_secs(1),
        )
    }

    fn service() -> Service {
        Service::new(
            "svc-a",
            vec![
                Node::new("n1", "10.0.0.1", 8080),
                Node::new("n2", "10.0.0.2", 8080),
            ],
        )
    }

    #[tokio::test]
    async fn test_acquire_publishes_every_node() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let mut entry = RegisteredEntry::new(service());

        leases.acquire_and_publish(&mut entry).await.unwrap();
        assert!(entry.is_registered());
        let lease = entry.lease_id().unwrap();

        let kvs = backend.get_prefix(&keys::service_prefix(ROOT, "svc-a")).await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].key, "/rollcall/services/svc-a/10.0.0.1:8080");
        let node: Node = serde_json::from_slice(&kvs[0].value).unwrap();
        assert_eq!(node, Node::new("n1", "10.0.0.1", 8080));
        assert_eq!(backend.lease_of(&kvs[1].key), Some(lease));
    }

    #[tokio::test]
    async fn test_acquire_failure_leaves_entry_pending() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let leases = manager(&backend);
        let mut entry = RegisteredEntry::new(service());

        let err = leases.acquire_and_publish(&mut entry).await.unwrap_err();
        assert!(matches!(err, RegistryError::BackendUnavailable(_)));
        assert_eq!(entry.state(), EntryState::Pending);
        assert_eq!(entry.last_error(), Some(&err));
        assert!(entry.lease_id().is_none());
    }

    #[tokio::test]
    async fn test_observe_healthy_stream() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let mut entry = RegisteredEntry::new(service());
        leases.acquire_and_publish(&mut entry).await.unwrap();

        assert!(leases.observe_keep_alive(&mut entry));
        assert!(entry.is_registered());
    }

    #[tokio::test]
    async fn test_observe_closed_stream_demotes() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let mut entry = RegisteredEntry::new(service());
        leases.acquire_and_publish(&mut entry).await.unwrap();
        let lease = entry.lease_id().unwrap();

        backend.sever_keep_alive(lease);
        // Let the renewal task observe the stop and close its channel.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!leases.observe_keep_alive(&mut entry));
        assert_eq!(entry.state(), EntryState::Pending);
        assert_eq!(entry.last_error(), Some(&RegistryError::LeaseLost(lease.0)));
        assert_eq!(entry.stale_lease, Some(lease));
    }

    #[tokio::test]
    async fn test_reacquire_revokes_superseded_lease() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let mut entry = RegisteredEntry::new(service());
        leases.acquire_and_publish(&mut entry).await.unwrap();
        let first = entry.lease_id().unwrap();

        // Shrink the node set; n2's key stays on the first lease.
        entry.replace_service(Service::new("svc-a", vec![Node::new("n1", "10.0.0.1", 8080)]));
        leases.acquire_and_publish(&mut entry).await.unwrap();
        let second = entry.lease_id().unwrap();
        assert_ne!(first, second);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let kvs = backend.get_prefix(&keys::service_prefix(ROOT, "svc-a")).await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(backend.live_leases(), vec![second]);
    }

    #[tokio::test]
    async fn test_withdraw_deletes_keys() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let mut entry = RegisteredEntry::new(service());
        leases.acquire_and_publish(&mut entry).await.unwrap();
        let lease = entry.lease_id().unwrap();

        leases.withdraw(&service(), vec![lease]).await;
        assert!(backend.get_prefix(ROOT).await.unwrap().is_empty());
        assert!(backend.live_leases().is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_keeps_keys_republished_under_newer_lease() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let mut old = RegisteredEntry::new(service());
        leases.acquire_and_publish(&mut old).await.unwrap();
        let old_lease = old.lease_id().unwrap();

        let mut new = RegisteredEntry::new(service());
        leases.acquire_and_publish(&mut new).await.unwrap();

        leases.withdraw(&service(), vec![old_lease]).await;
        let kvs = backend.get_prefix(&keys::service_prefix(ROOT, "svc-a")).await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(backend.lease_of(&kvs[0].key), new.lease_id());
    }

    #[tokio::test]
    async fn test_withdraw_without_lease_deletes_by_name() {
        let backend = MemoryBackend::new();
        let leases = manager(&backend);
        let node = Node::new("n1", "10.0.0.1", 8080);
        backend.put_static(
            &keys::node_key(ROOT, "svc-a", &node),
            serde_json::to_vec(&node).unwrap(),
        );

        leases.withdraw(&service(), Vec::new()).await;
        assert!(backend.get_prefix(ROOT).await.unwrap().is_empty());
    }
}

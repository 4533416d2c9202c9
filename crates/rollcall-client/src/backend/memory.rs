//! In-memory coordination store
//!
//! Behaves like a single etcd member for the operations the registry uses:
//! leases expire after their TTL unless renewed, keys attached to an expired
//! or revoked lease disappear, and prefix watches see puts and deletes.
//! Expiry is evaluated lazily on every operation.
//!
//! A few hooks let tests inject faults: severing a keep-alive stream,
//! toggling availability, and delaying prefix reads.

use super::receiver_stream;
use crate::config::renewal_interval;
use async_trait::async_trait;
use parking_lot::Mutex;
use rollcall_core::{
    Backend, BackendFactory, KeepAliveAck, KeepAliveStream, KeyValue, Lease, LeaseId,
    RegistryError, RegistryOptions, Result, WatchEvent, WatchEventKind, WatchStream,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace};

pub const PLUGIN_NAME: &str = "memory";

struct LeaseState {
    ttl: i64,
    expires_at: Instant,
    /// Dropping these ends the lease's keep-alive tasks.
    keepalive_stops: Vec<oneshot::Sender<()>>,
}

struct StoredValue {
    value: Vec<u8>,
    lease: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

#[derive(Default)]
struct State {
    next_lease: i64,
    leases: HashMap<i64, LeaseState>,
    keys: BTreeMap<String, StoredValue>,
    watchers: Vec<Watcher>,
}

impl State {
    fn notify(&mut self, kind: WatchEventKind, key: &str) {
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx
                .send(Ok(WatchEvent {
                    kind,
                    key: key.to_string(),
                }))
                .is_ok()
        });
    }

    fn drop_lease(&mut self, id: i64) -> bool {
        if self.leases.remove(&id).is_none() {
            return false;
        }
        let attached: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, v)| v.lease == id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in attached {
            self.keys.remove(&key);
            self.notify(WatchEventKind::Delete, &key);
        }
        true
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            trace!(lease_id = id, "Lease expired");
            self.drop_lease(id);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    available: AtomicBool,
    fetches: AtomicUsize,
    grants: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    keepalive_interval: Mutex<Option<Duration>>,
}

/// Shared handle to one in-memory store; clones see the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_lease: 1,
                    ..State::default()
                }),
                available: AtomicBool::new(true),
                fetches: AtomicUsize::new(0),
                grants: AtomicUsize::new(0),
                fetch_delay: Mutex::new(Duration::ZERO),
                keepalive_interval: Mutex::new(None),
            }),
        }
    }

    /// Renew leases at a fixed period instead of TTL/3.
    pub fn with_keepalive_interval(self, interval: Duration) -> Self {
        *self.inner.keepalive_interval.lock() = Some(interval);
        self
    }

    /// While unavailable every call fails with `BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Delay applied to each prefix read before the data is read.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.inner.fetch_delay.lock() = delay;
    }

    /// Number of prefix reads served so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Number of leases granted so far.
    pub fn grant_count(&self) -> usize {
        self.inner.grants.load(Ordering::SeqCst)
    }

    /// End every keep-alive stream of `lease` without touching the lease
    /// itself, which then expires after its TTL.
    pub fn sever_keep_alive(&self, lease: LeaseId) {
        let mut state = self.inner.state.lock();
        if let Some(l) = state.leases.get_mut(&lease.0) {
            debug!(lease_id = lease.0, "Severing keep-alive streams");
            l.keepalive_stops.clear();
        }
    }

    /// Lease a key is currently attached to.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        state.keys.get(key).map(|v| LeaseId(v.lease))
    }

    /// Leases that have not expired or been revoked.
    pub fn live_leases(&self) -> Vec<LeaseId> {
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        let mut ids: Vec<LeaseId> = state.leases.keys().map(|id| LeaseId(*id)).collect();
        ids.sort();
        ids
    }

    /// Write a key without a lease, like an operator seeding the store.
    pub fn put_static(&self, key: &str, value: Vec<u8>) {
        let mut state = self.inner.state.lock();
        state.keys.insert(key.to_string(), StoredValue { value, lease: 0 });
        state.notify(WatchEventKind::Put, key);
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::BackendUnavailable(
                "memory backend marked unavailable".into(),
            ))
        }
    }

    fn renew(&self, lease: i64) -> Result<KeepAliveAck> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.purge_expired(now);
        let ttl = match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = now + Duration::from_secs(l.ttl as u64);
                l.ttl
            }
            None => 0,
        };
        Ok(KeepAliveAck {
            id: LeaseId(lease),
            ttl,
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn grant_lease(&self, ttl: i64) -> Result<Lease> {
        self.check_available()?;
        if ttl <= 0 {
            return Err(RegistryError::BackendUnavailable(format!(
                "invalid lease ttl {ttl}"
            )));
        }
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.purge_expired(now);
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: now + Duration::from_secs(ttl as u64),
                keepalive_stops: Vec::new(),
            },
        );
        self.inner.grants.fetch_add(1, Ordering::SeqCst);
        Ok(Lease {
            id: LeaseId(id),
            ttl,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        if !state.leases.contains_key(&lease.0) {
            return Err(RegistryError::BackendUnavailable(format!(
                "lease {lease} not found"
            )));
        }
        state.keys.insert(
            key.to_string(),
            StoredValue {
                value,
                lease: lease.0,
            },
        );
        state.notify(WatchEventKind::Put, key);
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream> {
        self.check_available()?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        {
            let mut state = self.inner.state.lock();
            state.purge_expired(Instant::now());
            let l = state.leases.get_mut(&lease.id.0).ok_or_else(|| {
                RegistryError::BackendUnavailable(format!("lease {} not found", lease.id))
            })?;
            l.keepalive_stops.push(stop_tx);
        }

        let period = renewal_interval(lease.ttl, *self.inner.keepalive_interval.lock());
        let (tx, rx) = mpsc::channel(4);
        let backend = self.clone();
        let id = lease.id.0;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut stop_rx => break,
                    _ = tx.closed() => break,
                }

                let ack = backend.renew(id);
                let alive = matches!(&ack, Ok(a) if a.is_alive());
                if tx.send(ack).await.is_err() || !alive {
                    break;
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_available()?;
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        Ok(state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
            })
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        self.check_available()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.state.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx))))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        if state.keys.remove(key).is_some() {
            state.notify(WatchEventKind::Delete, key);
        }
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        state.purge_expired(Instant::now());
        if state.drop_lease(lease.0) {
            Ok(())
        } else {
            Err(RegistryError::BackendUnavailable(format!(
                "lease {lease} not found"
            )))
        }
    }
}

/// Hands out the same [`MemoryBackend`] to every connect.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    backend: MemoryBackend,
}

impl MemoryFactory {
    pub fn new(backend: MemoryBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl BackendFactory for MemoryFactory {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn connect(&self, _options: &RegistryOptions) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(self.backend.clone()))
    }
}

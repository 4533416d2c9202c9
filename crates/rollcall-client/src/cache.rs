//! Discovery Cache
//!
//! Lookups read an immutable [`Snapshot`] through `ArcSwap`, so a reader
//! never waits on a writer. A miss starts at most one backend fetch per
//! service; concurrent lookups for the same name await the same shared
//! future and observe the same result.
//!
//! Failed fetches and empty results are not cached. Entries stay until
//! explicitly invalidated, either by the caller or by the optional prefix
//! watch.

use crate::backend::bounded;
use crate::observability::{events, metrics};
use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use rollcall_core::{keys, Backend, Node, RegistryError, Result, WatchEventKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Flight = Shared<BoxFuture<'static, Result<Arc<Vec<Node>>>>>;

/// Immutable view of every cached service.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    services: HashMap<String, Arc<Vec<Node>>>,
    version: u64,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<Arc<Vec<Node>>> {
        self.services.get(name).cloned()
    }

    /// Incremented on every publish.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

struct CacheInner {
    backend: Arc<dyn Backend>,
    register_path: String,
    call_timeout: Duration,
    snapshot: ArcSwap<Snapshot>,
    flights: Mutex<HashMap<String, Flight>>,
}

#[derive(Clone)]
pub struct DiscoveryCache {
    inner: Arc<CacheInner>,
}

impl DiscoveryCache {
    pub fn new(
        backend: Arc<dyn Backend>,
        register_path: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                register_path: register_path.into(),
                call_timeout,
                snapshot: ArcSwap::from_pointee(Snapshot::default()),
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Nodes of `name`, from the snapshot or a single-flight backend fetch.
    pub async fn get_service(&self, name: &str) -> Result<Arc<Vec<Node>>> {
        if let Some(nodes) = self.inner.snapshot.load().get(name) {
            metrics::record_cache_hit();
            return Ok(nodes);
        }
        metrics::record_cache_miss();

        let flight = {
            let mut flights = self.inner.flights.lock();
            // A fetch may have published between the first check and the lock.
            if let Some(nodes) = self.inner.snapshot.load().get(name) {
                return Ok(nodes);
            }
            flights
                .entry(name.to_string())
                .or_insert_with(|| self.start_flight(name))
                .clone()
        };

        flight.await
    }

    fn start_flight(&self, name: &str) -> Flight {
        let inner = self.inner.clone();
        let name = name.to_string();

        async move {
            let result = fetch(&inner, &name).await;
            if let Ok(nodes) = &result {
                let version = publish(&inner, &name, nodes.clone());
                events::cache_refreshed(&name, nodes.len(), version);
            }
            inner.flights.lock().remove(&name);
            result
        }
        .boxed()
        .shared()
    }

    /// Drop `name` from the snapshot so the next lookup fetches again.
    pub fn invalidate(&self, name: &str) {
        let mut removed = false;
        let next = self.inner.snapshot.rcu(|current| {
            removed = current.services.contains_key(name);
            if !removed {
                return Arc::clone(current);
            }
            let mut services = current.services.clone();
            services.remove(name);
            Arc::new(Snapshot {
                services,
                version: current.version + 1,
            })
        });
        if removed {
            // `rcu` returns the snapshot it replaced.
            let version = next.version + 1;
            metrics::set_snapshot_version(version);
            events::cache_invalidated(name, version);
        }
    }

    pub fn invalidate_all(&self) {
        let previous = self.inner.snapshot.rcu(|current| Snapshot {
            services: HashMap::new(),
            version: current.version + 1,
        });
        let version = previous.version + 1;
        metrics::set_snapshot_version(version);
        debug!(version, dropped = previous.len(), "Discovery cache cleared");
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.snapshot.load().version
    }

    /// Watch the registry root and invalidate services as their keys change.
    ///
    /// A failed or closed watch is reopened after `reconnect_delay`; the whole
    /// cache is cleared on reopen since changes may have been missed.
    pub fn spawn_invalidation(&self, reconnect_delay: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        let root = keys::root_prefix(&self.inner.register_path);

        tokio::spawn(async move {
            let mut reconnecting = false;
            loop {
                let opened = bounded(
                    cache.inner.call_timeout,
                    "watch",
                    cache.inner.backend.watch_prefix(&root),
                )
                .await;

                match opened {
                    Ok(mut stream) => {
                        info!(prefix = %root, "Started watching registry for changes");
                        if reconnecting {
                            cache.invalidate_all();
                        }

                        while let Some(event) = stream.next().await {
                            match event {
                                Ok(event) => {
                                    let Some(service) =
                                        keys::service_of(&cache.inner.register_path, &event.key)
                                    else {
                                        continue;
                                    };
                                    debug!(
                                        service = %service,
                                        key = %event.key,
                                        deleted = event.kind == WatchEventKind::Delete,
                                        "Registry change observed"
                                    );
                                    cache.invalidate(service);
                                }
                                Err(e) => {
                                    warn!(error = %e, "Watch error, reconnecting...");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(prefix = %root, error = %e, "Failed to open watch"),
                }

                reconnecting = true;
                tokio::time::sleep(reconnect_delay).await;
            }
        })
    }
}

async fn fetch(inner: &CacheInner, name: &str) -> Result<Arc<Vec<Node>>> {
    let prefix = keys::service_prefix(&inner.register_path, name);
    metrics::record_backend_fetch();

    let kvs = bounded(
        inner.call_timeout,
        "get",
        inner.backend.get_prefix(&prefix),
    )
    .await?;

    let nodes: Vec<Node> = kvs
        .iter()
        .filter_map(|kv| match serde_json::from_slice::<Node>(&kv.value) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping malformed node record");
                None
            }
        })
        .collect();

    if nodes.is_empty() {
        return Err(RegistryError::NotFound(name.to_string()));
    }
    Ok(Arc::new(nodes))
}

/// Copy-on-write insert of `name`; returns the new snapshot version.
fn publish(inner: &CacheInner, name: &str, nodes: Arc<Vec<Node>>) -> u64 {
    let previous = inner.snapshot.rcu(|current| {
        let mut services = current.services.clone();
        services.insert(name.to_string(), nodes.clone());
        Snapshot {
            services,
            version: current.version + 1,
        }
    });
    let version = previous.version + 1;
    metrics::set_snapshot_version(version);
    version
}

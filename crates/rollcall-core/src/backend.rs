//! Coordination store contract
//!
//! The registry only needs a small slice of what a store like etcd offers:
//! leases with keep-alive, puts attached to a lease, prefix reads, prefix
//! watches, and deletion.

use crate::error::Result;
use crate::options::RegistryOptions;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// Backend-issued lease handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub i64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A granted lease and the TTL it was granted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: i64,
}

/// One renewal acknowledgement. A TTL of zero means the lease no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub id: LeaseId,
    pub ttl: i64,
}

impl KeepAliveAck {
    pub fn is_alive(&self) -> bool {
        self.ttl > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

/// Renewal acknowledgements; the stream ending means renewal has stopped.
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveAck>>;

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Plugin name this backend was created from.
    fn name(&self) -> &str;

    async fn grant_lease(&self, ttl: i64) -> Result<Lease>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()>;

    /// Open a renewal stream for `lease`. Renewal runs for as long as the
    /// returned stream is held.
    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Revoke a lease, deleting every key still attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;
}

/// Creates a connected backend from initialization options.
#[async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn connect(&self, options: &RegistryOptions) -> Result<Arc<dyn Backend>>;
}

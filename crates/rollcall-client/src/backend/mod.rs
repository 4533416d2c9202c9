//! Backend adapters
//!
//! - `etcd`: etcd v3 through `etcd-client`
//! - `memory`: in-process store with lease expiry, for tests and single-node use

mod etcd;
mod memory;

pub use etcd::{EtcdBackend, EtcdFactory};
pub use memory::{MemoryBackend, MemoryFactory};

use crate::config::RegistryConfig;
use futures::stream::{BoxStream, StreamExt};
use rollcall_core::{BackendPlugins, RegistryError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Plugin table with the `etcd` and `memory` backends registered.
pub fn default_plugins(config: &RegistryConfig) -> BackendPlugins {
    let plugins = BackendPlugins::new();
    // Fresh table, names cannot collide.
    let _ = plugins.register(Arc::new(EtcdFactory::from_config(config)));
    let _ = plugins.register(Arc::new(MemoryFactory::new(MemoryBackend::new())));
    plugins
}

/// Adapt a channel receiver fed by a background task into a boxed stream.
pub(crate) fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

/// Run one backend call under `timeout`; expiry maps to `BackendUnavailable`.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    operation: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::BackendUnavailable(format!(
            "{operation} timed out after {timeout:?}"
        ))),
    }
}

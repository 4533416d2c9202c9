//! Etcd Operations
//!
//! Handles all etcd-specific operations including connection, lease
//! management, keep-alive renewal and prefix watches.

use super::receiver_stream;
use crate::config::{effective_timeout, renewal_interval, RegistryConfig};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use rollcall_core::{
    Backend, BackendFactory, KeepAliveAck, KeepAliveStream, KeyValue, Lease, LeaseId,
    RegistryError, RegistryOptions, Result, WatchEvent, WatchEventKind, WatchStream,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

pub const PLUGIN_NAME: &str = "etcd";

/// Etcd-backed coordination store
#[derive(Clone)]
pub struct EtcdBackend {
    client: Client,
    keepalive_interval: Option<Duration>,
}

impl EtcdBackend {
    pub fn new(client: Client, keepalive_interval: Option<Duration>) -> Self {
        Self {
            client,
            keepalive_interval,
        }
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn grant_lease(&self, ttl: i64) -> Result<Lease> {
        let resp = self
            .client
            .clone()
            .lease_grant(ttl, None)
            .await
            .map_err(RegistryError::backend)?;
        trace!(lease_id = resp.id(), ttl = resp.ttl(), "Lease granted");
        Ok(Lease {
            id: LeaseId(resp.id()),
            ttl: resp.ttl(),
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let options = PutOptions::new().with_lease(lease.0);
        self.client
            .clone()
            .put(key, value, Some(options))
            .await
            .map_err(RegistryError::backend)?;
        Ok(())
    }

    /// Spawns a renewal task that sends a keep-alive every interval and
    /// forwards each acknowledgement. The task ends when the returned stream
    /// is dropped or renewal fails.
    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream> {
        let (mut keeper, mut stream) = self
            .client
            .clone()
            .lease_keep_alive(lease.id.0)
            .await
            .map_err(RegistryError::backend)?;

        let (tx, rx) = mpsc::channel(4);
        let period = renewal_interval(lease.ttl, self.keepalive_interval);
        let lease_id = lease.id.0;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = tx.closed() => {
                        trace!(lease_id = lease_id, "Keep-alive released");
                        break;
                    }
                }

                if let Err(e) = keeper.keep_alive().await {
                    error!(lease_id = lease_id, error = %e, "Keep-alive send failed");
                    let _ = tx.send(Err(RegistryError::backend(e))).await;
                    break;
                }

                let ack = match stream.message().await {
                    Ok(Some(resp)) => KeepAliveAck {
                        id: LeaseId(resp.id()),
                        ttl: resp.ttl(),
                    },
                    Ok(None) => {
                        warn!(lease_id = lease_id, "Keep-alive stream closed");
                        break;
                    }
                    Err(e) => {
                        error!(lease_id = lease_id, error = %e, "Keep-alive failed");
                        let _ = tx.send(Err(RegistryError::backend(e))).await;
                        break;
                    }
                };

                trace!(lease_id = lease_id, ttl = ack.ttl, "Keep-alive OK");
                let alive = ack.is_alive();
                if tx.send(Ok(ack)).await.is_err() || !alive {
                    break;
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(RegistryError::backend)?;

        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match kv.key_str() {
                Ok(key) => kvs.push(KeyValue {
                    key: key.to_string(),
                    value: kv.value().to_vec(),
                }),
                Err(e) => warn!(error = %e, "Skipping non UTF-8 key"),
            }
        }
        Ok(kvs)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (watcher, mut stream) = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(RegistryError::backend)?;

        let (tx, rx) = mpsc::channel(64);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let _watcher = watcher;
            debug!(prefix = %prefix, "Watch stream established");
            loop {
                let resp = tokio::select! {
                    resp = stream.message() => resp,
                    _ = tx.closed() => break,
                };

                let resp = match resp {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(RegistryError::backend(e))).await;
                        break;
                    }
                };

                if resp.canceled() {
                    warn!(prefix = %prefix, "Watch stream canceled");
                    let _ = tx
                        .send(Err(RegistryError::BackendUnavailable(
                            "watch canceled".into(),
                        )))
                        .await;
                    break;
                }

                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let kind = match event.event_type() {
                        EventType::Put => WatchEventKind::Put,
                        EventType::Delete => WatchEventKind::Delete,
                    };
                    let event = WatchEvent {
                        kind,
                        key: key.to_string(),
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .clone()
            .delete(key, None)
            .await
            .map_err(RegistryError::backend)?;
        Ok(())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.client
            .clone()
            .lease_revoke(lease.0)
            .await
            .map_err(RegistryError::backend)?;
        Ok(())
    }
}

/// Builds [`EtcdBackend`]s, connecting with exponential backoff.
#[derive(Debug, Clone)]
pub struct EtcdFactory {
    backoff_initial: Duration,
    backoff_max: Duration,
    backoff_max_elapsed: Duration,
    backoff_multiplier: f64,
    keepalive_interval: Option<Duration>,
}

impl EtcdFactory {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            backoff_initial: config.connect_backoff_initial,
            backoff_max: config.connect_backoff_max,
            backoff_max_elapsed: config.connect_backoff_max_elapsed,
            backoff_multiplier: config.connect_backoff_multiplier,
            keepalive_interval: config.keepalive_interval,
        }
    }

    /// Connect to etcd with exponential backoff
    pub async fn connect_client(&self, options: &RegistryOptions) -> Result<Client> {
        if options.addresses.is_empty() {
            return Err(RegistryError::BackendUnavailable(
                "no etcd addresses configured".into(),
            ));
        }

        let timeout = effective_timeout(options.timeout);
        let backoff = ExponentialBackoff {
            initial_interval: self.backoff_initial,
            max_interval: self.backoff_max,
            max_elapsed_time: Some(self.backoff_max_elapsed),
            multiplier: self.backoff_multiplier,
            ..Default::default()
        };

        let endpoints = &options.addresses;
        retry(backoff, || {
            let connect_options = ConnectOptions::new()
                .with_connect_timeout(timeout)
                .with_timeout(timeout);
            async move {
                match Client::connect(endpoints, Some(connect_options)).await {
                    Ok(client) => {
                        debug!(endpoints = ?endpoints, "Connected to etcd");
                        Ok(client)
                    }
                    Err(e) => {
                        warn!(error = %e, "etcd connection failed, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await
        .map_err(|e| {
            RegistryError::BackendUnavailable(format!(
                "failed to connect to etcd after retries: {e}"
            ))
        })
    }
}

impl Default for EtcdFactory {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

#[async_trait]
impl BackendFactory for EtcdFactory {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn connect(&self, options: &RegistryOptions) -> Result<Arc<dyn Backend>> {
        let client = self.connect_client(options).await?;
        Ok(Arc::new(EtcdBackend::new(client, self.keepalive_interval)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_address_list_fails_fast() {
        let factory = EtcdFactory::default();
        let err = factory
            .connect(&RegistryOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::BackendUnavailable(_)));
    }

    #[test]
    fn test_factory_name() {
        assert_eq!(BackendFactory::name(&EtcdFactory::default()), "etcd");
    }
}

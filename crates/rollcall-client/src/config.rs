//! Registry Configuration
//!
//! Backend options plus the tuning knobs of the coordinator loop, the
//! keep-alive renewal and the connect retry, with environment variable
//! overrides.

use rollcall_core::RegistryOptions;
use std::time::Duration;

/// Per-call bound used when the options leave `timeout` at zero.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Registry configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Backend options (env: ETCD_ENDPOINTS, REGISTRY_PATH, REGISTRY_HEARTBEAT,
    /// REGISTRY_TIMEOUT_MS)
    pub options: RegistryOptions,

    // Coordinator settings
    /// Capacity of the registration intake queue
    pub intake_capacity: usize,

    /// Pace of maintenance sweeps (env: REGISTRY_MAINTENANCE_INTERVAL_MS)
    pub maintenance_interval: Duration,

    /// Revoke held leases when the registry shuts down
    pub revoke_on_shutdown: bool,

    // Discovery settings
    /// Drop cached services when the backend reports changes under the root
    pub watch_invalidation: bool,

    /// Delay before re-opening a failed invalidation watch
    pub watch_reconnect_delay: Duration,

    // Keep-alive settings
    /// Interval between lease renewals; `None` renews every TTL/3
    pub keepalive_interval: Option<Duration>,

    // Connect backoff settings
    /// Initial interval for backend connection retry
    pub connect_backoff_initial: Duration,

    /// Maximum interval for backend connection retry
    pub connect_backoff_max: Duration,

    /// Maximum elapsed time for backend connection retries
    pub connect_backoff_max_elapsed: Duration,

    /// Multiplier for connection backoff
    pub connect_backoff_multiplier: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            options: RegistryOptions::new()
                .with_addresses(["http://127.0.0.1:2379"])
                .with_timeout(DEFAULT_CALL_TIMEOUT)
                .with_register_path("/rollcall/services")
                .with_heartbeat(10),

            intake_capacity: 8,
            maintenance_interval: Duration::from_millis(500),
            revoke_on_shutdown: true,

            watch_invalidation: false,
            watch_reconnect_delay: Duration::from_secs(5),

            keepalive_interval: None,

            connect_backoff_initial: Duration::from_secs(1),
            connect_backoff_max: Duration::from_secs(10),
            connect_backoff_max_elapsed: Duration::from_secs(60),
            connect_backoff_multiplier: 2.0,
        }
    }
}

impl RegistryConfig {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.options.addresses = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(path) = std::env::var("REGISTRY_PATH") {
            config.options.register_path = path;
        }

        if let Ok(heartbeat) = std::env::var("REGISTRY_HEARTBEAT") {
            if let Ok(parsed) = heartbeat.parse::<i64>() {
                config.options.heartbeat = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("REGISTRY_TIMEOUT_MS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                config.options.timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(interval) = std::env::var("REGISTRY_MAINTENANCE_INTERVAL_MS") {
            if let Ok(parsed) = interval.parse::<u64>() {
                config.maintenance_interval = Duration::from_millis(parsed);
            }
        }

        config
    }

    /// Bound applied to every backend call.
    pub fn call_timeout(&self) -> Duration {
        effective_timeout(self.options.timeout)
    }
}

pub(crate) fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_CALL_TIMEOUT
    } else {
        timeout
    }
}

/// Renewal period for a lease of `ttl` seconds.
pub(crate) fn renewal_interval(ttl: i64, configured: Option<Duration>) -> Duration {
    configured.unwrap_or_else(|| {
        let ttl_ms = (ttl.max(1) as u64) * 1000;
        Duration::from_millis((ttl_ms / 3).max(100))
    })
}

//! Backend initialization options.

use std::time::Duration;

/// Options handed to a backend factory at initialization.
///
/// Unset fields keep their zero value; an empty address list makes network
/// backends fail fast on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Coordination store endpoints
    pub addresses: Vec<String>,
    /// Communication timeout per backend call
    pub timeout: Duration,
    /// Root key under which every service key is written
    /// (e.g. `/rollcall/services` gives `/rollcall/services/svc-a/10.0.0.1:8080`)
    pub register_path: String,
    /// Lease TTL in seconds
    pub heartbeat: i64,
}

impl RegistryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_register_path(mut self, path: impl Into<String>) -> Self {
        self.register_path = path.into();
        self
    }

    pub fn with_heartbeat(mut self, seconds: i64) -> Self {
        self.heartbeat = seconds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zero_valued() {
        let opts = RegistryOptions::default();
        assert!(opts.addresses.is_empty());
        assert_eq!(opts.timeout, Duration::ZERO);
        assert_eq!(opts.register_path, "");
        assert_eq!(opts.heartbeat, 0);
    }

    #[test]
    fn test_builder() {
        let opts = RegistryOptions::new()
            .with_addresses(["http://127.0.0.1:2379"])
            .with_timeout(Duration::from_secs(2))
            .with_register_path("/rollcall")
            .with_heartbeat(5);
        assert_eq!(opts.addresses, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(opts.timeout, Duration::from_secs(2));
        assert_eq!(opts.register_path, "/rollcall");
        assert_eq!(opts.heartbeat, 5);
    }
}

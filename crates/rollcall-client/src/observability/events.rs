//! Structured Events
//!
//! Registry lifecycle events with consistent field names. Each helper emits
//! one log record tagged with `event_type`.
//!
//! Event types:
//! - `service_registered` - lease granted and every node key written
//! - `registration_failed` - acquire-and-publish failed, entry stays pending
//! - `lease_lost` - keep-alive stream reported the lease gone
//! - `service_unregistered` - entry removed, backend keys being deleted
//! - `cache_refreshed` - discovery snapshot republished after a fetch
//! - `cache_invalidated` - a service dropped from the discovery snapshot

use rollcall_core::{LeaseId, RegistryError};
use tracing::{debug, info, warn};

pub fn service_registered(service: &str, lease_id: LeaseId, node_count: usize) {
    info!(
        event_type = "service_registered",
        service = %service,
        lease_id = lease_id.0,
        node_count = node_count,
        "Service registered"
    );
}

pub fn registration_failed(service: &str, error: &RegistryError) {
    warn!(
        event_type = "registration_failed",
        service = %service,
        error = %error,
        "Service registration failed, will retry"
    );
}

pub fn lease_lost(service: &str, lease_id: LeaseId, reason: &str) {
    warn!(
        event_type = "lease_lost",
        service = %service,
        lease_id = lease_id.0,
        reason = %reason,
        "Lease lost, re-registering"
    );
}

pub fn service_unregistered(service: &str, known: bool) {
    info!(
        event_type = "service_unregistered",
        service = %service,
        known = known,
        "Service unregistered"
    );
}

pub fn cache_refreshed(service: &str, node_count: usize, version: u64) {
    debug!(
        event_type = "cache_refreshed",
        service = %service,
        node_count = node_count,
        version = version,
        "Discovery cache refreshed"
    );
}

pub fn cache_invalidated(service: &str, version: u64) {
    debug!(
        event_type = "cache_invalidated",
        service = %service,
        version = version,
        "Discovery cache entry invalidated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_emission() {
        // These functions should not panic when called
        service_registered("svc-a", LeaseId(1), 2);
        registration_failed("svc-a", &RegistryError::BackendUnavailable("down".into()));
        lease_lost("svc-a", LeaseId(1), "stream closed");
        service_unregistered("svc-a", true);
        cache_refreshed("svc-a", 2, 3);
        cache_invalidated("svc-a", 4);
    }
}

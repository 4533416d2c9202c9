//! Registry Metrics
//!
//! Metrics are recorded through the `metrics` facade; they are no-ops until
//! the embedding process installs a recorder (the agent installs the
//! Prometheus exporter).
//!
//! Metrics tracked:
//! - `rollcall_leases_granted_total` - counter of leases obtained
//! - `rollcall_lease_lost_total` - counter of keep-alive losses
//! - `rollcall_registration_failures_total` - counter of failed acquire attempts
//! - `rollcall_registered_entries` - gauge of entries currently registered
//! - `rollcall_cache_hits_total` / `rollcall_cache_misses_total` - discovery lookups
//! - `rollcall_backend_fetches_total` - discovery fetches sent to the backend
//! - `rollcall_snapshot_version` - gauge of the published snapshot version

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::Once;

static DESCRIBE: Once = Once::new();

/// Register descriptions for all metrics. Safe to call more than once.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        describe_counter!("rollcall_leases_granted_total", "Total number of leases obtained");
        describe_counter!(
            "rollcall_lease_lost_total",
            "Total number of leases lost while registered"
        );
        describe_counter!(
            "rollcall_registration_failures_total",
            "Total number of failed acquire-and-publish attempts"
        );
        describe_gauge!(
            "rollcall_registered_entries",
            "Number of local services currently registered"
        );
        describe_counter!("rollcall_cache_hits_total", "Discovery lookups served from the snapshot");
        describe_counter!(
            "rollcall_cache_misses_total",
            "Discovery lookups that missed the snapshot"
        );
        describe_counter!(
            "rollcall_backend_fetches_total",
            "Discovery fetches issued to the backend"
        );
        describe_gauge!(
            "rollcall_snapshot_version",
            "Version of the published discovery snapshot"
        );
    });
}

pub fn record_lease_granted() {
    counter!("rollcall_leases_granted_total").increment(1);
}

pub fn record_lease_lost(service: &str) {
    counter!("rollcall_lease_lost_total", "service" => service.to_string()).increment(1);
}

pub fn record_registration_failure(service: &str) {
    counter!("rollcall_registration_failures_total", "service" => service.to_string())
        .increment(1);
}

pub fn set_registered_entries(count: usize) {
    gauge!("rollcall_registered_entries").set(count as f64);
}

pub fn record_cache_hit() {
    counter!("rollcall_cache_hits_total").increment(1);
}

pub fn record_cache_miss() {
    counter!("rollcall_cache_misses_total").increment(1);
}

pub fn record_backend_fetch() {
    counter!("rollcall_backend_fetches_total").increment(1);
}

pub fn set_snapshot_version(version: u64) {
    gauge!("rollcall_snapshot_version").set(version as f64);
}

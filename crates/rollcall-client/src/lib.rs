//! Rollcall Client Library
//!
//! Announces local services to a coordination store under renewable leases
//! and resolves remote services through a single-flight discovery cache.
//!
//! ```text
//! Registry::register ──► intake queue ──► Coordinator ──► LeaseManager ──► Backend
//! Registry::get_service ──► DiscoveryCache (ArcSwap snapshot) ──miss──► Backend
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod lease;
pub mod observability;
pub mod registry;

pub use backend::{default_plugins, EtcdBackend, EtcdFactory, MemoryBackend, MemoryFactory};
pub use cache::{DiscoveryCache, Snapshot};
pub use config::RegistryConfig;
pub use coordinator::CoordinatorHandle;
pub use entry::{EntryState, RegistrationStatus};
pub use registry::Registry;

pub use rollcall_core::{Node, RegistryError, RegistryOptions, Result, Service};

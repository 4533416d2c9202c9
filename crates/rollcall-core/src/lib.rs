//! Core shared types and contracts for rollcall
//!
//! This crate contains the service model, the key layout used on the
//! coordination store, the error taxonomy, and the backend contract that
//! concrete stores (etcd, in-memory) implement.

pub mod backend;
pub mod error;
pub mod models;
pub mod options;
pub mod plugins;

pub use backend::{
    Backend, BackendFactory, KeepAliveAck, KeepAliveStream, KeyValue, Lease, LeaseId, WatchEvent,
    WatchEventKind, WatchStream,
};
pub use error::{RegistryError, Result};
pub use models::{keys, Node, Service};
pub use options::RegistryOptions;
pub use plugins::BackendPlugins;

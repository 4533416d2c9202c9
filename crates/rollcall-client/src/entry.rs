//! Registration entries owned by the coordinator.

use rollcall_core::{KeepAliveStream, Lease, LeaseId, RegistryError, Service};
use serde::Serialize;
use tokio::time::Instant;

/// Registration state of one service.
///
/// `Pending -> Registered` on a successful acquire-and-publish,
/// `Registered -> Pending` when the keep-alive stream reports the lease gone.
/// There is no failed state; pending entries are retried every sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Registered,
}

/// One locally registered service and its lease.
pub struct RegisteredEntry {
    pub(crate) service: Service,
    pub(crate) state: EntryState,
    pub(crate) lease: Option<Lease>,
    pub(crate) keep_alive: Option<KeepAliveStream>,
    pub(crate) last_error: Option<RegistryError>,
    /// Earliest instant an intake-driven sweep may retry; ticker sweeps
    /// ignore it. `None` means now.
    pub(crate) retry_at: Option<Instant>,
    /// Lease replaced by a later acquire, revoked once the new one is published.
    pub(crate) stale_lease: Option<LeaseId>,
}

impl RegisteredEntry {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            state: EntryState::Pending,
            lease: None,
            keep_alive: None,
            last_error: None,
            retry_at: None,
            stale_lease: None,
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease.map(|l| l.id)
    }

    pub fn is_registered(&self) -> bool {
        self.state == EntryState::Registered
    }

    pub fn last_error(&self) -> Option<&RegistryError> {
        self.last_error.as_ref()
    }

    /// Whether an acquire attempt is due at `now`.
    pub(crate) fn due(&self, now: Instant) -> bool {
        self.state == EntryState::Pending && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Drop the current lease back to pending, remembering it for revocation.
    pub(crate) fn demote(&mut self) -> Option<LeaseId> {
        self.state = EntryState::Pending;
        self.keep_alive = None;
        self.retry_at = None;
        let previous = self.lease.take().map(|l| l.id);
        if previous.is_some() {
            self.stale_lease = previous;
        }
        previous
    }

    /// Swap in a new node set; the entry must be published again.
    pub(crate) fn replace_service(&mut self, service: Service) {
        self.service = service;
        self.demote();
    }

    pub fn status(&self) -> RegistrationStatus {
        RegistrationStatus {
            service: self.service.name.clone(),
            nodes: self.service.nodes.len(),
            state: self.state,
            lease_id: self.lease_id().map(|id| id.0),
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Read-only view of an entry, published after every coordinator tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationStatus {
    pub service: String,
    pub nodes: usize,
    pub state: EntryState,
    pub lease_id: Option<i64>,
    pub last_error: Option<String>,
}

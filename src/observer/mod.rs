//! Observer tooling: maintain an independent local copy of the chain and
//! verify it without trusting the upstream.
//!
//! The observer is authoritative about what it has seen, not about what
//! exists. A mismatch between local verification and upstream content is
//! grounds for alarm, never silent reconciliation.

pub mod client;
pub mod replica;

use crate::error::StoreError;
use crate::event::EventWire;
use crate::store::EventStore;

/// Where a replica fetches missing events from. The HTTP client implements
/// this against the public read API; an in-process store source backs the
/// tests and embedded deployments.
pub trait EventSource {
    fn fetch(&self, from: u64, to: u64) -> anyhow::Result<Vec<EventWire>>;
}

/// Event source over a local store, for in-process replication.
pub struct StoreSource<'a>(pub &'a EventStore);

impl EventSource for StoreSource<'_> {
    fn fetch(&self, from: u64, to: u64) -> anyhow::Result<Vec<EventWire>> {
        let records = self.0.range(from, to, usize::MAX)?;
        records
            .iter()
            .map(|r| r.to_wire().map_err(StoreError::Storage))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

pub use client::ObserverClient;
pub use replica::ObserverReplica;

//! Archon: a governance event-ledger.
//!
//! Records decisions, votes and lifecycle transitions into a tamper-evident,
//! publicly-verifiable append-only log, routes votes through a multi-stage
//! validation pipeline, and routes tasks through a refusal-tolerant
//! activation loop. Every governance-relevant state transition lands in the
//! witnessed event chain; nothing is produced silently.

pub mod anchor;
pub mod api;
pub mod bus;
pub mod canonical;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod event;
pub mod export;
pub mod identity;
pub mod lifecycle;
pub mod observer;
pub mod pipeline;
pub mod router;
pub mod store;
pub mod utils;

pub use context::ArchonContext;
pub use crypto::GENESIS_ANCHOR;
pub use event::{EventRecord, EventWire};
pub use store::{EventStore, LocalWitness, VerifyReport, WitnessService};

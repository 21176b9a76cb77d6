//! Event records: the unit of the chain.
//!
//! Events are stored as CBOR with signatures in raw bytes; on the wire they
//! are JSON with base64 signatures. The payload is kept as the exact
//! canonical JSON text that was hashed, so verification never depends on a
//! re-serialization being byte-identical.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::canonical::{CANONICAL_VERSION, canonical_string};
use crate::crypto::{self, SIG_ALG_VERSION};
use crate::error::{StorageError, decode_err};

/// Reserved prefix for system actors, e.g. `SYSTEM:ORCHESTRATOR`.
pub const SYSTEM_PREFIX: &str = "SYSTEM:";

/// Well-known system actor ids.
pub mod actors {
    pub const ORCHESTRATOR: &str = "SYSTEM:ORCHESTRATOR";
    pub const ROUTER: &str = "SYSTEM:ROUTER";
    pub const ANCHOR: &str = "SYSTEM:ANCHOR";
    pub const RECONCILER: &str = "SYSTEM:RECONCILER";
}

pub fn is_system_agent(agent_id: &str) -> bool {
    agent_id.starts_with(SYSTEM_PREFIX)
}

/// An event as persisted in the store.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct EventRecord {
    #[n(0)]
    pub event_id: String,
    #[n(1)]
    pub sequence: u64,
    #[n(2)]
    pub event_type: String,
    /// Canonical JSON text of the payload document.
    #[n(3)]
    pub payload: String,
    #[n(4)]
    pub agent_id: Option<String>,
    #[n(5)]
    pub witness_id: String,
    #[cbor(n(6), with = "minicbor::bytes")]
    pub witness_signature: Vec<u8>,
    #[cbor(n(7), with = "minicbor::bytes")]
    pub signature: Vec<u8>,
    #[n(8)]
    pub content_hash: String,
    #[n(9)]
    pub prev_hash: String,
    #[n(10)]
    pub local_timestamp: String,
    #[n(11)]
    pub authority_timestamp: Option<String>,
    #[n(12)]
    pub hash_algorithm_version: u8,
    #[n(13)]
    pub sig_alg_version: u8,
}

impl EventRecord {
    /// The payload as a structured document.
    pub fn payload_value(&self) -> Result<Value, StorageError> {
        serde_json::from_str(&self.payload).map_err(decode_err)
    }

    /// Rebuild the content-fields document this event's `content_hash`
    /// covers. Key order is irrelevant; the canonical encoder sorts.
    pub fn content_document(&self) -> Result<Value, StorageError> {
        Ok(content_document(
            &self.event_id,
            self.sequence,
            &self.event_type,
            &self.payload_value()?,
            self.agent_id.as_deref(),
            &self.witness_id,
            &self.local_timestamp,
            self.authority_timestamp.as_deref(),
            self.hash_algorithm_version,
        ))
    }

    /// Bytes the agent and witness signatures cover.
    pub fn signable(&self) -> Vec<u8> {
        crypto::signable_bytes(&self.content_hash, &self.prev_hash, self.agent_id.as_deref())
    }

    pub fn to_wire(&self) -> Result<EventWire, StorageError> {
        Ok(EventWire {
            event_id: self.event_id.clone(),
            sequence: self.sequence,
            event_type: self.event_type.clone(),
            payload: self.payload_value()?,
            agent_id: self.agent_id.clone(),
            witness_id: self.witness_id.clone(),
            witness_signature: crypto::signature_to_base64(&self.witness_signature),
            signature: crypto::signature_to_base64(&self.signature),
            content_hash: self.content_hash.clone(),
            prev_hash: self.prev_hash.clone(),
            local_timestamp: self.local_timestamp.clone(),
            authority_timestamp: self.authority_timestamp.clone(),
            hash_algorithm_version: self.hash_algorithm_version,
            sig_alg_version: self.sig_alg_version,
        })
    }

    pub fn from_wire(wire: &EventWire) -> Result<Self, StorageError> {
        Ok(Self {
            event_id: wire.event_id.clone(),
            sequence: wire.sequence,
            event_type: wire.event_type.clone(),
            payload: canonical_string(&wire.payload),
            agent_id: wire.agent_id.clone(),
            witness_id: wire.witness_id.clone(),
            witness_signature: crypto::signature_from_base64(&wire.witness_signature)
                .map_err(decode_err)?,
            signature: crypto::signature_from_base64(&wire.signature).map_err(decode_err)?,
            content_hash: wire.content_hash.clone(),
            prev_hash: wire.prev_hash.clone(),
            local_timestamp: wire.local_timestamp.clone(),
            authority_timestamp: wire.authority_timestamp.clone(),
            hash_algorithm_version: wire.hash_algorithm_version,
            sig_alg_version: wire.sig_alg_version,
        })
    }
}

/// The content-fields document covered by `content_hash`. Signatures and
/// chain-position fields are excluded; they bind through the signable tuple
/// instead.
#[allow(clippy::too_many_arguments)]
pub fn content_document(
    event_id: &str,
    sequence: u64,
    event_type: &str,
    payload: &Value,
    agent_id: Option<&str>,
    witness_id: &str,
    local_timestamp: &str,
    authority_timestamp: Option<&str>,
    hash_algorithm_version: u8,
) -> Value {
    json!({
        "agent_id": agent_id,
        "authority_timestamp": authority_timestamp,
        "event_id": event_id,
        "event_type": event_type,
        "hash_algorithm_version": hash_algorithm_version,
        "local_timestamp": local_timestamp,
        "payload": payload,
        "sequence": sequence,
        "witness_id": witness_id,
    })
}

/// An event as served by the read API and replicated by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWire {
    pub event_id: String,
    pub sequence: u64,
    pub event_type: String,
    pub payload: Value,
    pub agent_id: Option<String>,
    pub witness_id: String,
    pub witness_signature: String,
    pub signature: String,
    pub content_hash: String,
    pub prev_hash: String,
    pub local_timestamp: String,
    pub authority_timestamp: Option<String>,
    pub hash_algorithm_version: u8,
    pub sig_alg_version: u8,
}

impl Default for EventWire {
    fn default() -> Self {
        Self {
            event_id: String::new(),
            sequence: 0,
            event_type: String::new(),
            payload: Value::Null,
            agent_id: None,
            witness_id: String::new(),
            witness_signature: String::new(),
            signature: String::new(),
            content_hash: String::new(),
            prev_hash: String::new(),
            local_timestamp: String::new(),
            authority_timestamp: None,
            hash_algorithm_version: CANONICAL_VERSION,
            sig_alg_version: SIG_ALG_VERSION,
        }
    }
}

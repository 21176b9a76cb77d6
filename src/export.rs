//! Event export and signed export attestation.
//!
//! Exports are round-trip-stable: importing an exported range and
//! re-verifying yields the same event set and the same range digest.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::{self, KeyDirectory, SIG_ALG_VERSION, SignerHandle};
use crate::error::StoreError;
use crate::event::EventRecord;
use crate::store::EventStore;
use crate::utils;

pub const CSV_HEADER: &str = "event_id,sequence,event_type,payload,content_hash,prev_hash,\
signature,agent_id,witness_id,witness_signature,local_timestamp,authority_timestamp,\
hash_algorithm_version,sig_alg_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Jsonl,
    Csv,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jsonl" => Some(Self::Jsonl),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jsonl => "application/x-ndjson",
            Self::Csv => "text/csv",
        }
    }
}

fn select(
    store: &EventStore,
    start: u64,
    end: u64,
    event_type: Option<&str>,
) -> Result<Vec<EventRecord>, StoreError> {
    let events = store.range(start, end.min(store.head().max(start)), usize::MAX)?;
    Ok(events
        .into_iter()
        .filter(|e| event_type.is_none_or(|t| e.event_type == t))
        .collect())
}

/// One JSON document per line, wire field set.
pub fn export_jsonl(
    store: &EventStore,
    start: u64,
    end: u64,
    event_type: Option<&str>,
) -> Result<String, StoreError> {
    let mut out = String::new();
    for record in select(store, start, end, event_type)? {
        let wire = record.to_wire()?;
        out.push_str(&serde_json::to_string(&wire).expect("wire event serializes"));
        out.push('\n');
    }
    Ok(out)
}

fn csv_escape(field: &str) -> String {
    if field.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// CSV export, wire fields verbatim, payload as its canonical JSON text.
pub fn export_csv(
    store: &EventStore,
    start: u64,
    end: u64,
    event_type: Option<&str>,
) -> Result<String, StoreError> {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for record in select(store, start, end, event_type)? {
        let row = [
            record.event_id.clone(),
            record.sequence.to_string(),
            record.event_type.clone(),
            record.payload.clone(),
            record.content_hash.clone(),
            record.prev_hash.clone(),
            crypto::signature_to_base64(&record.signature),
            record.agent_id.clone().unwrap_or_default(),
            record.witness_id.clone(),
            crypto::signature_to_base64(&record.witness_signature),
            record.local_timestamp.clone(),
            record.authority_timestamp.clone().unwrap_or_default(),
            record.hash_algorithm_version.to_string(),
            record.sig_alg_version.to_string(),
        ];
        out.push_str(
            &row.iter()
                .map(|f| csv_escape(f))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    Ok(out)
}

/// Digest of a range: SHA-256 over the concatenated content hashes in
/// sequence order. The "root hash" an export round-trips against.
pub fn range_digest(events: &[EventRecord]) -> String {
    let mut concatenated = String::new();
    for event in events {
        concatenated.push_str(&event.content_hash);
    }
    sha256::digest(concatenated.as_bytes())
}

/// Signed digest of an export range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportAttestation {
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub event_count: u64,
    pub range_digest: String,
    pub attested_at: String,
    pub authority_id: String,
    /// Base64 signature over the canonical attestation document.
    pub signature: String,
    pub sig_alg_version: u8,
}

fn attestation_document(
    start: u64,
    end: u64,
    count: u64,
    digest: &str,
    attested_at: &str,
) -> serde_json::Value {
    json!({
        "attested_at": attested_at,
        "end_sequence": end,
        "event_count": count,
        "range_digest": digest,
        "start_sequence": start,
    })
}

pub fn build_attestation(
    store: &EventStore,
    start: u64,
    end: u64,
    authority: &SignerHandle,
) -> Result<ExportAttestation, StoreError> {
    let events = store.range(start, end, usize::MAX)?;
    let digest = range_digest(&events);
    let attested_at = utils::utc_now();
    let doc = attestation_document(start, end, events.len() as u64, &digest, &attested_at);
    let signature = authority.sign(&crate::canonical::canonical_bytes(&doc));

    Ok(ExportAttestation {
        start_sequence: start,
        end_sequence: end,
        event_count: events.len() as u64,
        range_digest: digest,
        attested_at,
        authority_id: authority.signer_id().to_string(),
        signature: crypto::signature_to_base64(&signature),
        sig_alg_version: SIG_ALG_VERSION,
    })
}

pub fn verify_attestation(attestation: &ExportAttestation, keys: &KeyDirectory) -> bool {
    let doc = attestation_document(
        attestation.start_sequence,
        attestation.end_sequence,
        attestation.event_count,
        &attestation.range_digest,
        &attestation.attested_at,
    );
    let Ok(signature) = crypto::signature_from_base64(&attestation.signature) else {
        return false;
    };
    keys.verify(
        &attestation.authority_id,
        &crate::canonical::canonical_bytes(&doc),
        &signature,
        attestation.sig_alg_version,
    )
    .is_ok()
}

/// Parse a JSONL export back into records, for import and re-verification.
pub fn import_jsonl(text: &str) -> Result<Vec<EventRecord>, StoreError> {
    let mut out = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let wire: crate::event::EventWire = serde_json::from_str(line)
            .map_err(|e| StoreError::Storage(crate::error::StorageError::Decode(e.to_string())))?;
        out.push(EventRecord::from_wire(&wire)?);
    }
    Ok(out)
}

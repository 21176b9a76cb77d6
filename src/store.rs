//! Append-only event store: the only path by which an event enters the
//! system.
//!
//! Writes are serialized through a single logical writer that owns the
//! `(last_seq, last_content_hash)` cursor. Reads are unrestricted. Every
//! append is co-attested by a witness; the witness co-signature is what
//! distinguishes "the system recorded it" from "an agent asserted it".

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::{debug, error, info};

use crate::canonical::{CANONICAL_VERSION, canonical_string};
use crate::config::WitnessConfig;
use crate::crypto::{self, GENESIS_ANCHOR, KeyDirectory, SIG_ALG_VERSION, SignerHandle};
use crate::error::{IntegrityError, StorageError, StoreError, WitnessError, decode_err, encode_err};
use crate::event::{EventRecord, content_document};
use crate::utils;

const EVENTS_TREE: &str = "events";
const BY_ID_TREE: &str = "events_by_id";
const BY_TYPE_TREE: &str = "events_by_type";

/// Why a single co-sign attempt failed. The store maps this onto
/// [`WitnessError`] after applying the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoSignError {
    /// Transient; the store retries with backoff.
    Unavailable,
    /// Terminal; the proposed event is rejected.
    Refused { reason: String },
}

/// A witness: a signing identity distinct from the agent that co-attests
/// every event. Implementations may be remote; callers only see the
/// attestation or the failure.
pub trait WitnessService: Send + Sync {
    fn witness_id(&self) -> &str;
    fn co_sign(&self, signable: &[u8]) -> Result<[u8; 64], CoSignError>;
}

/// In-process witness backed by a local signer handle.
pub struct LocalWitness {
    handle: SignerHandle,
}

impl LocalWitness {
    pub fn new(handle: SignerHandle) -> Self {
        Self { handle }
    }

    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.handle.verifying_key()
    }
}

impl WitnessService for LocalWitness {
    fn witness_id(&self) -> &str {
        self.handle.signer_id()
    }

    fn co_sign(&self, signable: &[u8]) -> Result<[u8; 64], CoSignError> {
        Ok(self.handle.sign(signable))
    }
}

struct Cursor {
    last_seq: u64,
    last_content_hash: String,
}

/// The sequenced, hash-linked event log.
pub struct EventStore {
    events: sled::Tree,
    by_id: sled::Tree,
    by_type: sled::Tree,
    cursor: Mutex<Cursor>,
    witness_cfg: WitnessConfig,
}

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub checked: u64,
    pub valid: bool,
    pub first_invalid_sequence: Option<u64>,
    pub error_type: Option<String>,
    pub detail: Option<String>,
}

impl VerifyReport {
    fn ok(from: u64, to: u64, checked: u64) -> Self {
        Self {
            from_sequence: from,
            to_sequence: to,
            checked,
            valid: true,
            first_invalid_sequence: None,
            error_type: None,
            detail: None,
        }
    }

    fn invalid(from: u64, to: u64, checked: u64, violation: &IntegrityError) -> Self {
        Self {
            from_sequence: from,
            to_sequence: to,
            checked,
            valid: false,
            first_invalid_sequence: Some(violation.sequence()),
            error_type: Some(violation.kind().to_string()),
            detail: Some(violation.to_string()),
        }
    }
}

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn type_key(event_type: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(event_type.len() + 9);
    key.extend_from_slice(event_type.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

impl EventStore {
    /// Open (or create) the store inside an existing sled database and
    /// recover the writer cursor from the tail.
    pub fn open(db: &sled::Db, witness_cfg: WitnessConfig) -> Result<Self, StorageError> {
        let events = db.open_tree(EVENTS_TREE)?;
        let by_id = db.open_tree(BY_ID_TREE)?;
        let by_type = db.open_tree(BY_TYPE_TREE)?;

        let cursor = match events.last()? {
            Some((_, raw)) => {
                let tail: EventRecord = minicbor::decode(&raw).map_err(decode_err)?;
                Cursor {
                    last_seq: tail.sequence,
                    last_content_hash: tail.content_hash,
                }
            }
            None => Cursor {
                last_seq: 0,
                last_content_hash: GENESIS_ANCHOR.to_string(),
            },
        };
        debug!(last_seq = cursor.last_seq, "event store opened");

        Ok(Self {
            events,
            by_id,
            by_type,
            cursor: Mutex::new(cursor),
            witness_cfg,
        })
    }

    /// Append a new event to the chain.
    ///
    /// Transactional: partial failure at any point before commit leaves the
    /// chain unchanged. Concurrent appends serialize on the writer cursor.
    pub fn append(
        &self,
        event_type: &str,
        payload: Value,
        agent_id: &str,
        agent_signer: &SignerHandle,
        witness: &dyn WitnessService,
    ) -> Result<EventRecord, StoreError> {
        let mut cursor = self.cursor.lock();

        let sequence = cursor.last_seq + 1;
        let prev_hash = cursor.last_content_hash.clone();
        let event_id = utils::new_uuid();
        let local_timestamp = utils::utc_now();
        let payload_text = canonical_string(&payload);

        let doc = content_document(
            &event_id,
            sequence,
            event_type,
            &payload,
            Some(agent_id),
            witness.witness_id(),
            &local_timestamp,
            None,
            CANONICAL_VERSION,
        );
        let content_hash = crypto::content_hash(&doc);

        let signable = crypto::signable_bytes(&content_hash, &prev_hash, Some(agent_id));
        let signature = agent_signer.sign(&signable);
        let witness_signature = self.co_sign_with_retry(witness, &signable)?;

        let record = EventRecord {
            event_id: event_id.clone(),
            sequence,
            event_type: event_type.to_string(),
            payload: payload_text,
            agent_id: Some(agent_id.to_string()),
            witness_id: witness.witness_id().to_string(),
            witness_signature: witness_signature.to_vec(),
            signature: signature.to_vec(),
            content_hash: content_hash.clone(),
            prev_hash,
            local_timestamp,
            authority_timestamp: None,
            hash_algorithm_version: CANONICAL_VERSION,
            sig_alg_version: SIG_ALG_VERSION,
        };

        let record_bytes = minicbor::to_vec(&record).map_err(encode_err)?;
        let skey = seq_key(sequence);
        let tkey = type_key(event_type, sequence);

        (&self.events, &self.by_id, &self.by_type)
            .transaction(|(events, by_id, by_type)| {
                events.insert(&skey[..], record_bytes.as_slice())?;
                by_id.insert(event_id.as_bytes(), &skey[..])?;
                by_type.insert(tkey.as_slice(), &skey[..])?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(err) => StorageError::Backend(err),
                TransactionError::Abort(()) => {
                    StorageError::Encode("append transaction aborted".into())
                }
            })?;

        // Commit point passed; move the cursor.
        cursor.last_seq = sequence;
        cursor.last_content_hash = content_hash;

        info!(sequence, event_type, agent_id, "event appended");
        Ok(record)
    }

    fn co_sign_with_retry(
        &self,
        witness: &dyn WitnessService,
        signable: &[u8],
    ) -> Result<[u8; 64], WitnessError> {
        let attempts = self.witness_cfg.retry_attempts.max(1);
        for attempt in 1..=attempts {
            match witness.co_sign(signable) {
                Ok(sig) => return Ok(sig),
                Err(CoSignError::Refused { reason }) => {
                    error!(witness_id = witness.witness_id(), %reason, "witness refused");
                    return Err(WitnessError::Refused {
                        witness_id: witness.witness_id().to_string(),
                        reason,
                    });
                }
                Err(CoSignError::Unavailable) if attempt < attempts => {
                    let backoff = self.witness_cfg.backoff_base_ms << (attempt - 1);
                    debug!(attempt, backoff_ms = backoff, "witness unavailable, backing off");
                    std::thread::sleep(Duration::from_millis(backoff));
                }
                Err(CoSignError::Unavailable) => break,
            }
        }
        Err(WitnessError::Unavailable { attempts })
    }

    /// Last committed sequence (0 for an empty store).
    pub fn head(&self) -> u64 {
        self.cursor.lock().last_seq
    }

    pub fn count(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn read_by_sequence(&self, sequence: u64) -> Result<EventRecord, StoreError> {
        let raw = self
            .events
            .get(seq_key(sequence))
            .map_err(StorageError::Backend)?
            .ok_or_else(|| StoreError::NotFound(format!("sequence {sequence}")))?;
        Ok(minicbor::decode(&raw).map_err(decode_err)?)
    }

    pub fn read_by_event_id(&self, event_id: &str) -> Result<EventRecord, StoreError> {
        let skey = self
            .by_id
            .get(event_id.as_bytes())
            .map_err(StorageError::Backend)?
            .ok_or_else(|| StoreError::NotFound(format!("event_id {event_id}")))?;
        let raw = self
            .events
            .get(&skey)
            .map_err(StorageError::Backend)?
            .ok_or_else(|| StoreError::NotFound(format!("event_id {event_id}")))?;
        Ok(minicbor::decode(&raw).map_err(decode_err)?)
    }

    /// Events with `from <= sequence <= to`, ascending, capped at `limit`.
    pub fn range(&self, from: u64, to: u64, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        if from == 0 || to < from {
            return Err(StoreError::InvalidRange { from, to });
        }
        let mut out = Vec::new();
        for item in self.events.range(seq_key(from)..=seq_key(to)) {
            if out.len() >= limit {
                break;
            }
            let (_, raw) = item.map_err(StorageError::Backend)?;
            out.push(minicbor::decode(&raw).map_err(decode_err)?);
        }
        Ok(out)
    }

    /// All events of `event_type` in a sequence window, ascending.
    pub fn range_by_type(
        &self,
        event_type: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut prefix = Vec::with_capacity(event_type.len() + 1);
        prefix.extend_from_slice(event_type.as_bytes());
        prefix.push(0);

        let mut out = Vec::new();
        for item in self.by_type.scan_prefix(&prefix) {
            let (_, skey) = item.map_err(StorageError::Backend)?;
            let raw = self
                .events
                .get(&skey)
                .map_err(StorageError::Backend)?
                .ok_or_else(|| StoreError::NotFound("dangling type index".into()))?;
            let record: EventRecord = minicbor::decode(&raw).map_err(decode_err)?;
            if record.sequence >= from && record.sequence <= to {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Recompute every content hash, check linkage and verify every
    /// signature over `from..=to`. Integrity failures are reported, never
    /// repaired.
    pub fn verify_range(
        &self,
        from: u64,
        to: u64,
        keys: &KeyDirectory,
    ) -> Result<VerifyReport, StoreError> {
        if from == 0 || to < from || to > self.head() {
            return Err(StoreError::InvalidRange { from, to });
        }
        let events = self.range(from, to, usize::MAX)?;
        let prev_hash = if from > 1 {
            Some(self.read_by_sequence(from - 1)?.content_hash)
        } else {
            None
        };
        Ok(verify_events(
            &events,
            from,
            to,
            prev_hash.as_deref(),
            Some(keys),
        ))
    }
}

/// Chain verification over an in-memory slice of records. Shared between
/// the store, the observer replica and the read API.
///
/// `prev_content_hash` is the content hash of the event at `from - 1`,
/// or `None` when `from == 1` (the genesis anchor applies). With
/// `keys: None` only hashes and linkage are checked; signature
/// verification needs the public-key directory.
pub fn verify_events(
    events: &[EventRecord],
    from: u64,
    to: u64,
    prev_content_hash: Option<&str>,
    keys: Option<&KeyDirectory>,
) -> VerifyReport {
    let mut expected_prev = prev_content_hash.map(str::to_string);
    let mut checked = 0u64;

    let mut by_seq = events.iter();
    for sequence in from..=to {
        let record = match by_seq.next() {
            Some(r) if r.sequence == sequence => r,
            _ => {
                let violation = IntegrityError::ChainBreak {
                    sequence,
                    expected: format!("event at sequence {sequence}"),
                    found: "missing".into(),
                };
                error!(%violation, "chain verification failed");
                return VerifyReport::invalid(from, to, checked, &violation);
            }
        };

        // Genesis / linkage.
        if sequence == 1 {
            if record.prev_hash != GENESIS_ANCHOR {
                let violation = IntegrityError::GenesisMismatch {
                    found: record.prev_hash.clone(),
                };
                error!(%violation, "chain verification failed");
                return VerifyReport::invalid(from, to, checked, &violation);
            }
        } else if let Some(expected) = &expected_prev {
            if &record.prev_hash != expected {
                let violation = IntegrityError::ChainBreak {
                    sequence,
                    expected: expected.clone(),
                    found: record.prev_hash.clone(),
                };
                error!(%violation, "chain verification failed");
                return VerifyReport::invalid(from, to, checked, &violation);
            }
        }

        // Content integrity.
        let recomputed = match record.content_document() {
            Ok(doc) => crypto::content_hash(&doc),
            Err(e) => {
                let violation = IntegrityError::HashMismatch {
                    sequence,
                    stored: record.content_hash.clone(),
                    recomputed: format!("unreadable payload: {e}"),
                };
                return VerifyReport::invalid(from, to, checked, &violation);
            }
        };
        if recomputed != record.content_hash {
            let violation = IntegrityError::HashMismatch {
                sequence,
                stored: record.content_hash.clone(),
                recomputed,
            };
            error!(%violation, "chain verification failed");
            return VerifyReport::invalid(from, to, checked, &violation);
        }

        // Signature binding. Events without agent attribution are invalid.
        if let Some(keys) = keys {
            let signable = record.signable();
            let agent_check = match record.agent_id.as_deref() {
                Some(agent_id) => keys
                    .verify(agent_id, &signable, &record.signature, record.sig_alg_version)
                    .map_err(|e| (agent_id.to_string(), e.to_string())),
                None => Err(("<none>".to_string(), "missing agent attribution".to_string())),
            };
            if let Err((signer_id, detail)) = agent_check {
                let violation = IntegrityError::SignatureInvalid {
                    sequence,
                    signer_id,
                    detail,
                };
                error!(%violation, "chain verification failed");
                return VerifyReport::invalid(from, to, checked, &violation);
            }

            if let Err(e) = keys.verify(
                &record.witness_id,
                &signable,
                &record.witness_signature,
                record.sig_alg_version,
            ) {
                let violation = IntegrityError::WitnessSignatureInvalid {
                    sequence,
                    witness_id: record.witness_id.clone(),
                    detail: e.to_string(),
                };
                error!(%violation, "chain verification failed");
                return VerifyReport::invalid(from, to, checked, &violation);
            }
        }

        expected_prev = Some(record.content_hash.clone());
        checked += 1;
    }

    VerifyReport::ok(from, to, checked)
}

/// Shared handle type used across subsystems.
pub type SharedStore = Arc<EventStore>;

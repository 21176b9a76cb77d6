//! Local observer mirror: persistent, indexed storage for replicated
//! events, with gap detection and local chain verification.

use tracing::{info, warn};

use crate::crypto::KeyDirectory;
use crate::error::{StorageError, StoreError, decode_err, encode_err};
use crate::event::{EventRecord, EventWire};
use crate::observer::EventSource;
use crate::store::{VerifyReport, verify_events};

const EVENTS_TREE: &str = "observer_events";
const BY_SEQ_TREE: &str = "observer_by_sequence";
const BY_TYPE_TREE: &str = "observer_by_type";

/// Local mirror keyed on `event_id`, with a unique sequence index and an
/// event-type index. Stored fields match the wire fields verbatim.
pub struct ObserverReplica {
    events: sled::Tree,
    by_seq: sled::Tree,
    by_type: sled::Tree,
}

impl ObserverReplica {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            events: db.open_tree(EVENTS_TREE)?,
            by_seq: db.open_tree(BY_SEQ_TREE)?,
            by_type: db.open_tree(BY_TYPE_TREE)?,
        })
    }

    /// Upsert one replicated event.
    pub fn insert_local(&self, record: &EventRecord) -> Result<(), StorageError> {
        let raw = minicbor::to_vec(record).map_err(encode_err)?;
        self.events.insert(record.event_id.as_bytes(), raw)?;
        self.by_seq
            .insert(record.sequence.to_be_bytes(), record.event_id.as_bytes())?;
        let mut tkey = Vec::with_capacity(record.event_type.len() + 9);
        tkey.extend_from_slice(record.event_type.as_bytes());
        tkey.push(0);
        tkey.extend_from_slice(&record.sequence.to_be_bytes());
        self.by_type.insert(tkey, record.event_id.as_bytes())?;
        Ok(())
    }

    pub fn insert_wire(&self, wire: &EventWire) -> Result<(), StorageError> {
        self.insert_local(&EventRecord::from_wire(wire)?)
    }

    pub fn count(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn get_by_sequence(&self, sequence: u64) -> Result<Option<EventRecord>, StorageError> {
        let Some(event_id) = self.by_seq.get(sequence.to_be_bytes())? else {
            return Ok(None);
        };
        match self.events.get(&event_id)? {
            Some(raw) => Ok(Some(minicbor::decode(&raw).map_err(decode_err)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_event_id(&self, event_id: &str) -> Result<Option<EventRecord>, StorageError> {
        match self.events.get(event_id.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw).map_err(decode_err)?)),
            None => Ok(None),
        }
    }

    /// All local sequence numbers, ascending.
    pub fn all_sequences(&self) -> Result<Vec<u64>, StorageError> {
        let mut out = Vec::new();
        for item in self.by_seq.iter() {
            let (key, _) = item?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&key);
            out.push(u64::from_be_bytes(bytes));
        }
        Ok(out)
    }

    /// Min and max local sequence, or `None` when empty.
    pub fn sequence_range(&self) -> Result<Option<(u64, u64)>, StorageError> {
        let first = self.by_seq.first()?;
        let last = self.by_seq.last()?;
        match (first, last) {
            (Some((lo, _)), Some((hi, _))) => {
                let mut a = [0u8; 8];
                a.copy_from_slice(&lo);
                let mut b = [0u8; 8];
                b.copy_from_slice(&hi);
                Ok(Some((u64::from_be_bytes(a), u64::from_be_bytes(b))))
            }
            _ => Ok(None),
        }
    }

    /// Missing ranges between consecutive present sequences, optionally
    /// window-constrained. A gap is `(prev+1, curr-1)`.
    pub fn find_gaps(
        &self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<(u64, u64)>, StorageError> {
        let mut sequences = self.all_sequences()?;
        if let Some(start) = start {
            sequences.retain(|&s| s >= start);
        }
        if let Some(end) = end {
            sequences.retain(|&s| s <= end);
        }

        let mut gaps = Vec::new();
        for pair in sequences.windows(2) {
            if pair[1] != pair[0] + 1 {
                gaps.push((pair[0] + 1, pair[1] - 1));
            }
        }
        Ok(gaps)
    }

    pub fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<EventRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.by_seq.range(from.to_be_bytes()..=to.to_be_bytes()) {
            let (_, event_id) = item?;
            if let Some(raw) = self.events.get(&event_id)? {
                out.push(minicbor::decode(&raw).map_err(decode_err)?);
            }
        }
        Ok(out)
    }

    /// Fetch every missing range from `source` and insert it, optionally
    /// verifying content hashes as events are inserted. Returns the number
    /// of events filled.
    pub fn fill_gaps(
        &self,
        source: &dyn EventSource,
        verify_hashes: bool,
    ) -> anyhow::Result<u64> {
        let mut filled = 0u64;
        for (lo, hi) in self.find_gaps(None, None)? {
            info!(lo, hi, "filling gap");
            for wire in source.fetch(lo, hi)? {
                let record = EventRecord::from_wire(&wire)?;
                if verify_hashes {
                    let recomputed = crate::crypto::content_hash(&record.content_document()?);
                    if recomputed != record.content_hash {
                        warn!(sequence = record.sequence, "upstream event fails hash check");
                        anyhow::bail!(
                            "content hash mismatch at sequence {} while filling gap",
                            record.sequence
                        );
                    }
                }
                self.insert_local(&record)?;
                filled += 1;
            }
        }
        Ok(filled)
    }

    /// Reuse the store's verification algorithm on the local mirror. With
    /// `keys: None` only hashes and linkage are checked.
    pub fn verify_local_chain(
        &self,
        from: u64,
        to: u64,
        keys: Option<&KeyDirectory>,
    ) -> Result<VerifyReport, StoreError> {
        if from == 0 || to < from {
            return Err(StoreError::InvalidRange { from, to });
        }
        let events = self.events_in_range(from, to)?;
        let prev_hash = if from > 1 {
            self.get_by_sequence(from - 1)?.map(|r| r.content_hash)
        } else {
            None
        };
        Ok(verify_events(&events, from, to, prev_hash.as_deref(), keys))
    }
}

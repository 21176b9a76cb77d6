//! Merkle anchoring: periodic cryptographic summaries of the chain.
//!
//! On a cadence, a consecutive range of finalized events is bundled into a
//! binary SHA-256 Merkle tree. The root is recorded as a signed checkpoint
//! which is itself appended to the chain, so checkpoints form their own
//! hash-linked chain rooted in the event chain. Observers use inclusion
//! proofs to audit single events without replaying everything.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::AnchorConfig;
use crate::crypto::{self, GENESIS_ANCHOR, SignerHandle};
use crate::error::{StorageError, StoreError, decode_err, encode_err};
use crate::event::actors;
use crate::store::{EventStore, WitnessService};
use crate::utils;

const CHECKPOINTS_TREE: &str = "checkpoints";

/// Event type of the chained checkpoint marker.
pub const CHECKPOINT_EVENT_TYPE: &str = "checkpoint.anchored";

/// A Merkle root over a consecutive range of events.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct CheckpointRecord {
    #[n(0)]
    pub checkpoint_id: String,
    #[n(1)]
    pub from_sequence: u64,
    #[n(2)]
    pub to_sequence: u64,
    /// Merkle root, lowercase hex.
    #[n(3)]
    pub merkle_root: String,
    /// Content hash of the previous checkpoint; genesis anchor for the
    /// first.
    #[n(4)]
    pub prev_checkpoint_hash: String,
    #[n(5)]
    pub authority_id: String,
    #[cbor(n(6), with = "minicbor::bytes")]
    pub authority_signature: Vec<u8>,
    #[n(7)]
    pub created_at: String,
}

impl CheckpointRecord {
    /// Hash of this checkpoint's content fields; what the next checkpoint
    /// links to via `prev_checkpoint_hash`.
    pub fn content_hash(&self) -> String {
        crypto::content_hash(&json!({
            "checkpoint_id": self.checkpoint_id,
            "created_at": self.created_at,
            "from_sequence": self.from_sequence,
            "merkle_root": self.merkle_root,
            "prev_checkpoint_hash": self.prev_checkpoint_hash,
            "to_sequence": self.to_sequence,
        }))
    }

    /// Bytes the authority signature covers.
    pub fn signable(&self) -> Vec<u8> {
        crypto::signable_bytes(
            &self.content_hash(),
            &self.prev_checkpoint_hash,
            Some(&self.authority_id),
        )
    }

    /// Wire form served by the read API.
    pub fn to_wire(&self) -> serde_json::Value {
        json!({
            "checkpoint_id": self.checkpoint_id,
            "from_sequence": self.from_sequence,
            "to_sequence": self.to_sequence,
            "merkle_root": self.merkle_root,
            "prev_checkpoint_hash": self.prev_checkpoint_hash,
            "authority_id": self.authority_id,
            "authority_signature": crypto::signature_to_base64(&self.authority_signature),
            "created_at": self.created_at,
        })
    }
}

/// One step of a sibling-hash path, root-ward order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling hash, lowercase hex.
    pub sibling: String,
    /// True when the sibling sits to the left of the running hash.
    pub sibling_on_left: bool,
}

/// Inclusion proof from an event's leaf up to a checkpoint root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub sequence: u64,
    pub checkpoint_id: String,
    pub merkle_root: String,
    pub leaf_hash: String,
    pub path: Vec<ProofStep>,
}

/// Result of asking for a proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofOutcome {
    Proof(MerkleProof),
    /// The event is in the unanchored tail.
    Pending,
}

fn parent(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn decode_leaf(hex_hash: &str) -> Result<[u8; 32], StorageError> {
    let bytes = hex::decode(hex_hash).map_err(decode_err)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| StorageError::Decode(format!("leaf hash is not 32 bytes: {hex_hash}")))
}

/// Root of a binary SHA-256 tree; odd levels duplicate their last node.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    assert!(!leaves.is_empty(), "merkle tree needs at least one leaf");
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| parent(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// Sibling path for `index` within `leaves`, root-ward order.
pub fn merkle_path(leaves: &[[u8; 32]], index: usize) -> Vec<ProofStep> {
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    let mut idx = index;
    let mut path = Vec::new();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        let sibling_idx = idx ^ 1;
        path.push(ProofStep {
            sibling: hex::encode(level[sibling_idx]),
            sibling_on_left: sibling_idx < idx,
        });
        level = level
            .chunks(2)
            .map(|pair| parent(&pair[0], &pair[1]))
            .collect();
        idx /= 2;
    }
    path
}

/// Fold a proof path from an event content hash and compare against the
/// claimed root.
pub fn verify_proof(event_content_hash: &str, proof: &MerkleProof, claimed_root: &str) -> bool {
    if proof.leaf_hash != event_content_hash {
        return false;
    }
    let Ok(mut running) = decode_leaf(event_content_hash) else {
        return false;
    };
    for step in &proof.path {
        let Ok(sibling) = decode_leaf(&step.sibling) else {
            return false;
        };
        running = if step.sibling_on_left {
            parent(&sibling, &running)
        } else {
            parent(&running, &sibling)
        };
    }
    hex::encode(running) == claimed_root
}

/// Builds and serves checkpoints over an event store.
pub struct MerkleAnchor {
    checkpoints: sled::Tree,
    cfg: AnchorConfig,
}

impl MerkleAnchor {
    pub fn open(db: &sled::Db, cfg: AnchorConfig) -> Result<Self, StorageError> {
        Ok(Self {
            checkpoints: db.open_tree(CHECKPOINTS_TREE)?,
            cfg,
        })
    }

    /// Highest anchored sequence (0 when no checkpoint exists yet).
    pub fn last_anchored(&self) -> Result<u64, StorageError> {
        Ok(self.last_checkpoint()?.map(|cp| cp.to_sequence).unwrap_or(0))
    }

    pub fn last_checkpoint(&self) -> Result<Option<CheckpointRecord>, StorageError> {
        match self.checkpoints.last()? {
            Some((_, raw)) => Ok(Some(minicbor::decode(&raw).map_err(decode_err)?)),
            None => Ok(None),
        }
    }

    /// Whether the count cadence has been crossed.
    pub fn due(&self, store: &EventStore) -> Result<bool, StorageError> {
        Ok(store.head().saturating_sub(self.last_anchored()?) >= self.cfg.every_events)
    }

    /// Anchor the unanchored tail `(last_anchored+1 ..= head)`.
    ///
    /// Idempotent per range: returns `None` when there is nothing new to
    /// anchor. Never anchors past the current tail. The checkpoint marker
    /// is appended to the chain before the checkpoint row is persisted.
    pub fn build_checkpoint(
        &self,
        store: &EventStore,
        authority: &SignerHandle,
        witness: &dyn WitnessService,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        let from = self.last_anchored().map_err(StoreError::Storage)? + 1;
        let to = store.head();
        if to < from {
            return Ok(None);
        }

        let events = store.range(from, to, usize::MAX)?;
        let leaves = events
            .iter()
            .map(|e| decode_leaf(&e.content_hash))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Storage)?;
        let root = hex::encode(merkle_root(&leaves));

        let prev_checkpoint_hash = self
            .last_checkpoint()
            .map_err(StoreError::Storage)?
            .map(|cp| cp.content_hash())
            .unwrap_or_else(|| GENESIS_ANCHOR.to_string());

        let mut record = CheckpointRecord {
            checkpoint_id: utils::new_uuid(),
            from_sequence: from,
            to_sequence: to,
            merkle_root: root,
            prev_checkpoint_hash,
            authority_id: actors::ANCHOR.to_string(),
            authority_signature: Vec::new(),
            created_at: utils::utc_now(),
        };
        record.authority_signature = authority.sign(&record.signable()).to_vec();

        store.append(
            CHECKPOINT_EVENT_TYPE,
            record.to_wire(),
            actors::ANCHOR,
            authority,
            witness,
        )?;

        let raw = minicbor::to_vec(&record).map_err(encode_err)?;
        self.checkpoints
            .insert(record.to_sequence.to_be_bytes(), raw)
            .map_err(StorageError::Backend)?;

        info!(
            checkpoint_id = %record.checkpoint_id,
            from, to,
            merkle_root = %record.merkle_root,
            "checkpoint anchored"
        );
        Ok(Some(record))
    }

    /// The checkpoint whose range contains `sequence`, if any.
    pub fn checkpoint_containing(
        &self,
        sequence: u64,
    ) -> Result<Option<CheckpointRecord>, StorageError> {
        for item in self.checkpoints.range(sequence.to_be_bytes()..) {
            let (_, raw) = item?;
            let cp: CheckpointRecord = minicbor::decode(&raw).map_err(decode_err)?;
            if cp.from_sequence <= sequence && sequence <= cp.to_sequence {
                return Ok(Some(cp));
            }
        }
        Ok(None)
    }

    /// Sibling-hash path for the event at `sequence`, or `Pending` if the
    /// event has not been anchored yet.
    pub fn inclusion_proof(
        &self,
        store: &EventStore,
        sequence: u64,
    ) -> Result<ProofOutcome, StoreError> {
        if sequence == 0 || sequence > store.head() {
            return Err(StoreError::NotFound(format!("sequence {sequence}")));
        }
        if sequence > self.last_anchored().map_err(StoreError::Storage)? {
            return Ok(ProofOutcome::Pending);
        }
        let cp = self
            .checkpoint_containing(sequence)
            .map_err(StoreError::Storage)?
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint for sequence {sequence}")))?;

        let events = store.range(cp.from_sequence, cp.to_sequence, usize::MAX)?;
        let leaves = events
            .iter()
            .map(|e| decode_leaf(&e.content_hash))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Storage)?;
        let index = (sequence - cp.from_sequence) as usize;

        Ok(ProofOutcome::Proof(MerkleProof {
            sequence,
            checkpoint_id: cp.checkpoint_id.clone(),
            merkle_root: cp.merkle_root.clone(),
            leaf_hash: hex::encode(leaves[index]),
            path: merkle_path(&leaves, index),
        }))
    }

    /// Checkpoints newest-first, paginated.
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<CheckpointRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.checkpoints.iter().rev().skip(offset).take(limit) {
            let (_, raw) = item?;
            out.push(minicbor::decode(&raw).map_err(decode_err)?);
        }
        Ok(out)
    }

    pub fn count(&self) -> u64 {
        self.checkpoints.len() as u64
    }

    /// Walk the checkpoint chain and confirm `prev_checkpoint_hash`
    /// linkage end to end.
    pub fn verify_checkpoint_chain(&self) -> Result<bool, StorageError> {
        let mut expected = GENESIS_ANCHOR.to_string();
        for item in self.checkpoints.iter() {
            let (_, raw) = item?;
            let cp: CheckpointRecord = minicbor::decode(&raw).map_err(decode_err)?;
            if cp.prev_checkpoint_hash != expected {
                return Ok(false);
            }
            expected = cp.content_hash();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| {
                let mut h = Sha256::new();
                h.update(i.to_be_bytes());
                h.finalize().into()
            })
            .collect()
    }

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let l = leaves(1);
        assert_eq!(merkle_root(&l), l[0]);
        assert!(merkle_path(&l, 0).is_empty());
    }

    #[test]
    fn path_length_is_ceil_log2() {
        let l = leaves(100);
        assert_eq!(merkle_path(&l, 42).len(), 7);
        let l = leaves(8);
        assert_eq!(merkle_path(&l, 3).len(), 3);
    }

    #[test]
    fn every_leaf_proves_against_the_root() {
        let l = leaves(13);
        let root = hex::encode(merkle_root(&l));
        for (i, leaf) in l.iter().enumerate() {
            let proof = MerkleProof {
                sequence: i as u64 + 1,
                checkpoint_id: "cp".into(),
                merkle_root: root.clone(),
                leaf_hash: hex::encode(leaf),
                path: merkle_path(&l, i),
            };
            assert!(verify_proof(&hex::encode(leaf), &proof, &root), "leaf {i}");
        }
    }

    #[test]
    fn flipped_sibling_byte_fails_verification() {
        let l = leaves(6);
        let root = hex::encode(merkle_root(&l));
        let mut proof = MerkleProof {
            sequence: 3,
            checkpoint_id: "cp".into(),
            merkle_root: root.clone(),
            leaf_hash: hex::encode(l[2]),
            path: merkle_path(&l, 2),
        };
        assert!(verify_proof(&hex::encode(l[2]), &proof, &root));

        let mut bytes = hex::decode(&proof.path[0].sibling).unwrap();
        bytes[0] ^= 0x01;
        proof.path[0].sibling = hex::encode(bytes);
        assert!(!verify_proof(&hex::encode(l[2]), &proof, &root));
    }
}

//! Property-based tests for the Merkle anchor.

use proptest::prelude::*;
use sha2::{Digest, Sha256};

use archon::anchor::{MerkleProof, merkle_path, merkle_root, verify_proof};

fn leaves(n: usize, salt: u64) -> Vec<[u8; 32]> {
    (0..n)
        .map(|i| {
            let mut hasher = Sha256::new();
            hasher.update(salt.to_be_bytes());
            hasher.update((i as u64).to_be_bytes());
            hasher.finalize().into()
        })
        .collect()
}

fn proof_for(leaves: &[[u8; 32]], index: usize) -> (MerkleProof, String) {
    let root = hex::encode(merkle_root(leaves));
    (
        MerkleProof {
            sequence: index as u64 + 1,
            checkpoint_id: "cp-test".to_string(),
            merkle_root: root.clone(),
            leaf_hash: hex::encode(leaves[index]),
            path: merkle_path(leaves, index),
        },
        root,
    )
}

proptest! {
    /// Every leaf of every tree size proves against the root.
    #[test]
    fn every_leaf_has_a_valid_proof(n in 1usize..80, salt in any::<u64>()) {
        let leaves = leaves(n, salt);
        let index = (salt as usize) % n;
        let (proof, root) = proof_for(&leaves, index);
        prop_assert!(verify_proof(&hex::encode(leaves[index]), &proof, &root));
        // Path length is ceil(log2(n)) for n > 1, 0 for a single leaf.
        let expected = if n == 1 { 0 } else { (n as f64).log2().ceil() as usize };
        prop_assert_eq!(proof.path.len(), expected);
    }

    /// A proof never validates a different leaf.
    #[test]
    fn proofs_do_not_transfer_between_leaves(n in 2usize..60, salt in any::<u64>()) {
        let leaves = leaves(n, salt);
        let index = (salt as usize) % n;
        let other = (index + 1) % n;
        let (proof, root) = proof_for(&leaves, index);
        prop_assert!(!verify_proof(&hex::encode(leaves[other]), &proof, &root));
    }

    /// Any single-byte corruption of any path element breaks the proof.
    #[test]
    fn corrupted_siblings_fail(
        n in 2usize..60,
        salt in any::<u64>(),
        step_pick in any::<u16>(),
        byte_pick in 0usize..32,
    ) {
        let leaves = leaves(n, salt);
        let index = (salt as usize) % n;
        let (mut proof, root) = proof_for(&leaves, index);

        let step = (step_pick as usize) % proof.path.len();
        let mut bytes = hex::decode(&proof.path[step].sibling).unwrap();
        bytes[byte_pick] ^= 0x01;
        proof.path[step].sibling = hex::encode(bytes);

        prop_assert!(!verify_proof(&hex::encode(leaves[index]), &proof, &root));
    }

    /// A claimed root from a different tree never verifies.
    #[test]
    fn roots_are_tree_specific(n in 1usize..40, salt in any::<u64>()) {
        let tree_a = leaves(n, salt);
        let tree_b = leaves(n, salt.wrapping_add(1));
        let index = (salt as usize) % n;
        let (proof, _) = proof_for(&tree_a, index);
        let foreign_root = hex::encode(merkle_root(&tree_b));
        prop_assert!(!verify_proof(&hex::encode(tree_a[index]), &proof, &foreign_root));
    }
}

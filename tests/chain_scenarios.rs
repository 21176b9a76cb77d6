//! End-to-end scenarios for the witnessed event chain.

use std::sync::Arc;

use anyhow::Context as _;
use serde_json::json;
use tempfile::tempdir;

use archon::config::WitnessConfig;
use archon::crypto::{GENESIS_ANCHOR, KeyDirectory, SignerHandle};
use archon::event::EventRecord;
use archon::export;
use archon::store::{EventStore, LocalWitness};

fn open_store(db: &sled::Db) -> anyhow::Result<(EventStore, SignerHandle, LocalWitness, KeyDirectory)> {
    let store = EventStore::open(db, WitnessConfig::default())?;
    let agent = SignerHandle::generate("agent_test");
    let witness = LocalWitness::new(SignerHandle::generate("witness_test"));
    let mut keys = KeyDirectory::new();
    keys.register("agent_test".to_string(), agent.verifying_key());
    keys.register("witness_test".to_string(), witness.verifying_key());
    Ok((store, agent, witness, keys))
}

#[test]
fn chain_from_scratch() -> anyhow::Result<()> {
    // Sled uses file-based locking, so every test gets its own database
    // under a tempdir for isolation and cleanup.
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("chain.db"))?;
    let (store, agent, witness, keys) = open_store(&db)?;

    let e1 = store
        .append("vote", json!({"n": 1}), "agent_test", &agent, &witness)
        .context("first append failed")?;
    let e2 = store
        .append("vote", json!({"n": 2}), "agent_test", &agent, &witness)
        .context("second append failed")?;

    assert_eq!(e1.sequence, 1);
    assert_eq!(e2.sequence, 2);
    assert_eq!(e1.prev_hash, GENESIS_ANCHOR);
    assert_eq!(e2.prev_hash, e1.content_hash);

    let report = store.verify_range(1, 2, &keys)?;
    assert!(report.valid, "fresh chain must verify: {report:?}");
    assert_eq!(report.checked, 2);
    Ok(())
}

#[test]
fn tampered_payload_is_detected() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("tamper.db"))?;
    let (store, agent, witness, keys) = open_store(&db)?;

    store.append("vote", json!({"n": 1}), "agent_test", &agent, &witness)?;
    store.append("vote", json!({"n": 2}), "agent_test", &agent, &witness)?;

    // Corrupt event 1's payload directly in storage, bypassing the store's
    // append-only surface.
    let events_tree = db.open_tree("events")?;
    let raw = events_tree.get(1u64.to_be_bytes())?.expect("event 1 exists");
    let mut record: EventRecord = minicbor::decode(&raw)?;
    record.payload = archon::canonical::canonical_string(&json!({"n": 99}));
    events_tree.insert(1u64.to_be_bytes(), minicbor::to_vec(&record)?)?;

    let report = store.verify_range(1, 2, &keys)?;
    assert!(!report.valid);
    assert_eq!(report.first_invalid_sequence, Some(1));
    assert_eq!(report.error_type.as_deref(), Some("hash_mismatch"));
    Ok(())
}

#[test]
fn tampered_linkage_is_a_chain_break() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("break.db"))?;
    let (store, agent, witness, keys) = open_store(&db)?;

    for n in 1..=3 {
        store.append("vote", json!({"n": n}), "agent_test", &agent, &witness)?;
    }

    // Rewrite event 3's prev_hash and recompute its content hash so the
    // break is in the linkage, not the content.
    let events_tree = db.open_tree("events")?;
    let raw = events_tree.get(3u64.to_be_bytes())?.expect("event 3 exists");
    let mut record: EventRecord = minicbor::decode(&raw)?;
    record.prev_hash = "f".repeat(64);
    record.content_hash = archon::crypto::content_hash(&record.content_document()?);
    events_tree.insert(3u64.to_be_bytes(), minicbor::to_vec(&record)?)?;

    let report = store.verify_range(1, 3, &keys)?;
    assert!(!report.valid);
    assert_eq!(report.first_invalid_sequence, Some(3));
    assert_eq!(report.error_type.as_deref(), Some("chain_break"));
    Ok(())
}

#[test]
fn foreign_signature_is_rejected() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("foreign.db"))?;
    let (store, agent, witness, _keys) = open_store(&db)?;

    store.append("vote", json!({"n": 1}), "agent_test", &agent, &witness)?;

    // A directory with the wrong key for the agent.
    let mut wrong_keys = KeyDirectory::new();
    wrong_keys.register(
        "agent_test".to_string(),
        SignerHandle::generate("agent_test").verifying_key(),
    );
    wrong_keys.register("witness_test".to_string(), witness.verifying_key());

    let report = store.verify_range(1, 1, &wrong_keys)?;
    assert!(!report.valid);
    assert_eq!(report.error_type.as_deref(), Some("signature_invalid"));
    Ok(())
}

#[test]
fn sequences_are_dense_from_one() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("dense.db"))?;
    let (store, agent, witness, _keys) = open_store(&db)?;

    for n in 1..=10u64 {
        let record = store.append("vote", json!({"n": n}), "agent_test", &agent, &witness)?;
        assert_eq!(record.sequence, n);
    }
    let sequences: Vec<u64> = store
        .range(1, 10, usize::MAX)?
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<u64>>());
    Ok(())
}

#[test]
fn export_round_trip_preserves_events_and_digest() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("export.db"))?;
    let (store, agent, witness, keys) = open_store(&db)?;

    for n in 1..=6 {
        store.append(
            if n % 2 == 0 { "vote.cast" } else { "vote.validated" },
            json!({"n": n, "note": "quoted \"text\", with comma"}),
            "agent_test",
            &agent,
            &witness,
        )?;
    }

    let original = store.range(1, 6, usize::MAX)?;
    let original_digest = export::range_digest(&original);

    // JSONL round trip: import yields the same set and the same digest.
    let jsonl = export::export_jsonl(&store, 1, 6, None)?;
    let imported = export::import_jsonl(&jsonl)?;
    assert_eq!(imported, original);
    assert_eq!(export::range_digest(&imported), original_digest);

    // Type filter narrows the export.
    let filtered = export::export_jsonl(&store, 1, 6, Some("vote.cast"))?;
    assert_eq!(export::import_jsonl(&filtered)?.len(), 3);

    // CSV carries one row per event plus the header.
    let csv = export::export_csv(&store, 1, 6, None)?;
    assert_eq!(csv.lines().count(), 7);
    assert!(csv.lines().next().unwrap().starts_with("event_id,sequence"));

    // The attestation binds the digest and verifies under the authority.
    let authority = SignerHandle::generate("SYSTEM:ANCHOR");
    let attestation = export::build_attestation(&store, 1, 6, &authority)?;
    assert_eq!(attestation.range_digest, original_digest);
    assert_eq!(attestation.event_count, 6);

    let mut directory = keys.clone();
    directory.register("SYSTEM:ANCHOR".to_string(), authority.verifying_key());
    assert!(export::verify_attestation(&attestation, &directory));

    let mut forged = attestation.clone();
    forged.event_count = 7;
    assert!(!export::verify_attestation(&forged, &directory));
    Ok(())
}

#[test]
fn concurrent_appends_serialize_without_gaps() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join("concurrent.db"))?;
    let store = Arc::new(EventStore::open(&db, WitnessConfig::default())?);
    let agent = Arc::new(SignerHandle::generate("agent_test"));
    let witness = Arc::new(LocalWitness::new(SignerHandle::generate("witness_test")));

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = store.clone();
        let agent = agent.clone();
        let witness = witness.clone();
        handles.push(std::thread::spawn(move || {
            for n in 0..5 {
                store
                    .append(
                        "vote",
                        json!({"worker": worker, "n": n}),
                        "agent_test",
                        &agent,
                        witness.as_ref(),
                    )
                    .expect("append");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker thread");
    }

    assert_eq!(store.head(), 20);
    let mut keys = KeyDirectory::new();
    keys.register("agent_test".to_string(), agent.verifying_key());
    keys.register("witness_test".to_string(), witness.verifying_key());
    let report = store.verify_range(1, 20, &keys)?;
    assert!(report.valid, "{report:?}");
    Ok(())
}

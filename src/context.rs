//! Process-level wiring.
//!
//! All shared state is explicit: the context owns the database, the key
//! material handles and every subsystem, and is built once at the process
//! entry point. Nothing in the crate reaches for ambient globals.

use std::sync::Arc;

use crate::anchor::MerkleAnchor;
use crate::bus::Bus;
use crate::config::ArchonConfig;
use crate::crypto::{KeyDirectory, SignerHandle};
use crate::event::actors;
use crate::identity::IdentityDirectory;
use crate::lifecycle::CessationGuard;
use crate::pipeline::{Orchestrator, topics};
use crate::router::{ProgramRefs, RegistryHandle, TaskRouter, ToolRegistry};
use crate::store::{EventStore, LocalWitness};
use crate::utils;

pub struct ArchonContext {
    pub db: sled::Db,
    pub store: Arc<EventStore>,
    pub anchor: Arc<MerkleAnchor>,
    pub bus: Arc<Bus>,
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<TaskRouter>,
    pub registry: Arc<RegistryHandle>,
    pub identity: Arc<IdentityDirectory>,
    pub cessation: Arc<CessationGuard>,
    pub witness: Arc<LocalWitness>,
    /// Anchoring and attestation authority (`SYSTEM:ANCHOR`).
    pub authority: SignerHandle,
    /// Public keys of every local signer, for verification.
    pub keys: KeyDirectory,
    pub config: ArchonConfig,
}

impl ArchonContext {
    /// Open a full context over a single sled database, generating fresh
    /// process keys and creating the standard topic table.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        config: ArchonConfig,
        registry: ToolRegistry,
        program: ProgramRefs,
    ) -> anyhow::Result<Self> {
        let db = sled::open(path)?;

        let witness_handle = SignerHandle::generate(utils::new_uuid_to_bech32("witness_")?);
        let orchestrator_signer = SignerHandle::generate(actors::ORCHESTRATOR);
        let router_signer = SignerHandle::generate(actors::ROUTER);
        let authority = SignerHandle::generate(actors::ANCHOR);

        let mut keys = KeyDirectory::new();
        keys.register_handle(&witness_handle);
        keys.register_handle(&orchestrator_signer);
        keys.register_handle(&router_signer);
        keys.register_handle(&authority);

        let witness = Arc::new(LocalWitness::new(witness_handle));
        let store = Arc::new(EventStore::open(&db, config.witness.clone())?);
        let anchor = Arc::new(MerkleAnchor::open(&db, config.anchor.clone())?);
        let bus = Arc::new(Bus::open(&db)?);
        bus.ensure_topics(&topics::standard_topics())?;

        let identity = Arc::new(IdentityDirectory::new());
        let cessation = Arc::new(CessationGuard::new());
        let registry = Arc::new(RegistryHandle::new(registry));

        let mut orchestrator = Orchestrator::new(
            &db,
            bus.clone(),
            store.clone(),
            orchestrator_signer,
            witness.clone(),
            config.pipeline.clone(),
        )?;
        orchestrator.with_identity(identity.clone());
        orchestrator.with_cessation(cessation.clone());
        let orchestrator = Arc::new(orchestrator);

        let mut router = TaskRouter::new(
            &db,
            registry.clone(),
            store.clone(),
            router_signer,
            witness.clone(),
            config.reroute.clone(),
            program,
        )?;
        router.with_cessation(cessation.clone());
        let router = Arc::new(router);

        Ok(Self {
            db,
            store,
            anchor,
            bus,
            orchestrator,
            router,
            registry,
            identity,
            cessation,
            witness,
            authority,
            keys,
            config,
        })
    }

    /// Anchor the tail if the cadence is due. Returns whether a checkpoint
    /// was built.
    pub fn maybe_anchor(&self) -> anyhow::Result<bool> {
        if !self.anchor.due(&self.store)? {
            return Ok(false);
        }
        Ok(self
            .anchor
            .build_checkpoint(&self.store, &self.authority, self.witness.as_ref())?
            .is_some())
    }
}

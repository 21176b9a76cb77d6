//! Serve the public observer read API over an existing chain database.

use std::sync::Arc;

use clap::Parser;

use archon::anchor::MerkleAnchor;
use archon::api::{ApiState, serve};
use archon::config::ArchonConfig;
use archon::crypto::SignerHandle;
use archon::event::actors;
use archon::store::EventStore;

#[derive(Parser)]
#[command(name = "archon-observer-api", about = "Serve the public observer read API")]
struct Args {
    /// Path to the sled database.
    #[arg(long)]
    db: std::path::PathBuf,
    /// Bind address, e.g. 127.0.0.1:8080.
    #[arg(long)]
    bind: Option<String>,
    /// Optional TOML config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Hex-encoded 32-byte seed for the attestation authority key. A fresh
    /// key is generated when omitted.
    #[arg(long)]
    authority_seed: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ArchonConfig::from_path(path)?,
        None => ArchonConfig::default(),
    };
    let bind = args.bind.clone().unwrap_or_else(|| config.api.bind.clone());

    let authority = match &args.authority_seed {
        Some(seed_hex) => {
            let bytes = hex::decode(seed_hex)?;
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("authority seed must be 32 bytes of hex"))?;
            SignerHandle::from_seed(actors::ANCHOR, &seed)
        }
        None => SignerHandle::generate(actors::ANCHOR),
    };

    let db = sled::open(&args.db)?;
    let store = Arc::new(EventStore::open(&db, config.witness.clone())?);
    let anchor = Arc::new(MerkleAnchor::open(&db, config.anchor.clone())?);

    let state = Arc::new(ApiState {
        store,
        anchor,
        authority,
        cfg: config.api.clone(),
    });
    serve(state, &bind).await
}

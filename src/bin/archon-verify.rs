//! Observer verification toolkit.
//!
//! Maintains a local mirror of the public chain, detects and fills
//! sequence gaps, and independently verifies chain integrity. Exit code 0
//! on success; 1 when an integrity violation or gap is found.

use clap::{Parser, Subcommand};

use archon::anchor;
use archon::observer::{EventSource, ObserverClient, ObserverReplica};

#[derive(Parser)]
#[command(name = "archon-verify", about = "Observer chain verification toolkit")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a sequence range from the read API into the local mirror.
    Fetch {
        #[arg(long)]
        db: std::path::PathBuf,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
    },
    /// Report sequence gaps in the local mirror.
    Gaps {
        #[arg(long)]
        db: std::path::PathBuf,
        #[arg(long)]
        start: Option<u64>,
        #[arg(long)]
        end: Option<u64>,
    },
    /// Fetch whatever is missing between the local min and max.
    FillGaps {
        #[arg(long)]
        db: std::path::PathBuf,
        #[arg(long)]
        base_url: String,
        /// Recompute content hashes while inserting.
        #[arg(long)]
        verify: bool,
    },
    /// Verify hash linkage of the local chain.
    Verify {
        #[arg(long)]
        db: std::path::PathBuf,
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
    },
    /// Fetch and check a Merkle inclusion proof for one event.
    Proof {
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        sequence: u64,
    },
}

fn open_replica(path: &std::path::Path) -> anyhow::Result<ObserverReplica> {
    let db = sled::open(path)?;
    Ok(ObserverReplica::open(&db)?)
}

fn run(command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Fetch { db, base_url, start, end } => {
            let replica = open_replica(&db)?;
            let client = ObserverClient::new(&base_url)?;
            let events = client.fetch(start, end)?;
            let count = events.len();
            for wire in &events {
                replica.insert_wire(wire)?;
            }
            println!("fetched {count} events into {db:?} ({} local)", replica.count());
            Ok(true)
        }
        Command::Gaps { db, start, end } => {
            let replica = open_replica(&db)?;
            let gaps = replica.find_gaps(start, end)?;
            if gaps.is_empty() {
                println!("no gaps ({} events local)", replica.count());
                Ok(true)
            } else {
                for (lo, hi) in &gaps {
                    println!("GAP: {lo}..{hi}");
                }
                eprintln!("{} gap(s) detected", gaps.len());
                Ok(false)
            }
        }
        Command::FillGaps { db, base_url, verify } => {
            let replica = open_replica(&db)?;
            let client = ObserverClient::new(&base_url)?;
            let filled = replica.fill_gaps(&client, verify)?;
            println!("filled {filled} events");
            let remaining = replica.find_gaps(None, None)?;
            if remaining.is_empty() {
                Ok(true)
            } else {
                eprintln!("{} gap(s) remain after fill", remaining.len());
                Ok(false)
            }
        }
        Command::Verify { db, start, end } => {
            let replica = open_replica(&db)?;
            let report = replica.verify_local_chain(start, end, None)?;
            if report.valid {
                println!("VALID: {} events verified ({start}..={end})", report.checked);
                Ok(true)
            } else {
                eprintln!(
                    "INVALID at sequence {:?}: {} ({})",
                    report.first_invalid_sequence,
                    report.error_type.as_deref().unwrap_or("unknown"),
                    report.detail.as_deref().unwrap_or(""),
                );
                Ok(false)
            }
        }
        Command::Proof { base_url, sequence } => {
            let client = ObserverClient::new(&base_url)?;
            let Some(proof) = client.merkle_proof(sequence)? else {
                println!("PENDING: sequence {sequence} is not anchored yet");
                return Ok(true);
            };
            let event = client.event_by_sequence(sequence)?;
            let ok = anchor::verify_proof(&event.content_hash, &proof, &proof.merkle_root);
            if ok {
                println!(
                    "VALID: sequence {sequence} included in checkpoint {} (path length {})",
                    proof.checkpoint_id,
                    proof.path.len()
                );
                Ok(true)
            } else {
                eprintln!("INVALID: proof for sequence {sequence} does not verify");
                Ok(false)
            }
        }
    }
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args.command) {
        Ok(true) => std::process::ExitCode::SUCCESS,
        Ok(false) => std::process::ExitCode::FAILURE,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

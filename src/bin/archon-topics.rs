//! Create or verify the pipeline topic table.
//!
//! Exit code 0 on success, 1 on any failure (including a verify that finds
//! missing topics).

use clap::Parser;

use archon::bus::{Bus, CleanupPolicy, Retention};
use archon::pipeline::topics::standard_topics;

#[derive(Parser)]
#[command(name = "archon-topics", about = "Create the pipeline topic table")]
struct Args {
    /// Path to the sled database.
    #[arg(long)]
    db: std::path::PathBuf,
    /// Print what would be created without creating anything.
    #[arg(long)]
    dry_run: bool,
    /// Verify topics exist with the expected partition counts instead of
    /// creating them.
    #[arg(long)]
    verify: bool,
}

fn describe_retention(retention: Retention) -> String {
    match retention {
        Retention::Infinite => "infinite".to_string(),
        Retention::For(secs) => format!("{}d", secs / 86_400),
    }
}

fn run(args: &Args) -> anyhow::Result<bool> {
    let table = standard_topics();

    if args.dry_run {
        println!("DRY RUN: would ensure {} topics in {:?}", table.len(), args.db);
        for topic in &table {
            println!("  would create: {}", topic.name);
            println!("    partitions: {}", topic.partitions);
            println!("    retention: {}", describe_retention(topic.retention));
            println!(
                "    cleanup: {}",
                if topic.cleanup == CleanupPolicy::Compact { "compact" } else { "delete" }
            );
        }
        return Ok(true);
    }

    let db = sled::open(&args.db)?;
    let bus = Bus::open(&db)?;

    if args.verify {
        let mut all_ok = true;
        for topic in &table {
            match bus.topic(&topic.name)? {
                None => {
                    println!("  MISSING: {}", topic.name);
                    all_ok = false;
                }
                Some(existing) if existing.partitions != topic.partitions => {
                    println!(
                        "  WARN: {} has {} partitions, expected {}",
                        topic.name, existing.partitions, topic.partitions
                    );
                }
                Some(_) => println!("  OK: {} ({} partitions)", topic.name, topic.partitions),
            }
        }
        return Ok(all_ok);
    }

    let created = bus.ensure_topics(&table)?;
    for name in &created {
        println!("  CREATE: {name}");
    }
    for topic in &table {
        if !created.contains(&topic.name) {
            println!("  SKIP: {} (already exists)", topic.name);
        }
    }
    println!("\n{} topics ensured.", table.len());
    Ok(true)
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(true) => {
            println!("Done.");
            std::process::ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("Completed with errors.");
            std::process::ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

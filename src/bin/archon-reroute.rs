//! Reroute a NEEDS_REROUTE task to the next eligible tool.
//!
//! Completes the refusal loop: decline -> reroute -> (maybe) decline again
//! -> escalation. Exit code 0 when a new activation was sent; 1 when the
//! task was blocked (exhausted) or the precondition failed.

use clap::Parser;

use archon::config::{ArchonConfig, SelectionStrategy};
use archon::context::ArchonContext;
use archon::router::{RerouteOutcome, ToolRegistry};
use archon::router::tar::ProgramRefs;

#[derive(Parser)]
#[command(name = "archon-reroute", about = "Reroute a declined task to the next eligible tool")]
struct Args {
    /// Path to the sled database.
    #[arg(long)]
    db: std::path::PathBuf,
    /// Task to reroute (must be in NEEDS_REROUTE).
    #[arg(long)]
    task_id: String,
    /// Path to tool_registry.json.
    #[arg(long)]
    tool_registry: std::path::PathBuf,
    /// Path to program references JSON.
    #[arg(long)]
    program: std::path::PathBuf,
    /// Optional TOML config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Strategy {
    RoundRobin,
    Random,
    Priority,
}

fn run(args: &Args) -> anyhow::Result<bool> {
    let mut config = match &args.config {
        Some(path) => ArchonConfig::from_path(path)?,
        None => ArchonConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.reroute.strategy = match strategy {
            Strategy::RoundRobin => SelectionStrategy::RoundRobin,
            Strategy::Random => SelectionStrategy::Random,
            Strategy::Priority => SelectionStrategy::Priority,
        };
    }

    let registry = ToolRegistry::from_json(&std::fs::read_to_string(&args.tool_registry)?)?;
    let program: ProgramRefs = serde_json::from_str(&std::fs::read_to_string(&args.program)?)?;
    let context = ArchonContext::open(&args.db, config, registry, program)?;

    let before = context.router.task(&args.task_id)?;
    if args.verbose {
        println!("  state: {}", before.state.as_str());
        println!("  excluded tools: {:?}", before.exclusion_set());
        println!("  attempts so far: {}", before.attempt_count);
    }

    match context.router.reroute(&args.task_id)? {
        RerouteOutcome::Activated(tar) => {
            let after = context.router.task(&args.task_id)?;
            println!("{}", "=".repeat(60));
            println!("TASK REROUTED");
            println!("{}", "=".repeat(60));
            println!("Task: {}", args.task_id);
            println!("New tool: {}", tar.targeting.eligible_tools.join(", "));
            println!("Attempt: {}", after.attempt_count);
            println!("TAR: {}", tar.tar_id);
            println!("Deadline: {}", tar.response_requirements.response_deadline_iso);
            Ok(true)
        }
        RerouteOutcome::Blocked { reason } => {
            eprintln!("REROUTE EXHAUSTED: {}", reason.as_str());
            Ok(false)
        }
    }
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(true) => std::process::ExitCode::SUCCESS,
        Ok(false) => std::process::ExitCode::FAILURE,
        Err(e) => {
            eprintln!("REROUTE REJECTED: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

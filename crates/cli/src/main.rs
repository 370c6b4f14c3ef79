use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

use cmd::{BuildArgs, FactsArgs, PlanArgs, cmd_build, cmd_facts, cmd_plan};

/// kiln - build software distributions from Lua descriptors
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch and build everything a project depends on
  Build(BuildArgs),

  /// Resolve the build order without fetching or building anything
  Plan(PlanArgs),

  /// Show the facts build step conditions are evaluated against
  Facts(FactsArgs),
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  // RUST_LOG wins over -v
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "kiln_lib=debug,info" } else { "warn" }));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build(args) => cmd_build(args),
    Commands::Plan(args) => cmd_plan(args),
    Commands::Facts(args) => cmd_facts(args),
  }
}

//! Implementation of the `kiln facts` command.

use anyhow::Result;
use clap::Args;

use super::target::TargetArgs;
use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Args, Debug)]
pub struct FactsArgs {
  #[command(flatten)]
  pub target: TargetArgs,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

pub fn cmd_facts(args: FactsArgs) -> Result<()> {
  let facts = args.target.fact_set()?;

  if args.output.is_json() {
    return print_json(&facts);
  }

  for (name, value) in facts.iter() {
    print_stat(name, &value.to_string());
  }
  Ok(())
}

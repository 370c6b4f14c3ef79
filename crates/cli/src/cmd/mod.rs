mod build;
mod facts;
mod plan;
mod target;

pub use build::{BuildArgs, cmd_build};
pub use facts::{FactsArgs, cmd_facts};
pub use plan::{PlanArgs, cmd_plan};

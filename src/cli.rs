//! CLI domain: parse, route, output, and presentation only.
//! No domain orchestration; single route table dispatches to domain services.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, PerfCommands};
pub use presentation::{
    format_config, format_partition_json, format_partition_text, format_perf_json,
    format_perf_text, format_simulation_text,
};
pub use route::{JobReport, PerfRow, RunContext, SimulationReport, WorkersFile};

//! Integration tests for scene replica synchronization and render balancing

mod cli_commands;
mod config_integration;
mod partition_scenarios;
mod runtime_cluster;
mod store_integration;
mod test_utils;
mod tree_determinism;

pub use test_utils::*;

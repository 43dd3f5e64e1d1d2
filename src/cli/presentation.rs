//! CLI presentation: text and json formatters per command.

use crate::balance::{Partition, Workload};
use crate::cli::route::{PerfRow, SimulationReport};
use crate::config::SceneSyncConfig;
use crate::error::ApiError;
use comfy_table::Table;

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::ConfigError(format!("Failed to render JSON: {}", e)))
}

pub fn format_config(config: &SceneSyncConfig, format: &str) -> Result<String, ApiError> {
    match format {
        "json" => to_json(config),
        _ => toml::to_string_pretty(config)
            .map_err(|e| ApiError::ConfigError(format!("Failed to render TOML: {}", e))),
    }
}

pub fn format_partition_text(partition: &Partition, workload: &Workload) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Worker", "Range", "Units", "Render range", "Predicted finish (s)"]);
    for a in &partition.allocations {
        table.add_row(vec![
            a.worker.clone(),
            format!("{}..{}", a.range_start, a.range_end),
            a.units.to_string(),
            format!("{}..{}", a.render_start, a.render_end),
            format!("{:.3}", a.predicted_finish),
        ]);
    }
    format!(
        "{}\n\nUnits: {} (work per unit {})\nTarget time: {:.3}s\nPredicted makespan: {:.3}s",
        table,
        partition.total_units,
        workload.unit_work,
        partition.target_time,
        partition.makespan()
    )
}

pub fn format_partition_json(partition: &Partition) -> Result<String, ApiError> {
    to_json(partition)
}

pub fn format_perf_text(session: &str, engine: &str, rows: &[PerfRow]) -> String {
    if rows.is_empty() {
        return format!("No performance history for session '{}' on engine '{}'.", session, engine);
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Worker", "Samples", "k (s/unit work)", "Setup (s)"]);
    for row in rows {
        table.add_row(vec![
            row.worker.clone(),
            row.samples.to_string(),
            row.k_estimate
                .map(|k| format!("{:.3e}", k))
                .unwrap_or_else(|| "-".to_string()),
            format!("{:.3}", row.setup_average),
        ]);
    }
    format!("Session '{}', engine '{}'\n{}", session, engine, table)
}

pub fn format_perf_json(rows: &[PerfRow]) -> Result<String, ApiError> {
    to_json(rows)
}

pub fn format_simulation_text(report: &SimulationReport) -> String {
    let mut out = format!("Top hash: {}\nEdits announced: {}\n", report.top_hash, report.edits);

    let mut workers = Table::new();
    workers.load_preset(comfy_table::presets::UTF8_FULL);
    workers.set_header(vec!["Worker", "State"]);
    for (id, state) in &report.workers {
        workers.add_row(vec![id.clone(), state.clone()]);
    }
    out.push_str(&format!("\n{}\n", workers));

    if report.jobs.is_empty() {
        out.push_str("\nNo render job finished.\n");
    } else {
        let mut jobs = Table::new();
        jobs.load_preset(comfy_table::presets::UTF8_FULL);
        jobs.set_header(vec!["Job", "Regions", "Predicted (s)", "Actual (ms)"]);
        for job in &report.jobs {
            jobs.add_row(vec![
                job.job.to_string(),
                job.regions.to_string(),
                format!("{:.3}", job.predicted_makespan),
                job.actual_makespan_ms.to_string(),
            ]);
        }
        out.push_str(&format!("\n{}\n", jobs));
    }

    out.push_str("\nEvents:");
    for (event, count) in &report.events {
        out.push_str(&format!("\n  {}: {}", event, count));
    }
    out
}

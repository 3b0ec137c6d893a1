//! Output formatting for CLI commands.

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::Colorize;
use fleet_provisioner::{LabelInstancePair, StopReport};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Name of the step output holding the label to instance mapping.
pub const PAIRS_OUTPUT_NAME: &str = "label-instance-id-pairs";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Machine-readable JSON.
    #[default]
    Json,
    /// Human-readable table format.
    Table,
}

#[derive(Debug, Tabled)]
struct PairRow {
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Instance")]
    instance_id: String,
}

#[derive(Debug, Tabled)]
struct TeardownRow {
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "ID")]
    id: String,
}

/// Print the label to instance mapping of a started fleet.
pub fn print_pairs(pairs: &[LabelInstancePair], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(pairs, "[]")),
        OutputFormat::Table => {
            if pairs.is_empty() {
                println!("{}", "No runners.".dimmed());
                return;
            }
            let rows: Vec<PairRow> = pairs
                .iter()
                .map(|p| PairRow {
                    label: p.label.to_string(),
                    instance_id: p.instance_id.to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
    }
}

/// Print what a stop removed.
pub fn print_stop_report(report: &StopReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(report, "{}")),
        OutputFormat::Table => {
            let rows: Vec<TeardownRow> = report
                .terminated
                .iter()
                .map(|id| TeardownRow {
                    kind: "instance",
                    id: id.to_string(),
                })
                .chain(report.removed.iter().map(|id| TeardownRow {
                    kind: "runner",
                    id: id.to_string(),
                }))
                .collect();
            if rows.is_empty() {
                println!("{}", "Nothing to stop.".dimmed());
            } else {
                println!("{}", Table::new(rows));
            }
            println!(
                "{} fleet '{}' stopped",
                "Success:".green().bold(),
                report.base_label
            );
        }
    }
}

/// Append the mapping to the file named by `GITHUB_OUTPUT`, if set.
pub fn write_github_output(pairs: &[LabelInstancePair]) -> Result<()> {
    let Ok(path) = std::env::var("GITHUB_OUTPUT") else {
        return Ok(());
    };

    let line = github_output_line(pairs)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open GITHUB_OUTPUT file {:?}", path))?;
    writeln!(file, "{line}").with_context(|| format!("Failed to write to {:?}", path))?;
    Ok(())
}

fn github_output_line(pairs: &[LabelInstancePair]) -> Result<String> {
    let json = serde_json::to_string(pairs).context("Failed to serialize runner mapping")?;
    Ok(format!("{PAIRS_OUTPUT_NAME}={json}"))
}

fn to_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}

use std::io::Write;

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};
use serde::Serialize;

use pgdrift_core::progress::ProgressSink;
use pgdrift_core::{CompareReport, MigrateReport, PatchInfo, PatchStatus, SaveReport, Side};

/// Rewrites one status line on stderr.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, label: &str, fraction: f64) {
        let percent = format!("[{:>3.0}%]", (fraction * 100.0).clamp(0.0, 100.0));
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{} {}", percent.cyan(), label.dimmed());
        let _ = stderr.flush();
    }
}

/// End the progress line so later output starts clean.
pub fn finish_progress(shown: bool) {
    if shown {
        eprintln!();
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} {}", "ERROR:".red().bold(), e),
    }
}

/// Format patch info as a colored table.
pub fn print_info_table(infos: &[PatchInfo]) {
    if infos.is_empty() {
        println!("{}", "No patches found.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Version"),
            Cell::new("Name"),
            Cell::new("Status"),
            Cell::new("Applied On"),
            Cell::new("Last Message"),
        ]);

    for info in infos {
        let applied_on = info
            .applied_on
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let mut status = format_status(info.status);
        if !info.on_disk {
            status = format!("{} {}", status, "(file missing)".red());
        }

        table.add_row(vec![
            Cell::new(&info.version),
            Cell::new(&info.name),
            Cell::new(&status),
            Cell::new(&applied_on),
            Cell::new(info.last_message.as_deref().unwrap_or("")),
        ]);
    }

    println!("{table}");
}

fn format_status(status: PatchStatus) -> String {
    match status {
        PatchStatus::Todo => "TODO".yellow().to_string(),
        PatchStatus::Wip => "WIP".cyan().bold().to_string(),
        PatchStatus::Done => "DONE".green().to_string(),
        PatchStatus::Error => "ERROR".red().bold().to_string(),
    }
}

pub fn print_compare_summary(report: &CompareReport) {
    match &report.file {
        None => println!("{}", "Databases match. No patch written.".green()),
        Some(path) => {
            println!(
                "{}",
                format!(
                    "Wrote {} ({} schema block(s), {} data block(s))",
                    path.display(),
                    report.schema_blocks,
                    report.data_blocks
                )
                .green()
                .bold()
            );
        }
    }
}

/// Print a migration report summary.
pub fn print_migrate_summary(report: &MigrateReport, side: Side) {
    if report.patches_applied == 0 {
        println!(
            "{}",
            format!("The {} database is up to date. No patch applied.", side).green()
        );
        return;
    }

    println!(
        "{}",
        format!(
            "Successfully applied {} patch(es) to {} (execution time {}ms)",
            report.patches_applied, side, report.total_time_ms
        )
        .green()
        .bold()
    );

    for detail in &report.details {
        let replayed = if detail.replayed { " [replayed]" } else { "" };
        println!(
            "  {} {} {} ({} block(s), {}ms){}",
            "→".green(),
            detail.version,
            detail.name,
            detail.blocks,
            detail.execution_time_ms,
            replayed.yellow()
        );
    }
}

pub fn print_save_result(report: &SaveReport, side: Side) {
    println!(
        "{}",
        format!(
            "Patch {} ({}) marked DONE on {} (was {}).",
            report.version, report.name, side, report.previous_status
        )
        .green()
        .bold()
    );
}

//! Compact command implementation.

use fieldnet_core::{CompactStats, LogRecord, TaskLog};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log = super::open_existing(path)?;

    println!("Compacting sync log at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let plan = analyze_compaction(&log)?;
    print_stats("Compaction Analysis", &plan);

    if !dry_run {
        if plan.bytes_after < plan.bytes_before {
            println!();
            println!("Performing compaction...");
            let done = log.compact()?;
            tracing::debug!(bytes_after = done.bytes_after, "compaction finished");
            println!("✓ Compaction complete");
        } else {
            println!();
            println!("No compaction needed - log is already minimal");
        }
    }

    Ok(())
}

/// Computes what [`TaskLog::compact`] would produce without rewriting.
pub fn analyze_compaction(log: &TaskLog) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let scan = log.scan()?;
    let live = scan.live_tasks();

    let mut bytes_after = 0u64;
    for task in &live {
        bytes_after += LogRecord::Upsert(task.clone()).encode()?.len() as u64;
    }

    Ok(CompactStats {
        records_before: scan.records.len(),
        live_tasks: live.len(),
        bytes_before: scan.total_len,
        bytes_after,
    })
}

fn print_stats(title: &str, stats: &CompactStats) {
    let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
    println!("{title}:");
    println!("  Records:     {}", stats.records_before);
    println!("  Live tasks:  {}", stats.live_tasks);
    println!();
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if stats.bytes_before > 0 {
            (saved as f64 / stats.bytes_before as f64) * 100.0
        } else {
            0.0
        }
    );
}

//! Usage command implementation.

use fieldnet_core::{classify_usage, UsageConfig, UsageStatus};
use serde::Serialize;

/// Usage classification result.
#[derive(Debug, Serialize)]
pub struct UsageResult {
    /// Bytes used this period.
    pub bytes: u64,
    /// Cap in bytes.
    pub cap: u64,
    /// Share of the cap used, in percent.
    pub percent: f64,
    /// Bucket the usage falls into.
    pub status: UsageStatus,
}

/// Runs the usage command.
pub fn run(bytes: u64, cap: Option<u64>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = evaluate(bytes, cap);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Used:   {} of {} bytes ({:.1}%)", result.bytes, result.cap, result.percent);
            println!("Status: {}", result.status);
        }
    }

    Ok(())
}

/// Classifies `bytes` against `cap`, or the default cap.
pub fn evaluate(bytes: u64, cap: Option<u64>) -> UsageResult {
    let cap = cap.unwrap_or_else(|| UsageConfig::default().cap_bytes);
    let percent = if cap == 0 {
        100.0
    } else {
        bytes as f64 / cap as f64 * 100.0
    };

    UsageResult {
        bytes,
        cap,
        percent,
        status: classify_usage(bytes, cap),
    }
}

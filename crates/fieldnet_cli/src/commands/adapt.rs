//! Adapt command implementation.

use clap::ValueEnum;
use fieldnet_core::{adapt, BandwidthLevel, DataRequest, Priority};
use serde::Serialize;
use std::time::Duration;

/// Bandwidth level as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LevelArg {
    /// Below 100 KB/s.
    Low,
    /// 100 to 500 KB/s.
    Medium,
    /// Above 500 KB/s.
    High,
}

impl From<LevelArg> for BandwidthLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Low => Self::Low,
            LevelArg::Medium => Self::Medium,
            LevelArg::High => Self::High,
        }
    }
}

/// Shape of a request before or after adaptation.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Shape {
    /// Payload cap in bytes.
    pub max_payload_bytes: u64,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u128,
    /// Attempts allowed.
    pub retry_budget: u32,
}

impl From<&DataRequest> for Shape {
    fn from(request: &DataRequest) -> Self {
        Self {
            max_payload_bytes: request.max_payload_bytes,
            timeout_ms: request.timeout.as_millis(),
            retry_budget: request.retry_budget,
        }
    }
}

/// Adapt command result.
#[derive(Debug, Serialize)]
pub struct AdaptResult {
    /// Level the request was adapted for.
    pub level: BandwidthLevel,
    /// The request as written by feature code.
    pub original: Shape,
    /// The request the queue would execute.
    pub adapted: Shape,
}

/// Runs the adapt command.
pub fn run(
    level: BandwidthLevel,
    max_bytes: u64,
    timeout_ms: u64,
    retries: u32,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = shape(level, max_bytes, timeout_ms, retries);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Bandwidth level: {}", result.level);
            println!();
            println!("                 original     adapted");
            println!(
                "  Payload cap:  {:>10}  {:>10} bytes",
                result.original.max_payload_bytes, result.adapted.max_payload_bytes
            );
            println!(
                "  Timeout:      {:>10}  {:>10} ms",
                result.original.timeout_ms, result.adapted.timeout_ms
            );
            println!(
                "  Retry budget: {:>10}  {:>10}",
                result.original.retry_budget, result.adapted.retry_budget
            );
        }
    }

    Ok(())
}

/// Adapts a request built from the given limits.
pub fn shape(level: BandwidthLevel, max_bytes: u64, timeout_ms: u64, retries: u32) -> AdaptResult {
    let original = DataRequest::new("cli", Priority::Medium)
        .with_max_payload_bytes(max_bytes)
        .with_timeout(Duration::from_millis(timeout_ms))
        .with_retry_budget(retries);
    let adapted = adapt(&original, level);

    AdaptResult {
        level,
        original: Shape::from(&original),
        adapted: Shape::from(&adapted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_level_quarters_payload() {
        let result = shape(BandwidthLevel::Low, 1_000, 10_000, 3);
        assert_eq!(
            result.adapted,
            Shape {
                max_payload_bytes: 250,
                timeout_ms: 20_000,
                retry_budget: 5,
            }
        );
        assert_eq!(result.original.max_payload_bytes, 1_000);
    }

    #[test]
    fn medium_and_high() {
        let medium = shape(BandwidthLevel::Medium, 1_000, 10_000, 3);
        assert_eq!(medium.adapted.max_payload_bytes, 500);
        assert_eq!(medium.adapted.timeout_ms, 15_000);
        assert_eq!(medium.adapted.retry_budget, 3);

        let high = shape(BandwidthLevel::High, 1_000, 10_000, 3);
        assert_eq!(high.adapted, high.original);
    }

    #[test]
    fn level_arg_maps_to_level() {
        assert_eq!(BandwidthLevel::from(LevelArg::Medium), BandwidthLevel::Medium);
        let json = serde_json::to_value(shape(LevelArg::High.into(), 8, 1, 1)).unwrap();
        assert_eq!(json["adapted"]["max_payload_bytes"], 8);
    }
}

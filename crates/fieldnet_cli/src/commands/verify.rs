//! Verify command implementation.

use fieldnet_core::{SkippedRegion, TailDamage, TaskLog};
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of valid records.
    pub valid_records: usize,
    /// Bytes covered by valid records.
    pub valid_len: u64,
    /// Total log size.
    pub total_len: u64,
    /// Damaged regions followed by valid records.
    pub skipped: Vec<SkippedRegion>,
    /// Damage after the last valid record.
    pub damage: Option<TailDamage>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.skipped.is_empty() && self.damage.is_none()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying sync log at {:?}", path);
    println!();

    let log = super::open_existing(path)?;
    let result = verify(&log)?;
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Sync log verification passed");
        Ok(())
    } else {
        println!("✗ Sync log verification failed");
        Err("Verification failed".into())
    }
}

/// Walks every record, checking framing, magic, version and checksum.
pub fn verify(log: &TaskLog) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let scan = log.scan()?;
    Ok(VerifyResult {
        valid_records: scan.records.len(),
        valid_len: scan.valid_len,
        total_len: scan.total_len,
        skipped: scan.skipped,
        damage: scan.damage,
    })
}

fn print_result(result: &VerifyResult) {
    println!(
        "  records valid: {}, bytes valid: {}/{}",
        result.valid_records, result.valid_len, result.total_len
    );
    for region in &result.skipped {
        println!(
            "    ERROR: {} bytes skipped at offset {}: {}",
            region.len, region.offset, region.reason
        );
    }
    match &result.damage {
        Some(TailDamage::Truncated { offset }) => {
            println!("    ERROR: incomplete record at offset {}", offset);
        }
        Some(TailDamage::Corrupt { offset, reason }) => {
            println!("    ERROR: corrupt record at offset {}: {}", offset, reason);
        }
        None => {}
    }
}

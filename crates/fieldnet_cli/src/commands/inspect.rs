//! Inspect command implementation.

use fieldnet_core::{LogRecord, TaskLog};
use serde::Serialize;
use std::path::Path;

/// Sync log inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Log path.
    pub path: String,
    /// Log size in bytes.
    pub size: u64,
    /// Number of valid records.
    pub record_count: usize,
    /// Number of upsert records.
    pub upsert_count: usize,
    /// Number of remove records.
    pub remove_count: usize,
    /// Bytes in skipped regions and after the last valid record.
    pub damaged_bytes: u64,
    /// Tasks still waiting for delivery, oldest first.
    pub pending: Vec<PendingTask>,
}

/// One pending task.
#[derive(Debug, Serialize)]
pub struct PendingTask {
    /// Task id.
    pub id: String,
    /// Domain tag.
    pub kind: String,
    /// Payload size in bytes.
    pub payload_size: usize,
    /// Failed flushes so far.
    pub retry_count: u32,
    /// Flush limit.
    pub max_retries: u32,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let log = super::open_existing(path)?;
    let result = inspect(&log, path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects statistics without touching the log.
pub fn inspect(log: &TaskLog, path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let scan = log.scan()?;
    let upsert_count = scan
        .records
        .iter()
        .filter(|(_, record)| matches!(record, LogRecord::Upsert(_)))
        .count();

    let pending = scan
        .live_tasks()
        .into_iter()
        .map(|task| PendingTask {
            id: task.id.to_string(),
            kind: task.kind,
            payload_size: task.payload.len(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        size: scan.total_len,
        record_count: scan.records.len(),
        upsert_count,
        remove_count: scan.records.len() - upsert_count,
        damaged_bytes: scan.total_len - scan.valid_len
            + scan.skipped.iter().map(|region| region.len).sum::<u64>(),
        pending,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Sync Log: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Size:     {} bytes", result.size);
    println!("  Records:  {}", result.record_count);
    println!("  Upserts:  {}", result.upsert_count);
    println!("  Removes:  {}", result.remove_count);
    if result.damaged_bytes > 0 {
        println!("  Damaged:  {} bytes (run verify for details)", result.damaged_bytes);
    }
    println!();
    println!("Pending tasks: {}", result.pending.len());
    for task in &result.pending {
        println!(
            "  {}  {:<20} {:>8} bytes  attempt {}/{}",
            task.id, task.kind, task.payload_size, task.retry_count, task.max_retries
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldnet_core::{SyncTask, SyncTaskStore};

    #[test]
    fn lists_live_tasks_in_order() {
        let log = TaskLog::in_memory();
        let vaccine = SyncTask::new("vaccination", b"{\"dose\":2}".to_vec());
        let sale = SyncTask::new("sale", b"{}".to_vec());
        let weight = SyncTask::new("weight", b"42".to_vec());
        log.persist(&vaccine).unwrap();
        log.persist(&sale).unwrap();
        log.persist(&weight).unwrap();
        log.persist(&vaccine.next_attempt()).unwrap();
        log.remove(sale.id).unwrap();

        let result = inspect(&log, Path::new("sync.log")).unwrap();

        assert_eq!(result.record_count, 5);
        assert_eq!(result.upsert_count, 4);
        assert_eq!(result.remove_count, 1);
        assert_eq!(result.damaged_bytes, 0);
        let kinds: Vec<&str> = result.pending.iter().map(|t| t.kind.as_str()).collect();
        assert_eq!(kinds, ["vaccination", "weight"]);
        assert_eq!(result.pending[0].retry_count, 1);
        assert_eq!(result.pending[0].payload_size, 10);
    }

    #[test]
    fn json_output_names_fields() {
        let log = TaskLog::in_memory();
        log.persist(&SyncTask::new("sale", b"{}".to_vec())).unwrap();

        let result = inspect(&log, Path::new("sync.log")).unwrap();
        let json: serde_json::Value = serde_json::to_value(&result).unwrap();

        assert_eq!(json["record_count"], 1);
        assert_eq!(json["pending"][0]["kind"], "sale");
        assert_eq!(json["pending"][0]["max_retries"], 3);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent.log"), "text").is_err());
        assert!(!dir.path().join("absent.log").exists());
    }
}

//! CLI command implementations.

pub mod adapt;
pub mod compact;
pub mod inspect;
pub mod usage;
pub mod verify;

use fieldnet_core::TaskLog;
use std::path::Path;

/// Opens an existing sync log without creating one.
pub(crate) fn open_existing(path: &Path) -> Result<TaskLog, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("No sync log found at {:?}", path).into());
    }
    Ok(TaskLog::open(path)?)
}

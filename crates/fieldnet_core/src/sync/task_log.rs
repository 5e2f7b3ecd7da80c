//! Append-only log of pending sync tasks.
//!
//! ## Record Format
//!
//! ```text
//! | magic "FNTL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC (IEEE) covers the header and the
//! payload. An `Upsert` payload is a CBOR map of the task fields; a
//! `Remove` payload is the 16 raw bytes of the task id.
//!
//! ## Replay
//!
//! Records are applied in order: the last upsert of an id wins and a
//! remove deletes it. A record that is incomplete or fails validation is
//! skipped up to the next offset holding a valid record, so one bad record
//! never hides the ones after it. Damage with no valid record after it is
//! the log's tail; when the log is loaded for use, that tail is cut off.
//!
//! ## Compaction
//!
//! Every persist and remove appends. Once the log holds at least
//! `compact_threshold` records and more than twice as many records as live
//! tasks, it is rewritten to one upsert per live task.

use crate::error::{NetError, NetResult};
use crate::sync::store::SyncTaskStore;
use crate::types::{SyncTask, TaskId};
use ciborium::value::Value;
use fieldnet_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Record magic.
pub const LOG_MAGIC: [u8; 4] = *b"FNTL";

/// Current record format version.
pub const LOG_VERSION: u16 = 1;

/// Header size: magic + version + type + length.
pub const HEADER_SIZE: usize = 4 + 2 + 1 + 4;

const CRC_SIZE: usize = 4;

/// Default number of records before automatic compaction is considered.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 256;

// records per live task that trigger automatic compaction
const COMPACT_RATIO: usize = 2;

/// Type byte of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Insert or replace a task.
    Upsert = 1,
    /// Delete a task.
    Remove = 2,
}

impl RecordType {
    /// Parses a type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Upsert),
            2 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Insert or replace a task.
    Upsert(SyncTask),
    /// Delete a task.
    Remove(TaskId),
}

impl LogRecord {
    /// The record's type byte.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Upsert(_) => RecordType::Upsert,
            Self::Remove(_) => RecordType::Remove,
        }
    }

    /// Encodes the full framed record.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Codec`] if the payload cannot be encoded or is
    /// larger than a record can hold.
    pub fn encode(&self) -> NetResult<Vec<u8>> {
        let payload = match self {
            Self::Upsert(task) => encode_task(task)?,
            Self::Remove(id) => id.as_bytes().to_vec(),
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| NetError::Codec(format!("record payload too large: {}", payload.len())))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&LOG_MAGIC);
        buf.extend_from_slice(&LOG_VERSION.to_le_bytes());
        buf.push(self.record_type() as u8);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn decode_payload(record_type: RecordType, payload: &[u8]) -> NetResult<Self> {
        match record_type {
            RecordType::Upsert => decode_task(payload).map(Self::Upsert),
            RecordType::Remove => {
                let bytes: [u8; 16] = payload.try_into().map_err(|_| {
                    NetError::Corrupted(format!(
                        "remove record holds {} bytes, expected 16",
                        payload.len()
                    ))
                })?;
                Ok(Self::Remove(TaskId::from_bytes(bytes)))
            }
        }
    }
}

fn encode_task(task: &SyncTask) -> NetResult<Vec<u8>> {
    let value = Value::Map(vec![
        (
            Value::Text("id".into()),
            Value::Bytes(task.id.as_bytes().to_vec()),
        ),
        (Value::Text("kind".into()), Value::Text(task.kind.clone())),
        (
            Value::Text("payload".into()),
            Value::Bytes(task.payload.clone()),
        ),
        (
            Value::Text("retry_count".into()),
            Value::Integer(task.retry_count.into()),
        ),
        (
            Value::Text("max_retries".into()),
            Value::Integer(task.max_retries.into()),
        ),
    ]);

    let mut out = Vec::new();
    ciborium::ser::into_writer(&value, &mut out).map_err(|e| NetError::Codec(e.to_string()))?;
    Ok(out)
}

fn decode_task(payload: &[u8]) -> NetResult<SyncTask> {
    let value: Value =
        ciborium::de::from_reader(payload).map_err(|e| NetError::Codec(e.to_string()))?;
    let Value::Map(fields) = value else {
        return Err(NetError::Codec("task record is not a map".into()));
    };

    let mut id = None;
    let mut kind = None;
    let mut body = None;
    let mut retry_count = None;
    let mut max_retries = None;

    for (key, value) in fields {
        let Some(key) = key.as_text() else {
            continue;
        };
        match key {
            "id" => {
                let bytes: [u8; 16] = value
                    .as_bytes()
                    .and_then(|b| b.as_slice().try_into().ok())
                    .ok_or_else(|| NetError::Codec("task id must be 16 bytes".into()))?;
                id = Some(TaskId::from_bytes(bytes));
            }
            "kind" => kind = value.into_text().ok(),
            "payload" => body = value.into_bytes().ok(),
            "retry_count" => retry_count = decode_u32(&value),
            "max_retries" => max_retries = decode_u32(&value),
            // unknown keys come from newer writers
            _ => {}
        }
    }

    let missing = |field: &str| NetError::Codec(format!("task record is missing `{field}`"));
    Ok(SyncTask {
        id: id.ok_or_else(|| missing("id"))?,
        kind: kind.ok_or_else(|| missing("kind"))?,
        payload: body.ok_or_else(|| missing("payload"))?,
        retry_count: retry_count.ok_or_else(|| missing("retry_count"))?,
        max_retries: max_retries.ok_or_else(|| missing("max_retries"))?,
    })
}

fn decode_u32(value: &Value) -> Option<u32> {
    value.as_integer().and_then(|i| u32::try_from(i).ok())
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

/// Why the end of the log could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailDamage {
    /// The last record was cut short, typically by a crash mid-append.
    Truncated {
        /// Offset of the incomplete record.
        offset: u64,
    },
    /// A record failed validation.
    Corrupt {
        /// Offset of the bad record.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },
}

impl TailDamage {
    /// Offset where the damaged region starts.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Truncated { offset } | Self::Corrupt { offset, .. } => *offset,
        }
    }
}

/// A damaged region in the middle of the log, followed by valid records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRegion {
    /// Offset of the first bad byte.
    pub offset: u64,
    /// Bytes skipped before the next valid record.
    pub len: u64,
    /// What was wrong with the record at `offset`.
    pub reason: String,
}

/// Result of walking a log from the start.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Valid records with their offsets.
    pub records: Vec<(u64, LogRecord)>,
    /// Damaged regions that were skipped.
    pub skipped: Vec<SkippedRegion>,
    /// End of the last valid record.
    pub valid_len: u64,
    /// Total length of the log.
    pub total_len: u64,
    /// Damage after the last valid record, if any.
    pub damage: Option<TailDamage>,
}

impl LogScan {
    /// Walks raw log bytes.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut scan = Self {
            total_len: bytes.len() as u64,
            ..Self::default()
        };
        let mut pos = 0usize;

        while pos < bytes.len() {
            let offset = pos as u64;
            match read_record(&bytes[pos..]) {
                Ok((record, len)) => {
                    scan.records.push((offset, record));
                    pos += len;
                    scan.valid_len = pos as u64;
                }
                Err(err) => match next_valid_record(bytes, pos + 1) {
                    Some(next) => {
                        scan.skipped.push(SkippedRegion {
                            offset,
                            len: (next - pos) as u64,
                            reason: err.reason(),
                        });
                        pos = next;
                    }
                    None => {
                        scan.damage = Some(match err {
                            RecordError::Short => TailDamage::Truncated { offset },
                            RecordError::Invalid(reason) => TailDamage::Corrupt { offset, reason },
                        });
                        break;
                    }
                },
            }
        }

        scan
    }

    /// True if nothing was skipped and the tail is intact.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.damage.is_none()
    }

    /// Applies the records and returns live tasks in first-persisted order.
    pub fn live_tasks(&self) -> Vec<SyncTask> {
        let mut live: HashMap<TaskId, (usize, SyncTask)> = HashMap::new();
        for (seq, (_, record)) in self.records.iter().enumerate() {
            match record {
                LogRecord::Upsert(task) => {
                    let first = live.get(&task.id).map_or(seq, |(first, _)| *first);
                    live.insert(task.id, (first, task.clone()));
                }
                LogRecord::Remove(id) => {
                    live.remove(id);
                }
            }
        }
        let mut tasks: Vec<(usize, SyncTask)> = live.into_values().collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, task)| task).collect()
    }
}

enum RecordError {
    Short,
    Invalid(String),
}

impl RecordError {
    fn reason(&self) -> String {
        match self {
            Self::Short => "incomplete record".into(),
            Self::Invalid(reason) => reason.clone(),
        }
    }
}

/// Finds the first offset at or after `from` that holds a valid record.
fn next_valid_record(bytes: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos + HEADER_SIZE <= bytes.len() {
        let found = bytes[pos..].windows(LOG_MAGIC.len()).position(|w| w == LOG_MAGIC)?;
        pos += found;
        if read_record(&bytes[pos..]).is_ok() {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

fn read_record(buf: &[u8]) -> Result<(LogRecord, usize), RecordError> {
    if buf.len() < HEADER_SIZE {
        return Err(RecordError::Short);
    }
    if buf[0..4] != LOG_MAGIC {
        return Err(RecordError::Invalid("invalid magic".into()));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version == 0 || version > LOG_VERSION {
        return Err(RecordError::Invalid(format!("unsupported version {version}")));
    }
    let record_type = RecordType::from_byte(buf[6])
        .ok_or_else(|| RecordError::Invalid(format!("unknown record type {}", buf[6])))?;
    let payload_len = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]) as usize;

    let total = HEADER_SIZE + payload_len + CRC_SIZE;
    if buf.len() < total {
        return Err(RecordError::Short);
    }

    let payload_end = HEADER_SIZE + payload_len;
    let stored = u32::from_le_bytes([
        buf[payload_end],
        buf[payload_end + 1],
        buf[payload_end + 2],
        buf[payload_end + 3],
    ]);
    let computed = compute_crc32(&buf[..payload_end]);
    if stored != computed {
        return Err(RecordError::Invalid(format!(
            "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let record = LogRecord::decode_payload(record_type, &buf[HEADER_SIZE..payload_end])
        .map_err(|e| RecordError::Invalid(e.to_string()))?;
    Ok((record, total))
}

/// Outcome of [`TaskLog::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Valid records before compaction.
    pub records_before: usize,
    /// Live tasks written back.
    pub live_tasks: usize,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
}

/// A [`SyncTaskStore`] backed by an append-only record log.
pub struct TaskLog {
    state: Mutex<LogState>,
    sync_on_write: bool,
    compact_threshold: usize,
}

struct LogState {
    backend: Box<dyn StorageBackend>,
    // counted since the last replay or compaction
    records: usize,
    live: HashSet<TaskId>,
}

impl std::fmt::Debug for TaskLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLog")
            .field("sync_on_write", &self.sync_on_write)
            .field("compact_threshold", &self.compact_threshold)
            .finish_non_exhaustive()
    }
}

impl TaskLog {
    /// Creates a log over an existing backend.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            state: Mutex::new(LogState {
                backend,
                records: 0,
                live: HashSet::new(),
            }),
            sync_on_write: true,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }

    /// Opens or creates a log file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> NetResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        debug!(path = %path.display(), "opened task log");
        Ok(Self::new(Box::new(backend)))
    }

    /// Creates an empty log in memory.
    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryBackend::new()))
    }

    /// Chooses between fsync after every record (the default) and a plain
    /// flush.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    /// Sets the record count below which the log is never compacted
    /// automatically. `usize::MAX` turns automatic compaction off.
    #[must_use]
    pub fn with_compact_threshold(mut self, records: usize) -> Self {
        self.compact_threshold = records;
        self
    }

    /// Walks the log without modifying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn scan(&self) -> NetResult<LogScan> {
        let bytes = self.state.lock().backend.read_all()?;
        Ok(LogScan::parse(&bytes))
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> NetResult<u64> {
        Ok(self.state.lock().backend.size()?)
    }

    /// Rewrites the log so it holds one upsert per live task.
    ///
    /// Damaged regions are dropped as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or rewritten. The old
    /// contents survive a failed rewrite.
    pub fn compact(&self) -> NetResult<CompactStats> {
        let mut state = self.state.lock();
        Self::compact_locked(&mut state)
    }

    fn compact_locked(state: &mut LogState) -> NetResult<CompactStats> {
        let scan = LogScan::parse(&state.backend.read_all()?);
        let live = scan.live_tasks();

        let mut out = Vec::new();
        for task in &live {
            out.extend_from_slice(&LogRecord::Upsert(task.clone()).encode()?);
        }
        state.backend.replace(&out)?;
        state.records = live.len();
        state.live = live.iter().map(|task| task.id).collect();

        let stats = CompactStats {
            records_before: scan.records.len(),
            live_tasks: live.len(),
            bytes_before: scan.total_len,
            bytes_after: out.len() as u64,
        };
        info!(
            records_before = stats.records_before,
            live_tasks = stats.live_tasks,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "task log compacted"
        );
        Ok(stats)
    }

    fn wants_compaction(&self, state: &LogState) -> bool {
        state.records >= self.compact_threshold
            && state.records > state.live.len().saturating_mul(COMPACT_RATIO)
    }

    fn append(&self, record: &LogRecord) -> NetResult<()> {
        let bytes = record.encode()?;
        let mut state = self.state.lock();
        state.backend.append(&bytes)?;
        if self.sync_on_write {
            state.backend.sync()?;
        } else {
            state.backend.flush()?;
        }

        state.records += 1;
        match record {
            LogRecord::Upsert(task) => {
                state.live.insert(task.id);
            }
            LogRecord::Remove(id) => {
                state.live.remove(id);
            }
        }
        if self.wants_compaction(&state) {
            // the record is durable either way
            if let Err(err) = Self::compact_locked(&mut state) {
                warn!(error = %err, "automatic task log compaction failed");
            }
        }
        Ok(())
    }
}

impl SyncTaskStore for TaskLog {
    fn persist(&self, task: &SyncTask) -> NetResult<()> {
        self.append(&LogRecord::Upsert(task.clone()))
    }

    fn remove(&self, id: TaskId) -> NetResult<()> {
        self.append(&LogRecord::Remove(id))
    }

    fn load_pending(&self) -> NetResult<Vec<SyncTask>> {
        let mut state = self.state.lock();
        let scan = LogScan::parse(&state.backend.read_all()?);

        for region in &scan.skipped {
            warn!(
                offset = region.offset,
                len = region.len,
                reason = %region.reason,
                "skipped damaged task log records"
            );
        }
        if let Some(damage) = &scan.damage {
            warn!(
                offset = damage.offset(),
                dropped_bytes = scan.total_len - scan.valid_len,
                ?damage,
                "task log has a damaged tail, truncating"
            );
            state.backend.truncate(scan.valid_len)?;
            state.backend.sync()?;
        }

        let tasks = scan.live_tasks();
        state.records = scan.records.len();
        state.live = tasks.iter().map(|task| task.id).collect();
        debug!(
            records = scan.records.len(),
            pending = tasks.len(),
            "task log replayed"
        );

        if self.wants_compaction(&state) {
            Self::compact_locked(&mut state)?;
        }
        Ok(tasks)
    }
}

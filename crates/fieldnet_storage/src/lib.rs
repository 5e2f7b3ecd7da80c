//! # FieldNet Storage
//!
//! Append-only byte stores used to make the offline mutation queue
//! survive process restarts.
//!
//! Backends are **opaque byte stores**: they do not know what a sync task
//! or a log record is. The record envelope lives in `fieldnet_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral queues
//! - [`FileBackend`] - For durable queues on the device file system
//!
//! ## Example
//!
//! ```rust
//! use fieldnet_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"queued mutation").unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"queued");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;

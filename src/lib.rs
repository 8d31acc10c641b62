//! # Benchlink Core Library
//!
//! Protocol engine for talking to SCPI bench instruments (power supplies,
//! DMMs, electronic loads) over a textual command/response link with
//! unreliable framing, in-band error responses and long-running transfers:
//!
//! - Line demultiplexing with the two-step `**ERROR` convention
//! - Programmable-list get/send sequencing (dwell/voltage/current)
//! - Chunked file upload with command templates and abort handling
//! - DLOG waveform container decoding and CSV export
//!
//! The crate owns no transports and no UI. The surrounding application
//! provides a [`Connection`](core::connection::Connection) that queues
//! commands, feeds response fragments into an operation inbox, and
//! persists outcomes through an
//! [`ActivityLog`](core::activity_log::ActivityLog) sink.
//!
//! ## Example
//!
//! ```rust,no_run
//! use benchlink_core::{operation_channel, GetListOperation, MemoryActivityLog};
//! # use benchlink_core::{Connection, SendOptions};
//! # struct Wire;
//! # impl Connection for Wire { fn send(&self, _: &str, _: SendOptions) {} }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), benchlink_core::OperationError> {
//!     let connection = Wire;
//!     let log = MemoryActivityLog::new();
//!     let (sender, receiver) = operation_channel();
//!
//!     // The wire plumbing pushes response fragments via `sender.data(..)`.
//!     let outcome = GetListOperation::new(0)
//!         .run(&connection, &log, "psu-1", receiver)
//!         .await?;
//!     println!("dwell steps: {:?}", outcome.list_data.dwell);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;

// Re-exports for convenience
pub use crate::core::activity_log::{
    ActivityLog, LogEntry, LogEntryId, LogEntryUpdate, MemoryActivityLog,
};
pub use crate::core::connection::{
    operation_channel, Connection, OperationEvent, OperationReceiver, OperationSender,
    SendOptions,
};
pub use crate::core::demux::{DemuxEvent, LineDemux};
pub use crate::core::dlog::{decode_dlog, dlog_to_csv, is_dlog, CsvOptions, Dlog, Scale, Unit};
pub use crate::core::file_type::{detect_file_type, FileKind};
pub use crate::core::list::{
    GetListOperation, GetListOutcome, ListData, ListPhase, SendListOperation, SendListOutcome,
};
pub use crate::core::metadata::{
    metadata_channel, InstrumentMetadata, ListDigits, MetadataGate, MetadataPublisher,
};
pub use crate::core::upload::{
    FileUploadSession, UploadInstructions, UploadOutcome, UploadSource, UploadState,
};
pub use crate::core::watchdog::ResponseWatchdog;
pub use crate::core::OperationError;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

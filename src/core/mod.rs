//! Core module containing the protocol engine
//!
//! This module provides:
//! - Connection seam and operation event plumbing
//! - Line demultiplexing with in-band device error detection
//! - Sliding response watchdog
//! - List get/send operation state machines
//! - Chunked file upload sessions
//! - DLOG waveform container decoding and CSV export
//! - Activity log sink and in-memory registry
//! - Instrument metadata gate
//! - Upload file type sniffing

pub mod activity_log;
pub mod connection;
pub mod demux;
pub mod dlog;
pub mod file_type;
pub mod list;
pub mod metadata;
pub mod template;
pub mod upload;
pub mod watchdog;

use thiserror::Error;

/// Terminal failure of a protocol operation.
///
/// Display strings are part of the log format: the renderer shows them
/// verbatim and scripts match on them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// No data arrived within the sliding response window.
    #[error("timeout")]
    Timeout,

    /// The instrument reported an error in-band.
    #[error("{0}")]
    Device(String),

    /// The operation was cancelled externally.
    #[error("aborted")]
    Aborted,

    /// The upload source could not be read. Raised before any device
    /// command when loading fails, or mid-transfer when a chunk read
    /// fails.
    #[error("Can't read data from the file")]
    FileRead,

    /// Instrument metadata never became available, so a list send could
    /// not determine its rounding digits.
    #[error("instrument metadata unavailable")]
    MetadataUnavailable,
}

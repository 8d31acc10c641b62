//! File type sniffing for upload log entries
//!
//! Uploads read a short sample from the head of the source file and guess
//! the content type from magic numbers, so history entries can render a
//! sensible icon/preview without re-reading the file. Detection is best
//! effort; anything unrecognized falls back to plain text or an opaque
//! octet stream.

use serde::Serialize;

use crate::core::dlog::{DLOG_MAGIC1, DLOG_MAGIC2};

/// How many bytes of the source file are sampled for detection.
pub const SAMPLE_LENGTH: usize = 512;

/// MIME type used for recorded DLOG waveform containers.
pub const MIME_DLOG: &str = "application/eez-dlog";

/// Detected content type of an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileKind {
    /// Canonical extension, when one is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    /// MIME type.
    pub mime: String,
}

impl FileKind {
    fn new(ext: &str, mime: &str) -> Self {
        Self {
            ext: Some(ext.to_string()),
            mime: mime.to_string(),
        }
    }
}

fn starts_with_u32_le(sample: &[u8], offset: usize, value: u32) -> bool {
    sample
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) == value)
        .unwrap_or(false)
}

/// Guess the content type from a leading sample of the file.
///
/// `file_name` supplies a fallback extension when the magic bytes say
/// nothing.
pub fn detect_file_type(sample: &[u8], file_name: &str) -> FileKind {
    if starts_with_u32_le(sample, 0, DLOG_MAGIC1) && starts_with_u32_le(sample, 4, DLOG_MAGIC2) {
        return FileKind::new("dlog", MIME_DLOG);
    }
    if sample.starts_with(&[0x89, b'P', b'N', b'G']) {
        return FileKind::new("png", "image/png");
    }
    if sample.starts_with(&[0xff, 0xd8, 0xff]) {
        return FileKind::new("jpg", "image/jpeg");
    }
    if sample.starts_with(b"GIF8") {
        return FileKind::new("gif", "image/gif");
    }
    if sample.starts_with(b"%PDF") {
        return FileKind::new("pdf", "application/pdf");
    }
    if sample.starts_with(b"PK\x03\x04") {
        return FileKind::new("zip", "application/zip");
    }

    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase());

    if looks_like_text(sample) {
        return FileKind {
            ext: ext.or_else(|| Some("txt".to_string())),
            mime: "text/plain".to_string(),
        };
    }

    FileKind {
        ext,
        mime: "application/octet-stream".to_string(),
    }
}

/// Valid UTF-8 without control characters (tabs and newlines aside)
/// passes as text.
fn looks_like_text(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }
    let Ok(text) = std::str::from_utf8(sample) else {
        return false;
    };
    text.chars()
        .all(|c| c == '\t' || c == '\n' || c == '\r' || !c.is_control())
}

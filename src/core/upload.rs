//! Chunked file upload to instrument mass storage
//!
//! Uploads speak a command-template protocol: a user-configured start
//! command (`<file>` token), an optional filesize command (`<filesize>`),
//! one chunk command per block (`<chunk>`), an optional finish command and
//! an optional abort command. Every handshake command carries a trailing
//! `;*OPC?` and the device answers each with a bare `1` line. Chunk data
//! rides inside an SCPI arbitrary-block header (`#<digits><length><bytes>`)
//! as Latin-1 text, so payload bytes survive the textual link unchanged.

use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, warn};

use crate::core::activity_log::{
    ActivityLog, LogEntry, LogEntryId, LogEntryUpdate, LOG_TYPE_FILE_UPLOAD,
};
use crate::core::connection::{Connection, OperationEvent, OperationReceiver, SendOptions};
use crate::core::demux::{DemuxEvent, LineDemux};
use crate::core::file_type::{detect_file_type, FileKind, SAMPLE_LENGTH};
use crate::core::template::{escape_dollars, expand_template};
use crate::core::watchdog::ResponseWatchdog;
use crate::core::OperationError;

/// Source of the bytes to upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Read from the local filesystem.
    File(PathBuf),
    /// Already in memory (scripts, editor buffers).
    Data(Bytes),
}

/// Command templates and destination naming for one upload.
///
/// Treated as immutable configuration; the templates come from the
/// instrument profile and are reproduced on the wire verbatim apart from
/// token substitution.
#[derive(Debug, Clone)]
pub struct UploadInstructions {
    /// Where the bytes come from.
    pub source: UploadSource,
    /// Overrides sniffing when the caller already knows the content type.
    pub source_file_type: Option<FileKind>,
    /// File name on the instrument.
    pub destination_file_name: String,
    /// Folder on the instrument; may be empty for the root.
    pub destination_folder_path: String,
    /// Start command with a `<file>` token.
    pub start_command: String,
    /// Optional filesize command with a `<filesize>` token.
    pub file_size_command: Option<String>,
    /// Chunk command with a `<chunk>` token.
    pub send_chunk_command: String,
    /// Optional finish command.
    pub finish_command: Option<String>,
    /// Optional abort command, sent on cancellation and protocol errors.
    pub abort_command: Option<String>,
    /// Payload bytes per chunk.
    pub chunk_size: usize,
}

impl UploadInstructions {
    /// Destination path: trimmed folder with a trailing slash ensured,
    /// then the trimmed file name.
    pub fn destination_file_path(&self) -> String {
        let file_name = self.destination_file_name.trim();
        let folder = self.destination_folder_path.trim();
        if folder.is_empty() {
            return file_name.to_string();
        }

        let mut path = folder.to_string();
        if !path.ends_with('/') && !path.ends_with('\\') {
            path.push('/');
        }
        path.push_str(file_name);
        path
    }
}

/// Upload session state. Serialized names are part of the log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadState {
    /// Reading the source file, no device interaction yet.
    Loading,
    /// Source loaded, start command not sent yet.
    Init,
    /// Start sent, filesize command is next.
    UploadFilesize,
    /// Start (and filesize) acknowledged pending; chunking is next.
    UploadStart,
    /// Chunks in flight.
    Progress,
    /// Finish command sent, awaiting the final acknowledgement.
    UploadFinish,
    /// Terminal: all data delivered.
    Success,
    /// Terminal: failed.
    Error,
    /// Device reported an error; waiting for its acknowledgement before
    /// settling in [`UploadState::Error`].
    UploadError,
    /// Terminal: externally cancelled.
    Abort,
}

impl UploadState {
    /// Terminal states: no further device interaction, resources released.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Abort)
    }
}

/// Successful upload result.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Activity-log entry that tracked the transfer.
    pub log_id: LogEntryId,
    /// Path the file was stored under on the instrument.
    pub destination_file_path: String,
    /// Detected content type.
    pub file_type: FileKind,
    /// Bytes transferred.
    pub data_length: usize,
    /// Bytes that arrived after the final acknowledgement.
    pub surplus: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadSnapshot<'a> {
    state: UploadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_file_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_type: Option<&'a FileKind>,
    destination_file_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_data_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transfer_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// One upload of a local file to instrument storage.
pub struct FileUploadSession<'a> {
    instructions: UploadInstructions,
    connection: &'a dyn Connection,
    log: &'a dyn ActivityLog,

    state: UploadState,
    chunk_index: usize,
    file_data: Vec<u8>,
    file_length: usize,
    fd: Option<File>,
    file_type: Option<FileKind>,
    error: Option<String>,
    log_id: LogEntryId,
    payload_attached: bool,
    started_at: Instant,
}

impl<'a> FileUploadSession<'a> {
    /// Create the session and its activity-log entry. No file or device
    /// access happens until [`run`](Self::run).
    pub fn new(
        connection: &'a dyn Connection,
        log: &'a dyn ActivityLog,
        instrument_id: &str,
        instructions: UploadInstructions,
    ) -> Self {
        let mut session = Self {
            instructions,
            connection,
            log,
            state: UploadState::Loading,
            chunk_index: 0,
            file_data: Vec::new(),
            file_length: 0,
            fd: None,
            file_type: None,
            error: None,
            log_id: LogEntryId::nil(),
            payload_attached: false,
            started_at: Instant::now(),
        };
        session.log_id = log.log(LogEntry::new(
            instrument_id,
            LOG_TYPE_FILE_UPLOAD,
            session.serialize_state(),
        ));
        session
    }

    fn serialize_state(&self) -> String {
        let destination = self.instructions.destination_file_path();
        let mut snapshot = UploadSnapshot {
            state: self.state,
            source_file_path: match &self.instructions.source {
                UploadSource::File(path) => path.to_str(),
                UploadSource::Data(_) => None,
            },
            file_type: self.file_type.as_ref(),
            destination_file_path: &destination,
            data_length: None,
            expected_data_length: None,
            transfer_speed: None,
            error: None,
        };

        match self.state {
            UploadState::Progress => {
                let sent =
                    (self.chunk_index * self.instructions.chunk_size).min(self.file_length);
                snapshot.data_length = Some(sent);
                snapshot.expected_data_length = Some(self.file_length);
                snapshot.transfer_speed = Some(self.transfer_speed(sent));
            }
            UploadState::Success => {
                snapshot.data_length = Some(self.file_length);
            }
            UploadState::Error | UploadState::UploadError => {
                snapshot.error = self.error.as_deref();
            }
            _ => {}
        }

        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    /// Mean transfer rate in bytes per second since the session started.
    fn transfer_speed(&self, sent: usize) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            sent as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Re-serialize the snapshot and push it to the log. Closes the file
    /// handle on the first terminal transition and attaches the payload
    /// once on success.
    fn update_log(&mut self) {
        if self.state.is_done() {
            // Exactly-once close; take() makes the repeat a no-op.
            if let Some(fd) = self.fd.take() {
                drop(fd);
            }
        }

        let mut update = LogEntryUpdate {
            message: Some(self.serialize_state()),
            data: None,
        };

        if self.state == UploadState::Success && !self.payload_attached {
            self.payload_attached = true;
            update.data = Some(Bytes::from(std::mem::take(&mut self.file_data)));
        }

        self.log.update(self.log_id, update);
    }

    /// Load the source into memory and sniff its type. Runs before any
    /// device command; failure is terminal without an abort command.
    async fn load_data(&mut self) -> Result<(), OperationError> {
        let loaded: std::io::Result<()> = async {
            match self.instructions.source.clone() {
                UploadSource::File(path) => {
                    let length = tokio::fs::metadata(&path).await?.len() as usize;
                    self.file_length = length;
                    self.file_data = vec![0u8; length];

                    let mut fd = File::open(&path).await?;
                    let mut sample = vec![0u8; SAMPLE_LENGTH.min(length)];
                    fd.read_exact(&mut sample).await?;

                    self.file_type = Some(detect_file_type(
                        &sample,
                        path.to_str().unwrap_or_default(),
                    ));
                    self.fd = Some(fd);
                }
                UploadSource::Data(data) => {
                    self.file_data = data.to_vec();
                    self.file_length = self.file_data.len();
                    self.file_type = Some(match &self.instructions.source_file_type {
                        Some(kind) => kind.clone(),
                        None => detect_file_type(
                            &self.file_data[..SAMPLE_LENGTH.min(self.file_data.len())],
                            &self.instructions.destination_file_name,
                        ),
                    });
                }
            }
            Ok(())
        }
        .await;

        match loaded {
            Ok(()) => {
                self.state = UploadState::Init;
                self.update_log();
                Ok(())
            }
            Err(io_error) => {
                warn!(%io_error, "upload source unreadable");
                self.state = UploadState::Error;
                self.error = Some(OperationError::FileRead.to_string());
                self.update_log();
                Err(OperationError::FileRead)
            }
        }
    }

    /// Send the start command and pick the follow-up state.
    fn start(&mut self) {
        let start_command = expand_template(
            &self.instructions.start_command,
            "<file>",
            &format!("\"{}\"", self.instructions.destination_file_path()),
        );
        self.connection
            .send(&format!("{start_command};*OPC?"), SendOptions::long_operation());

        self.state = if self.instructions.file_size_command.is_some() {
            UploadState::UploadFilesize
        } else {
            UploadState::UploadStart
        };
        self.update_log();
    }

    fn send_file_size(&mut self) {
        if let Some(template) = &self.instructions.file_size_command {
            let command = expand_template(template, "<filesize>", &self.file_length.to_string());
            self.connection
                .send(&format!("{command};*OPC?"), SendOptions::long_operation());
        }
        self.state = UploadState::UploadStart;
        self.update_log();
    }

    fn next_chunk_position(&self) -> usize {
        self.chunk_index * self.instructions.chunk_size
    }

    fn next_chunk_length(&self) -> usize {
        self.instructions
            .chunk_size
            .min(self.file_length - self.next_chunk_position())
    }

    /// Arbitrary-block header: `#`, digit count of the length, length.
    fn next_chunk_header(&self) -> String {
        let length = self.next_chunk_length().to_string();
        format!("#{}{}", length.len(), length)
    }

    /// The chunk bytes as Latin-1 text (one char per byte). File-backed
    /// sessions read from disk here and mirror the bytes into the
    /// in-memory buffer that gets attached to the log on success.
    async fn next_chunk_data(&mut self) -> std::io::Result<String> {
        let position = self.next_chunk_position();
        let length = self.next_chunk_length();

        if let Some(fd) = self.fd.as_mut() {
            let mut block = vec![0u8; length];
            fd.seek(SeekFrom::Start(position as u64)).await?;
            fd.read_exact(&mut block).await?;
            self.file_data[position..position + length].copy_from_slice(&block);
        }

        Ok(self.file_data[position..position + length]
            .iter()
            .map(|&b| char::from(b))
            .collect())
    }

    /// Send the next chunk, or finish once every byte has been sent.
    async fn send_chunk(&mut self) {
        if self.chunk_index > 0
            && self.chunk_index * self.instructions.chunk_size >= self.file_length
        {
            self.finish();
            return;
        }

        match self.next_chunk_data().await {
            Ok(data) => {
                let block = format!("{}{}", self.next_chunk_header(), data);
                let command = expand_template(
                    &self.instructions.send_chunk_command,
                    "<chunk>",
                    &escape_dollars(&block),
                );
                self.connection
                    .send(&format!("{command};*OPC?"), SendOptions::long_operation());
                self.chunk_index += 1;
            }
            Err(io_error) => {
                warn!(%io_error, chunk = self.chunk_index, "chunk read failed");
                self.state = UploadState::Error;
                self.error = Some(OperationError::FileRead.to_string());
            }
        }
        self.update_log();
    }

    fn finish(&mut self) {
        if let Some(template) = &self.instructions.finish_command {
            self.connection
                .send(&format!("{template};*OPC?"), SendOptions::long_operation());
            self.state = UploadState::UploadFinish;
        } else {
            self.state = UploadState::Success;
        }
        self.update_log();
    }

    /// Handle one `;`-separated part of a response line. `1` is the
    /// handshake acknowledgement; anything else provokes a `*OPC?` resync
    /// instead of a failure.
    async fn on_response_part(&mut self, part: &str) {
        if part == "1" {
            match self.state {
                UploadState::UploadFilesize => self.send_file_size(),
                UploadState::UploadStart => {
                    self.state = UploadState::Progress;
                    self.send_chunk().await;
                }
                UploadState::Progress => self.send_chunk().await,
                UploadState::UploadFinish => {
                    self.state = UploadState::Success;
                    self.update_log();
                }
                UploadState::UploadError => {
                    self.state = UploadState::Error;
                    self.update_log();
                }
                _ => {}
            }
        } else {
            debug!(part, "unexpected reply, resynchronizing");
            self.connection.send("*OPC?", SendOptions::long_operation());
        }
    }

    fn on_device_error(&mut self, message: String) {
        warn!(%message, "device reported upload error");
        self.state = UploadState::UploadError;
        self.error = Some(message);
        self.update_log();
    }

    /// The abort template goes out on cancellation and on protocol errors
    /// after the device was engaged.
    fn send_abort_command(&self) {
        if let Some(template) = &self.instructions.abort_command {
            self.connection.send(template, SendOptions::long_operation());
        }
    }

    /// Run the upload to completion, fed from `events`.
    pub async fn run(mut self, mut events: OperationReceiver) -> Result<UploadOutcome, OperationError> {
        self.load_data().await?;
        self.start();

        let mut demux = LineDemux::new();
        let mut watchdog = ResponseWatchdog::default();
        watchdog.arm();

        let error = loop {
            if self.state.is_done() {
                watchdog.disarm();
                break None;
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(OperationEvent::Data(chunk)) => {
                        watchdog.disarm();
                        watchdog.arm();
                        for demuxed in demux.feed(&chunk) {
                            match demuxed {
                                DemuxEvent::Line(line) => {
                                    for part in line.split(';') {
                                        self.on_response_part(part).await;
                                        if self.state.is_done() {
                                            break;
                                        }
                                    }
                                }
                                DemuxEvent::DeviceError(message) => self.on_device_error(message),
                            }
                            if self.state.is_done() {
                                break;
                            }
                        }
                    }
                    Some(OperationEvent::Abort) | None => {
                        watchdog.disarm();
                        self.send_abort_command();
                        self.state = UploadState::Abort;
                        self.update_log();
                        break Some(OperationError::Aborted);
                    }
                },
                () = watchdog.expired() => {
                    let error = match demux.pending_error() {
                        Some(line) => OperationError::Device(line.to_string()),
                        None => match self.error.take() {
                            Some(message) => OperationError::Device(message),
                            None => OperationError::Timeout,
                        },
                    };
                    self.send_abort_command();
                    self.state = UploadState::Error;
                    self.error = Some(error.to_string());
                    self.update_log();
                    break Some(error);
                }
            }
        };

        if let Some(error) = error {
            return Err(error);
        }

        match self.state {
            UploadState::Success => Ok(UploadOutcome {
                log_id: self.log_id,
                destination_file_path: self.instructions.destination_file_path(),
                file_type: self
                    .file_type
                    .clone()
                    .unwrap_or_else(|| detect_file_type(&[], "")),
                data_length: self.file_length,
                surplus: demux.take_surplus(),
            }),
            _ => {
                // Settled in Error through the response path (device error
                // acknowledged, or a chunk read failure mid-transfer).
                self.send_abort_command();
                let message = self
                    .error
                    .clone()
                    .unwrap_or_else(|| OperationError::Timeout.to_string());
                if message == OperationError::FileRead.to_string() {
                    Err(OperationError::FileRead)
                } else {
                    Err(OperationError::Device(message))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::activity_log::MemoryActivityLog;
    use crate::core::connection::operation_channel;
    use crate::core::connection::testing::StubConnection;
    use crate::core::file_type::MIME_DLOG;

    fn instructions(source: UploadSource) -> UploadInstructions {
        UploadInstructions {
            source,
            source_file_type: None,
            destination_file_name: "data.bin".to_string(),
            destination_folder_path: "/Recordings".to_string(),
            start_command: "MMEM:DOWN:FNAM <file>".to_string(),
            file_size_command: None,
            send_chunk_command: "MMEM:DOWN:DATA <chunk>".to_string(),
            finish_command: Some("MMEM:DOWN:FNAM \"\"".to_string()),
            abort_command: Some("MMEM:DOWN:FNAM \"\"".to_string()),
            chunk_size: 1000,
        }
    }

    fn acks(tx: &crate::core::connection::OperationSender, count: usize) {
        for _ in 0..count {
            tx.data("1\r\n");
        }
    }

    #[tokio::test]
    async fn test_upload_chunk_math_and_finish() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let data = Bytes::from(vec![b'x'; 2500]);
        // start ack, 3 chunk acks, finish ack.
        acks(&tx, 5);

        let session = FileUploadSession::new(
            &connection,
            &log,
            "psu-1",
            instructions(UploadSource::Data(data)),
        );
        let outcome = session.run(rx).await.unwrap();

        let sent = connection.sent();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0], "MMEM:DOWN:FNAM \"/Recordings/data.bin\";*OPC?");
        // Chunk boundaries [0,1000), [1000,2000), [2000,2500).
        assert!(sent[1].starts_with("MMEM:DOWN:DATA #41000"));
        assert!(sent[2].starts_with("MMEM:DOWN:DATA #41000"));
        assert!(sent[3].starts_with("MMEM:DOWN:DATA #3500"));
        assert_eq!(sent[4], "MMEM:DOWN:FNAM \"\";*OPC?");

        assert_eq!(outcome.destination_file_path, "/Recordings/data.bin");
        assert_eq!(outcome.surplus, None);

        // Payload attached exactly once on success.
        let stored = log.get(outcome.log_id).unwrap();
        assert_eq!(stored.entry.data.as_ref().map(Bytes::len), Some(2500));
        assert!(stored.entry.message.contains("\"state\":\"success\""));
    }

    #[tokio::test]
    async fn test_upload_filesize_branch() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let mut instructions = instructions(UploadSource::Data(Bytes::from_static(b"abc")));
        instructions.file_size_command = Some("MMEM:DOWN:SIZE <filesize>".to_string());
        instructions.finish_command = None;

        // start ack, filesize ack, one chunk ack, final ack triggers finish.
        acks(&tx, 4);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        session.run(rx).await.unwrap();

        let sent = connection.sent();
        assert_eq!(sent[1], "MMEM:DOWN:SIZE 3;*OPC?");
        assert_eq!(sent[2], "MMEM:DOWN:DATA #13abc;*OPC?");
        assert_eq!(sent.len(), 3);
    }

    #[tokio::test]
    async fn test_upload_dollar_bytes_are_escaped_in_command() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let mut instructions = instructions(UploadSource::Data(Bytes::from_static(b"a$b")));
        instructions.finish_command = None;
        acks(&tx, 3);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        session.run(rx).await.unwrap();

        // expand_template un-escapes $$ while substituting, so the framed
        // block on the wire carries the original single dollar.
        assert_eq!(connection.sent()[1], "MMEM:DOWN:DATA #13a$b;*OPC?");
    }

    #[tokio::test]
    async fn test_upload_binary_chunk_is_latin1_preserved() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let payload = vec![0x00u8, 0x24, 0xff, 0x80, 0x0a];
        let mut instructions = instructions(UploadSource::Data(Bytes::from(payload.clone())));
        instructions.finish_command = None;
        acks(&tx, 3);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        session.run(rx).await.unwrap();

        let command = connection.sent()[1].clone();
        let block: String = command
            .strip_prefix("MMEM:DOWN:DATA #15")
            .unwrap()
            .strip_suffix(";*OPC?")
            .unwrap()
            .to_string();
        let bytes: Vec<u8> = block.chars().map(|c| c as u32 as u8).collect();
        assert_eq!(bytes, payload);
    }

    #[tokio::test]
    async fn test_upload_resync_on_unexpected_reply() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let mut instructions = instructions(UploadSource::Data(Bytes::from_static(b"abc")));
        instructions.finish_command = None;

        tx.data("garbage\r\n");
        acks(&tx, 3);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        session.run(rx).await.unwrap();

        assert_eq!(connection.sent()[1], "*OPC?");
    }

    #[tokio::test]
    async fn test_upload_device_error_then_ack_is_terminal() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        tx.data("**ERROR -120\r\n");
        tx.data("File name error\r\n");
        tx.data("1\r\n");

        let session = FileUploadSession::new(
            &connection,
            &log,
            "psu-1",
            instructions(UploadSource::Data(Bytes::from_static(b"abc"))),
        );
        let error = session.run(rx).await.unwrap_err();
        assert_eq!(error, OperationError::Device("File name error".to_string()));

        // Abort template sent after the device reported the failure.
        assert!(connection
            .sent()
            .contains(&"MMEM:DOWN:FNAM \"\"".to_string()));

        let entries = log.entries();
        assert!(entries[0].entry.message.contains("\"state\":\"error\""));
        assert!(entries[0].entry.message.contains("File name error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_timeout() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (_tx, rx) = operation_channel();

        let session = FileUploadSession::new(
            &connection,
            &log,
            "psu-1",
            instructions(UploadSource::Data(Bytes::from_static(b"abc"))),
        );
        let error = session.run(rx).await.unwrap_err();
        assert_eq!(error, OperationError::Timeout);
    }

    #[tokio::test]
    async fn test_upload_abort() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();
        tx.abort();

        let session = FileUploadSession::new(
            &connection,
            &log,
            "psu-1",
            instructions(UploadSource::Data(Bytes::from_static(b"abc"))),
        );
        let error = session.run(rx).await.unwrap_err();
        assert_eq!(error, OperationError::Aborted);

        let entries = log.entries();
        assert!(entries[0].entry.message.contains("\"state\":\"abort\""));
    }

    #[tokio::test]
    async fn test_upload_missing_file_fails_before_device() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (_tx, rx) = operation_channel();

        let session = FileUploadSession::new(
            &connection,
            &log,
            "psu-1",
            instructions(UploadSource::File(PathBuf::from("/nonexistent/file.bin"))),
        );
        let error = session.run(rx).await.unwrap_err();
        assert_eq!(error, OperationError::FileRead);

        // Never engaged the device: no start, no abort command.
        assert!(connection.sent().is_empty());
        assert!(log.entries()[0]
            .entry
            .message
            .contains("Can't read data from the file"));
    }

    #[tokio::test]
    async fn test_upload_from_disk() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let mut source = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut source, &vec![0xAAu8; 1500]).unwrap();

        let mut instructions = instructions(UploadSource::File(source.path().to_path_buf()));
        instructions.finish_command = None;
        // start ack, 2 chunk acks, final ack.
        acks(&tx, 4);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        let outcome = session.run(rx).await.unwrap();

        let sent = connection.sent();
        assert!(sent[1].starts_with("MMEM:DOWN:DATA #41000"));
        assert!(sent[2].starts_with("MMEM:DOWN:DATA #3500"));
        assert_eq!(outcome.file_type.mime, "application/octet-stream");

        let stored = log.get(outcome.log_id).unwrap();
        assert_eq!(stored.entry.data.as_ref().map(Bytes::len), Some(1500));
    }

    #[tokio::test]
    async fn test_upload_progress_snapshot_fields() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let mut instructions = instructions(UploadSource::Data(Bytes::from(vec![1u8; 1500])));
        instructions.finish_command = None;
        acks(&tx, 4);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        let outcome = session.run(rx).await.unwrap();

        // Final snapshot is success; progress fields were serialized on the
        // way (state machine passed through "progress" updates).
        let stored = log.get(outcome.log_id).unwrap();
        assert!(stored.entry.message.contains("\"dataLength\":1500"));
    }

    #[tokio::test]
    async fn test_terminal_teardown_is_idempotent() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();

        let mut session = FileUploadSession::new(
            &connection,
            &log,
            "psu-1",
            instructions(UploadSource::Data(Bytes::from_static(b"abc"))),
        );
        session.file_data = b"abc".to_vec();
        session.file_length = 3;
        session.fd = Some(File::from_std(tempfile::tempfile().unwrap()));
        session.state = UploadState::Success;

        session.update_log();
        assert!(session.fd.is_none());

        // A second terminal update closes nothing and does not re-attach
        // the payload.
        session.update_log();
        let stored = log.get(session.log_id).unwrap();
        assert_eq!(stored.entry.data.as_deref(), Some(b"abc".as_slice()));
    }

    #[tokio::test]
    async fn test_upload_dlog_source_is_sniffed() {
        let connection = StubConnection::new();
        let log = MemoryActivityLog::new();
        let (tx, rx) = operation_channel();

        let mut data = Vec::new();
        data.extend_from_slice(&crate::core::dlog::DLOG_MAGIC1.to_le_bytes());
        data.extend_from_slice(&crate::core::dlog::DLOG_MAGIC2.to_le_bytes());
        data.extend_from_slice(&[0u8; 24]);

        let mut instructions = instructions(UploadSource::Data(Bytes::from(data)));
        instructions.finish_command = None;
        acks(&tx, 3);

        let session = FileUploadSession::new(&connection, &log, "psu-1", instructions);
        let outcome = session.run(rx).await.unwrap();
        assert_eq!(outcome.file_type.mime, MIME_DLOG);
    }
}

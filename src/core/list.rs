//! SCPI list get/send operations
//!
//! Programmable lists live in three value domains — dwell, voltage,
//! current — and are read or written one domain per command/response
//! exchange, always in that order. Both operation kinds share the same
//! response loop: demux lines, slide the watchdog per data chunk, treat a
//! demuxed device error as fatal, and hand leftover bytes back to the
//! caller once done.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::activity_log::{ActivityLog, LogEntry, LogEntryId, LOG_TYPE_LIST};
use crate::core::connection::{Connection, OperationEvent, OperationReceiver, SendOptions};
use crate::core::demux::{DemuxEvent, LineDemux};
use crate::core::metadata::{ListDigits, MetadataGate};
use crate::core::watchdog::ResponseWatchdog;
use crate::core::OperationError;

/// One value domain of a programmable list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListPhase {
    /// Step durations, in seconds.
    Dwell,
    /// Voltage setpoints.
    Voltage,
    /// Current setpoints.
    Current,
}

impl ListPhase {
    /// Phase name as it appears in the SCPI command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dwell => "dwell",
            Self::Voltage => "voltage",
            Self::Current => "current",
        }
    }

    /// Fixed transition order; `None` after the last phase.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Dwell => Some(Self::Voltage),
            Self::Voltage => Some(Self::Current),
            Self::Current => None,
        }
    }
}

/// Values of all three list phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListData {
    /// Dwell values.
    pub dwell: Vec<f64>,
    /// Voltage values.
    pub voltage: Vec<f64>,
    /// Current values.
    pub current: Vec<f64>,
}

impl ListData {
    /// Values of one phase.
    pub fn phase(&self, phase: ListPhase) -> &[f64] {
        match phase {
            ListPhase::Dwell => &self.dwell,
            ListPhase::Voltage => &self.voltage,
            ListPhase::Current => &self.current,
        }
    }

    fn phase_mut(&mut self, phase: ListPhase) -> &mut Vec<f64> {
        match phase {
            ListPhase::Dwell => &mut self.dwell,
            ListPhase::Voltage => &mut self.voltage,
            ListPhase::Current => &mut self.current,
        }
    }
}

/// Successful result of a list get.
#[derive(Debug, Clone, PartialEq)]
pub struct GetListOutcome {
    /// The values read back, one array per phase.
    pub list_data: ListData,
    /// Activity-log entry recording the read.
    pub log_id: LogEntryId,
    /// Bytes that arrived after the final response line; the caller must
    /// replay them into the next consumer of the connection.
    pub surplus: Option<String>,
}

/// Successful result of a list send. The device acknowledges with bare
/// `*OPC?` replies, so there is no payload beyond the log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SendListOutcome {
    /// Activity-log entry recording the write.
    pub log_id: LogEntryId,
    /// Leftover bytes to replay, as in [`GetListOutcome::surplus`].
    pub surplus: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListLogMessage<'a> {
    operation: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    list_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    list_data: Option<Vec<&'a ListData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn log_list_result(
    log: &dyn ActivityLog,
    oid: &str,
    operation: &'static str,
    list_name: Option<&str>,
    list_data: Option<&ListData>,
    error: Option<&str>,
) -> LogEntryId {
    let message = ListLogMessage {
        operation,
        list_name,
        list_data: list_data.map(|d| vec![d]),
        error,
    };
    let message = serde_json::to_string(&message).unwrap_or_else(|_| "{}".to_string());
    log.log(LogEntry::new(oid, LOG_TYPE_LIST, message))
}

/// Round to a fixed number of fractional digits.
fn round_digits(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// Reads back the dwell/voltage/current lists of one channel.
#[derive(Debug)]
pub struct GetListOperation {
    channel_index: usize,
    phase: Option<ListPhase>,
    list_data: ListData,
}

impl GetListOperation {
    /// Operation for the given zero-based channel.
    pub fn new(channel_index: usize) -> Self {
        Self {
            channel_index,
            phase: Some(ListPhase::Dwell),
            list_data: ListData::default(),
        }
    }

    fn query_command(&self, phase: ListPhase) -> String {
        format!(
            "SOUR{}:LIST:{}?;*OPC?",
            self.channel_index + 1,
            phase.name()
        )
    }

    /// Store one phase response and advance. Returns `true` when all
    /// phases have been read.
    ///
    /// A well-formed reply has two `;`-separated parts, list values and
    /// the `*OPC?` acknowledgement. Anything else stores an empty array
    /// and moves on; a short reply is not an error.
    fn on_line(&mut self, line: &str, connection: &dyn Connection) -> bool {
        let Some(phase) = self.phase else {
            return true;
        };

        let parts: Vec<&str> = line.split(';').collect();
        let values: Vec<f64> = if parts.len() == 2 {
            parts[0]
                .split(',')
                .map(|x| x.trim().parse().unwrap_or(f64::NAN))
                .collect()
        } else {
            warn!(phase = phase.name(), line, "short list reply, storing empty phase");
            Vec::new()
        };
        *self.list_data.phase_mut(phase) = values;

        self.phase = phase.next();
        match self.phase {
            Some(next) => {
                connection.send(&self.query_command(next), SendOptions::long_operation());
                false
            }
            None => true,
        }
    }

    /// Run the operation to completion against `connection`, fed from
    /// `events`.
    pub async fn run(
        mut self,
        connection: &dyn Connection,
        log: &dyn ActivityLog,
        instrument_id: &str,
        mut events: OperationReceiver,
    ) -> Result<GetListOutcome, OperationError> {
        let mut demux = LineDemux::new();
        let mut watchdog = ResponseWatchdog::default();

        connection.send(
            &self.query_command(ListPhase::Dwell),
            SendOptions::long_operation(),
        );
        watchdog.arm();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(OperationEvent::Data(chunk)) => {
                        watchdog.disarm();
                        watchdog.arm();
                        for demuxed in demux.feed(&chunk) {
                            match demuxed {
                                DemuxEvent::Line(line) => {
                                    if self.on_line(&line, connection) {
                                        watchdog.disarm();
                                        debug!(channel = self.channel_index, "list read complete");
                                        let log_id = log_list_result(
                                            log,
                                            instrument_id,
                                            "get",
                                            None,
                                            Some(&self.list_data),
                                            None,
                                        );
                                        return Ok(GetListOutcome {
                                            list_data: self.list_data,
                                            log_id,
                                            surplus: demux.take_surplus(),
                                        });
                                    }
                                }
                                DemuxEvent::DeviceError(message) => {
                                    watchdog.disarm();
                                    return Err(fail_list(
                                        log,
                                        instrument_id,
                                        "get",
                                        None,
                                        OperationError::Device(message),
                                    ));
                                }
                            }
                        }
                    }
                    Some(OperationEvent::Abort) => {
                        watchdog.disarm();
                        return Err(fail_list(log, instrument_id, "get", None, OperationError::Aborted));
                    }
                    None => {
                        watchdog.disarm();
                        return Err(fail_list(log, instrument_id, "get", None, OperationError::Aborted));
                    }
                },
                () = watchdog.expired() => {
                    let error = timeout_error(&demux);
                    return Err(fail_list(log, instrument_id, "get", None, error));
                }
            }
        }
    }
}

/// Writes the dwell/voltage/current lists of one channel.
#[derive(Debug)]
pub struct SendListOperation {
    channel_index: usize,
    list_name: String,
    list_data: ListData,
    phase: Option<ListPhase>,
    digits: ListDigits,
}

impl SendListOperation {
    /// Operation writing `list_data` to the given zero-based channel.
    /// `list_name` only labels the activity-log entry.
    pub fn new(channel_index: usize, list_name: &str, list_data: ListData) -> Self {
        Self {
            channel_index,
            list_name: list_name.to_string(),
            list_data,
            phase: Some(ListPhase::Dwell),
            digits: ListDigits::default(),
        }
    }

    /// Send the command for the current phase, skipping empty phases.
    /// Returns `false` once every remaining phase was empty — the
    /// operation is complete and no acknowledgement is pending.
    fn send_command(&mut self, connection: &dyn Connection) -> bool {
        while let Some(phase) = self.phase {
            let values = self.list_data.phase(phase);
            if values.is_empty() {
                self.phase = phase.next();
                continue;
            }

            let digits = self.digits.for_phase(phase);
            let data = values
                .iter()
                .map(|v| round_digits(*v, digits).to_string())
                .collect::<Vec<_>>()
                .join(",");
            connection.send(
                &format!(
                    "SOUR{}:LIST:{} {};*OPC?",
                    self.channel_index + 1,
                    phase.name(),
                    data
                ),
                SendOptions::long_operation(),
            );
            return true;
        }
        false
    }

    /// Acknowledgement received: advance and send the next phase.
    /// Returns `true` when all phases have been written.
    fn on_line(&mut self, connection: &dyn Connection) -> bool {
        self.phase = self.phase.and_then(|phase| phase.next());
        !self.send_command(connection)
    }

    fn complete(
        &mut self,
        log: &dyn ActivityLog,
        instrument_id: &str,
        demux: &mut LineDemux,
    ) -> SendListOutcome {
        debug!(channel = self.channel_index, list = %self.list_name, "list write complete");
        let log_id = log_list_result(
            log,
            instrument_id,
            "send",
            Some(&self.list_name),
            Some(&self.list_data),
            None,
        );
        SendListOutcome {
            log_id,
            surplus: demux.take_surplus(),
        }
    }

    /// Run the operation. No command is issued before `gate` resolves:
    /// the rounding digits come from instrument metadata that may still be
    /// loading when the operation is requested.
    pub async fn run(
        mut self,
        connection: &dyn Connection,
        log: &dyn ActivityLog,
        instrument_id: &str,
        mut gate: MetadataGate,
        mut events: OperationReceiver,
    ) -> Result<SendListOutcome, OperationError> {
        let list_name = self.list_name.clone();

        let Some(metadata) = gate.ready().await else {
            return Err(fail_list(
                log,
                instrument_id,
                "send",
                Some(&list_name),
                OperationError::MetadataUnavailable,
            ));
        };
        self.digits = metadata.list_digits;

        let mut demux = LineDemux::new();
        let mut watchdog = ResponseWatchdog::default();

        if !self.send_command(connection) {
            // Every phase empty: nothing to transmit, nothing to await.
            return Ok(self.complete(log, instrument_id, &mut demux));
        }
        watchdog.arm();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(OperationEvent::Data(chunk)) => {
                        watchdog.disarm();
                        watchdog.arm();
                        for demuxed in demux.feed(&chunk) {
                            match demuxed {
                                DemuxEvent::Line(_) => {
                                    if self.on_line(connection) {
                                        watchdog.disarm();
                                        return Ok(self.complete(log, instrument_id, &mut demux));
                                    }
                                }
                                DemuxEvent::DeviceError(message) => {
                                    watchdog.disarm();
                                    return Err(fail_list(
                                        log,
                                        instrument_id,
                                        "send",
                                        Some(&list_name),
                                        OperationError::Device(message),
                                    ));
                                }
                            }
                        }
                    }
                    Some(OperationEvent::Abort) | None => {
                        watchdog.disarm();
                        return Err(fail_list(
                            log,
                            instrument_id,
                            "send",
                            Some(&list_name),
                            OperationError::Aborted,
                        ));
                    }
                },
                () = watchdog.expired() => {
                    let error = timeout_error(&demux);
                    return Err(fail_list(log, instrument_id, "send", Some(&list_name), error));
                }
            }
        }
    }
}

/// Timeout reporting: a captured `**ERROR` line takes precedence over the
/// generic message.
fn timeout_error(demux: &LineDemux) -> OperationError {
    match demux.pending_error() {
        Some(line) => OperationError::Device(line.to_string()),
        None => OperationError::Timeout,
    }
}

fn fail_list(
    log: &dyn ActivityLog,
    instrument_id: &str,
    operation: &'static str,
    list_name: Option<&str>,
    error: OperationError,
) -> OperationError {
    warn!(operation, ?error, "list operation failed");
    log_list_result(
        log,
        instrument_id,
        operation,
        list_name,
        None,
        Some(&error.to_string()),
    );
    error
}

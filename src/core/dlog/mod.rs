//! DLOG waveform container decoding
//!
//! DLOG is the binary container instruments write when recording
//! voltage/current/power over time. Two physical layouts share the magic
//! words: version 1 is a fixed 28-byte header with a per-channel column
//! bitmask, version 2 is a tagged-field header. Decoding is pure and
//! byte-exact; unrecognized buffers yield `None` so callers can try other
//! format detectors, and unknown version-2 field tags are skipped by their
//! declared length, never treated as fatal.

mod csv;

pub use csv::{dlog_to_csv, locale_uses_decimal_comma, CsvOptions};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// First magic word, little-endian at offset 0.
pub const DLOG_MAGIC1: u32 = 0x2d5a_4545;
/// Second magic word, little-endian at offset 4.
pub const DLOG_MAGIC2: u32 = 0x474f_4c44;

const DLOG_VERSION1: u16 = 0x0001;
const DLOG_VERSION2: u16 = 0x0002;

// Version-2 field tags.
const FIELD_ID_COMMENT: u8 = 1;
const FIELD_ID_X_UNIT: u8 = 10;
const FIELD_ID_X_STEP: u8 = 11;
const FIELD_ID_X_RANGE_MIN: u8 = 12;
const FIELD_ID_X_RANGE_MAX: u8 = 13;
const FIELD_ID_X_LABEL: u8 = 14;
const FIELD_ID_X_SCALE: u8 = 15;
const FIELD_ID_Y_UNIT: u8 = 30;
const FIELD_ID_Y_RANGE_MIN: u8 = 32;
const FIELD_ID_Y_RANGE_MAX: u8 = 33;
const FIELD_ID_Y_LABEL: u8 = 34;
const FIELD_ID_Y_CHANNEL_INDEX: u8 = 35;
const FIELD_ID_Y_SCALE: u8 = 36;
const FIELD_ID_CHANNEL_MODULE_TYPE: u8 = 50;
const FIELD_ID_CHANNEL_MODULE_REVISION: u8 = 51;

/// Physical unit of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Unmapped firmware unit code.
    Unknown,
    /// Volts.
    Volt,
    /// Amperes.
    Ampere,
    /// Watts.
    Watt,
    /// Seconds.
    Second,
    /// Joules.
    Joule,
}

impl Unit {
    /// Map a firmware unit code. Only a small set of codes is meaningful
    /// for recorded waveforms; everything else is `Unknown`, not an error.
    pub fn from_firmware(code: u8) -> Self {
        match code {
            1 => Self::Volt,
            3 => Self::Ampere,
            6 => Self::Watt,
            8 => Self::Second,
            17 => Self::Joule,
            _ => Self::Unknown,
        }
    }

    /// Display name, used as the CSV header fallback.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Volt => "voltage",
            Self::Ampere => "current",
            Self::Watt => "power",
            Self::Second => "time",
            Self::Joule => "energy",
        }
    }
}

/// Axis scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    /// Linear axis.
    Linear,
    /// Logarithmic axis.
    Logarithmic,
}

impl Scale {
    fn from_byte(value: u8) -> Self {
        if value == 1 {
            Self::Logarithmic
        } else {
            Self::Linear
        }
    }
}

/// Value range of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Range {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

/// The time axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XAxis {
    /// Unit, seconds unless the file says otherwise.
    pub unit: Unit,
    /// Sample step.
    pub step: f64,
    /// Scale.
    pub scale: Scale,
    /// Range.
    pub range: Range,
    /// Label; empty when the file carries none.
    pub label: String,
}

/// One recorded column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YAxis {
    /// Unit.
    pub unit: Unit,
    /// Range, when the file carries one.
    pub range: Option<Range>,
    /// Label, when the file carries one.
    pub label: Option<String>,
    /// Zero-based channel the column was recorded from; -1 when unknown.
    pub channel_index: i32,
}

/// Immutable decoded view of a DLOG buffer.
///
/// Holds only metadata; samples stay in the caller's buffer and are
/// addressed through `data_offset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dlog {
    /// Container version, 1 or 2.
    pub version: u16,
    /// Free-form comment (version 2).
    pub comment: Option<String>,
    /// Time axis.
    pub x_axis: XAxis,
    /// Recorded columns.
    pub y_axes: Vec<YAxis>,
    /// Scale shared by all y axes.
    pub y_axis_scale: Scale,
    /// Byte offset of the first sample row.
    pub data_offset: usize,
    /// Row count, `(len - data_offset) / (4 * columns)`. A fractional
    /// value indicates a truncated file; whether to floor or reject is the
    /// caller's policy.
    pub length: f64,
    /// Recording start time (version 1 only).
    pub start_time: Option<DateTime<Utc>>,
    /// Whether each row leads with a jitter column (version 1 only).
    pub has_jitter_column: bool,
}

impl Dlog {
    /// Floats per sample row, jitter column included.
    pub fn floats_per_row(&self) -> usize {
        usize::from(self.has_jitter_column) + self.y_axes.len()
    }

    /// Row count rounded down to whole rows.
    pub fn row_count(&self) -> usize {
        if self.length.is_finite() && self.length > 0.0 {
            self.length.floor() as usize
        } else {
            0
        }
    }
}

fn read_u8(data: &[u8], i: usize) -> Option<u8> {
    data.get(i).copied()
}

fn read_u16(data: &[u8], i: usize) -> Option<u16> {
    let bytes = data.get(i..i + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], i: usize) -> Option<u32> {
    let bytes = data.get(i..i + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_f32(data: &[u8], i: usize) -> Option<f32> {
    read_u32(data, i).map(f32::from_bits)
}

fn read_string(data: &[u8], start: usize, end: usize) -> Option<String> {
    let bytes = data.get(start..end)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Is the buffer a DLOG container?
pub fn is_dlog(data: &[u8]) -> bool {
    decode_dlog(data).is_some()
}

/// Decode a DLOG buffer. `None` means "not a DLOG" — unrecognized magics,
/// version, or a header too short to validate.
pub fn decode_dlog(data: &[u8]) -> Option<Dlog> {
    if read_u32(data, 0)? != DLOG_MAGIC1 || read_u32(data, 4)? != DLOG_MAGIC2 {
        return None;
    }

    let version = read_u16(data, 8)?;
    if version != DLOG_VERSION1 && version != DLOG_VERSION2 {
        return None;
    }

    let mut dlog = Dlog {
        version,
        comment: None,
        x_axis: XAxis {
            unit: Unit::Second,
            step: 1.0,
            scale: Scale::Linear,
            range: Range { min: 0.0, max: 1.0 },
            label: String::new(),
        },
        y_axes: Vec::new(),
        y_axis_scale: Scale::Linear,
        data_offset: 0,
        length: 0.0,
        start_time: None,
        has_jitter_column: false,
    };

    if version == DLOG_VERSION1 {
        dlog.data_offset = 28;
        dlog.x_axis.step = f64::from(read_f32(data, 16)?);
        read_columns(data, &mut dlog.y_axes)?;
        dlog.start_time = Utc
            .timestamp_opt(i64::from(read_u32(data, 24)?), 0)
            .single();
        dlog.has_jitter_column = read_u16(data, 10)? & 0x0001 != 0;
    } else {
        dlog.data_offset = read_u32(data, 12)? as usize;
        read_fields(data, &mut dlog);
    }

    dlog.length = (data.len() as f64 - dlog.data_offset as f64)
        / (4.0 * dlog.floats_per_row() as f64);

    Some(dlog)
}

/// Version-1 column bitmask: four bits per channel, of which the low three
/// select voltage, current and power columns, appended in channel order.
fn read_columns(data: &[u8], y_axes: &mut Vec<YAxis>) -> Option<()> {
    let columns = read_u32(data, 12)?;
    for channel in 0..8 {
        for (bit, unit) in [(1, Unit::Volt), (2, Unit::Ampere), (4, Unit::Watt)] {
            if columns & (bit << (4 * channel)) != 0 {
                y_axes.push(YAxis {
                    unit,
                    range: None,
                    label: None,
                    channel_index: channel,
                });
            }
        }
    }
    Some(())
}

/// Version-2 tagged fields, starting at offset 16 and running until a zero
/// length, the start of sample data, or a truncated read.
///
/// Y-axis fields lead with a 1-based axis index; index 0 addresses a
/// shared default-template axis, and referencing an axis past the end of
/// the list materializes the missing entries as copies of that template.
/// The off-by-one and the index-0 special case are part of the format.
fn read_fields(data: &[u8], dlog: &mut Dlog) {
    let mut template = YAxis {
        unit: Unit::Unknown,
        range: Some(Range { min: 0.0, max: 1.0 }),
        label: Some(String::new()),
        channel_index: -1,
    };

    let mut offset = 16usize;
    while offset < dlog.data_offset {
        let Some(field_length) = read_u16(data, offset) else {
            break;
        };
        if field_length == 0 {
            break;
        }
        offset += 2;

        let Some(field_id) = read_u8(data, offset) else {
            break;
        };
        offset += 1;

        let mut field_data_length = usize::from(field_length).saturating_sub(3);

        match field_id {
            FIELD_ID_COMMENT => {
                dlog.comment = read_string(data, offset, offset + field_data_length);
                offset += field_data_length;
            }
            FIELD_ID_X_UNIT => {
                if let Some(code) = read_u8(data, offset) {
                    dlog.x_axis.unit = Unit::from_firmware(code);
                }
                offset += 1;
            }
            FIELD_ID_X_STEP => {
                if let Some(step) = read_f32(data, offset) {
                    dlog.x_axis.step = f64::from(step);
                }
                offset += 4;
            }
            FIELD_ID_X_RANGE_MIN => {
                if let Some(min) = read_f32(data, offset) {
                    dlog.x_axis.range.min = f64::from(min);
                }
                offset += 4;
            }
            FIELD_ID_X_RANGE_MAX => {
                if let Some(max) = read_f32(data, offset) {
                    dlog.x_axis.range.max = f64::from(max);
                }
                offset += 4;
            }
            FIELD_ID_X_LABEL => {
                if let Some(label) = read_string(data, offset, offset + field_data_length) {
                    dlog.x_axis.label = label;
                }
                offset += field_data_length;
            }
            FIELD_ID_X_SCALE => {
                if let Some(scale) = read_u8(data, offset) {
                    dlog.x_axis.scale = Scale::from_byte(scale);
                }
                offset += 1;
            }
            FIELD_ID_Y_UNIT..=FIELD_ID_Y_CHANNEL_INDEX => {
                let Some(raw_index) = read_u8(data, offset) else {
                    break;
                };
                offset += 1;
                field_data_length = field_data_length.saturating_sub(1);

                let y_axis_index = i32::from(raw_index) - 1;
                while y_axis_index >= dlog.y_axes.len() as i32 {
                    dlog.y_axes.push(template.clone());
                }

                let dest = if y_axis_index >= 0 {
                    &mut dlog.y_axes[y_axis_index as usize]
                } else {
                    &mut template
                };

                match field_id {
                    FIELD_ID_Y_UNIT => {
                        if let Some(code) = read_u8(data, offset) {
                            dest.unit = Unit::from_firmware(code);
                        }
                        offset += 1;
                    }
                    FIELD_ID_Y_RANGE_MIN => {
                        if let Some(min) = read_f32(data, offset) {
                            dest.range.get_or_insert(Range { min: 0.0, max: 1.0 }).min =
                                f64::from(min);
                        }
                        offset += 4;
                    }
                    FIELD_ID_Y_RANGE_MAX => {
                        if let Some(max) = read_f32(data, offset) {
                            dest.range.get_or_insert(Range { min: 0.0, max: 1.0 }).max =
                                f64::from(max);
                        }
                        offset += 4;
                    }
                    FIELD_ID_Y_LABEL => {
                        if let Some(label) =
                            read_string(data, offset, offset + field_data_length)
                        {
                            dest.label = Some(label);
                        }
                        offset += field_data_length;
                    }
                    FIELD_ID_Y_CHANNEL_INDEX => {
                        if let Some(raw) = read_u8(data, offset) {
                            dest.channel_index = i32::from(raw) - 1;
                        }
                        offset += 1;
                    }
                    _ => {
                        // In-range but unassigned tag: skip its payload.
                        offset += field_data_length;
                    }
                }
            }
            FIELD_ID_Y_SCALE => {
                if let Some(scale) = read_u8(data, offset) {
                    dlog.y_axis_scale = Scale::from_byte(scale);
                }
                offset += 1;
            }
            FIELD_ID_CHANNEL_MODULE_TYPE | FIELD_ID_CHANNEL_MODULE_REVISION => {
                // Channel index byte and module type/revision word,
                // recorded by the firmware but unused here.
                offset += 3;
            }
            _ => {
                // Unknown field, skip by declared length.
                offset += field_data_length;
            }
        }
    }
}

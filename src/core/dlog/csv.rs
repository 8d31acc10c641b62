//! DLOG → CSV conversion
//!
//! Renders the sample matrix as UTF-8 text for spreadsheet import. The
//! field separator follows the convention spreadsheet software expects:
//! locales that write decimals with a comma get `;`, everyone else gets
//! `,`. Values always use `.` as the decimal point; only the field
//! separator is locale-dependent, so the output is reproducible for a
//! given locale and input buffer.

use super::{decode_dlog, read_f32};

/// Languages whose number formatting uses a decimal comma. Matching is by
/// primary language subtag; regional exceptions (e.g. `es-MX`) are not
/// tracked.
const DECIMAL_COMMA_LANGUAGES: &[&str] = &[
    "af", "az", "be", "bg", "bs", "ca", "cs", "da", "de", "el", "es", "et", "eu", "fi", "fr",
    "gl", "hr", "hu", "hy", "id", "is", "it", "ka", "kk", "lt", "lv", "mk", "nb", "nl", "nn",
    "no", "pl", "pt", "ro", "ru", "sk", "sl", "sq", "sr", "sv", "tr", "uk", "vi",
];

/// Whether a BCP-47-ish locale tag renders `0.1` with a decimal comma.
pub fn locale_uses_decimal_comma(tag: &str) -> bool {
    let language = tag
        .split(['-', '_', '.'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    DECIMAL_COMMA_LANGUAGES.contains(&language.as_str())
}

/// CSV rendering options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    /// Field separator.
    pub separator: char,
}

impl CsvOptions {
    /// Separator chosen for a locale tag: `;` for decimal-comma locales,
    /// `,` otherwise.
    pub fn for_locale(tag: &str) -> Self {
        Self {
            separator: if locale_uses_decimal_comma(tag) { ';' } else { ',' },
        }
    }
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self { separator: ',' }
    }
}

/// Convert a DLOG buffer to CSV. `None` when the buffer is not a DLOG.
///
/// One column per y axis, headed by the axis label (unit name when the
/// label is missing or empty); the jitter column of version-1 files is
/// skipped; values carry six decimal digits; rows end in `\n`. A
/// fractional row count is floored.
pub fn dlog_to_csv(data: &[u8], options: &CsvOptions) -> Option<String> {
    let dlog = decode_dlog(data)?;

    let separator = options.separator;
    let floats_per_row = dlog.floats_per_row();
    let first_column = usize::from(dlog.has_jitter_column);

    let mut csv = String::new();

    for (index, y_axis) in dlog.y_axes.iter().enumerate() {
        if index > 0 {
            csv.push(separator);
        }
        match y_axis.label.as_deref() {
            Some(label) if !label.is_empty() => csv.push_str(label),
            _ => csv.push_str(y_axis.unit.name()),
        }
    }
    csv.push('\n');

    for row in 0..dlog.row_count() {
        for column in 0..dlog.y_axes.len() {
            if column > 0 {
                csv.push(separator);
            }
            let offset =
                dlog.data_offset + 4 * (row * floats_per_row + first_column + column);
            let value = read_f32(data, offset).unwrap_or(0.0);
            csv.push_str(&format!("{value:.6}"));
        }
        csv.push('\n');
    }

    Some(csv)
}

//! Line demultiplexer for instrument response streams
//!
//! Splits raw response fragments into discrete lines and detects in-band
//! `**ERROR` markers. Devices echo the human-readable error description on
//! the line *after* the one carrying the marker, so error delivery is a
//! two-step affair: the marker line arms a pending-error flag and the next
//! extracted line is delivered through the error path instead of the normal
//! line path. This is a documented quirk of the device firmware and must
//! not be "fixed".

/// Marker substring a device places in a response line to signal an error.
pub const ERROR_MARKER: &str = "**ERROR";

/// A demultiplexed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// A complete, non-error response line.
    Line(String),
    /// The line following an `**ERROR` marker, i.e. the error description.
    DeviceError(String),
}

/// Stateful line splitter with in-band error detection.
///
/// Feed it response fragments as they arrive; chunk boundaries are
/// arbitrary and a single fragment may complete zero, one or many lines.
/// The sequence of events produced is independent of how the stream was
/// chunked.
#[derive(Debug, Default)]
pub struct LineDemux {
    buffer: String,
    pending_error: Option<String>,
    // A line ended in `\r` at a chunk boundary; its `\n` is still in
    // flight and must be dropped when it arrives.
    skip_newline: bool,
}

impl LineDemux {
    /// Create an empty demultiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and extract every completed line.
    ///
    /// Extraction stops after a `DeviceError` event; the owning operation
    /// is terminal at that point and anything still buffered is surplus.
    pub fn feed(&mut self, chunk: &str) -> Vec<DemuxEvent> {
        let chunk = if std::mem::take(&mut self.skip_newline) {
            chunk.strip_prefix('\n').unwrap_or(chunk)
        } else {
            chunk
        };
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(line) = self.next_line() {
            if line.is_empty() {
                continue;
            }

            if self.pending_error.is_some() {
                self.pending_error = None;
                events.push(DemuxEvent::DeviceError(line));
                break;
            }

            if line.contains(ERROR_MARKER) {
                self.pending_error = Some(line);
            } else {
                events.push(DemuxEvent::Line(line));
            }
        }
        events
    }

    /// Extract one line from the accumulator, if a terminator is present.
    ///
    /// `\r` wins over `\n`; the remainder starts two characters after a
    /// `\r` (the stream frames lines with `\r\n`) and one character after
    /// a bare `\n`.
    fn next_line(&mut self) -> Option<String> {
        if let Some(i) = self.buffer.find('\r') {
            let line = self.buffer[..i].to_string();
            // One character past the `\r` is consumed unconditionally, the
            // assumed `\n` of a `\r\n` pair. When the `\r` is the last
            // buffered character, remember to drop the `\n` from the next
            // chunk instead.
            match self.buffer[i + 1..].chars().next() {
                Some(next) => self.buffer = self.buffer[i + 1 + next.len_utf8()..].to_string(),
                None => {
                    self.buffer.clear();
                    self.skip_newline = true;
                }
            }
            Some(line)
        } else if let Some(i) = self.buffer.find('\n') {
            let line = self.buffer[..i].to_string();
            self.buffer = self.buffer[i + 1..].to_string();
            Some(line)
        } else {
            None
        }
    }

    /// The line that carried the `**ERROR` marker, while its description
    /// line has not arrived yet. Reported on timeout in place of the
    /// generic message.
    pub fn pending_error(&self) -> Option<&str> {
        self.pending_error.as_deref()
    }

    /// Take whatever arrived after the operation completed, for the caller
    /// to replay into the next consumer of the connection.
    pub fn take_surplus(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(events: &[DemuxEvent]) -> Vec<&str> {
        events
            .iter()
            .map(|e| match e {
                DemuxEvent::Line(l) => l.as_str(),
                DemuxEvent::DeviceError(l) => l.as_str(),
            })
            .collect()
    }

    #[test]
    fn test_crlf_and_lf_framing() {
        let mut demux = LineDemux::new();
        let events = demux.feed("alpha\r\nbeta\ngamma");
        assert_eq!(lines(&events), vec!["alpha", "beta"]);
        let events = demux.feed("\r\n");
        assert_eq!(lines(&events), vec!["gamma"]);
    }

    #[test]
    fn test_split_between_cr_and_lf() {
        let mut demux = LineDemux::new();
        let events = demux.feed("first\r");
        assert_eq!(lines(&events), vec!["first"]);
        let events = demux.feed("\nsecond\r\n");
        assert_eq!(lines(&events), vec!["second"]);
    }

    #[test]
    fn test_chunking_is_transparent() {
        let stream = "1.5,2.5;1\r\n0.5;1\r\nlast\n";

        let mut whole = LineDemux::new();
        let expected = whole.feed(stream);

        // Re-feed the same stream one character at a time.
        let mut split = LineDemux::new();
        let mut collected = Vec::new();
        for ch in stream.chars() {
            collected.extend(split.feed(&ch.to_string()));
        }
        assert_eq!(collected, expected);
        assert_eq!(lines(&expected), vec!["1.5,2.5;1", "0.5;1", "last"]);
    }

    #[test]
    fn test_two_step_error_association() {
        let mut demux = LineDemux::new();
        let events = demux.feed("**ERROR -100\r\n");
        assert!(events.is_empty());
        assert_eq!(demux.pending_error(), Some("**ERROR -100"));

        let events = demux.feed("Voltage out of range\r\n");
        assert_eq!(
            events,
            vec![DemuxEvent::DeviceError("Voltage out of range".to_string())]
        );
        assert_eq!(demux.pending_error(), None);
    }

    #[test]
    fn test_error_marker_line_is_not_a_normal_line() {
        let mut demux = LineDemux::new();
        let events = demux.feed("ok\r\n**ERROR 42\r\ndetail\r\n");
        assert_eq!(
            events,
            vec![
                DemuxEvent::Line("ok".to_string()),
                DemuxEvent::DeviceError("detail".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_lines_are_dropped() {
        let mut demux = LineDemux::new();
        let events = demux.feed("\r\n\r\none\r\n");
        assert_eq!(lines(&events), vec!["one"]);
    }

    #[test]
    fn test_surplus_after_completion() {
        let mut demux = LineDemux::new();
        demux.feed("done\r\ntrailing");
        assert_eq!(demux.take_surplus(), Some("trailing".to_string()));
        assert_eq!(demux.take_surplus(), None);
    }
}

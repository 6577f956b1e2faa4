//! Alarm channel framing and record parsing.
//!
//! The camera pushes XML records terminated by a fixed end marker. Reads can
//! split a record or carry several at once, so bytes are buffered until a
//! marker is seen.

use regex::Regex;
use std::sync::OnceLock;

/// End marker of one record on the camera's event port.
pub const DEFAULT_END_MARKER: &[u8] = b"</XML_TOPSEE>";

/// Records are small; a buffer this large without a marker is garbage.
const MAX_BUFFERED: usize = 1 << 20;

const ALARM_MESSAGE_TAG: &str = "ALARM_REPORT_MESSAGE";

/// Splits a byte stream into end-marker-delimited messages.
#[derive(Debug)]
pub struct MessageFramer {
    buf: Vec<u8>,
    end_marker: Vec<u8>,
}

impl MessageFramer {
    pub fn new(end_marker: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: Vec::new(),
            end_marker: end_marker.into(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_BUFFERED && self.find_marker().is_none() {
            tracing::warn!(bytes = self.buf.len(), "discarding oversized unterminated event data");
            self.buf.clear();
        }
    }

    /// Oldest complete message, marker included.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        let end = self.find_marker()? + self.end_marker.len();
        let rest = self.buf.split_off(end);
        Some(std::mem::replace(&mut self.buf, rest))
    }

    /// Bytes held back waiting for an end marker.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn find_marker(&self) -> Option<usize> {
        if self.end_marker.is_empty() {
            return None;
        }
        self.buf
            .windows(self.end_marker.len())
            .position(|w| w == self.end_marker.as_slice())
    }
}

/// Fields of one alarm report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlarmEvent {
    pub code: Option<String>,
    pub flag: Option<String>,
    pub data: Option<String>,
}

fn attribute_regexes() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r#"Alarm_code="(\d+)""#).expect("static regex"),
            Regex::new(r#"Alarm_flag="(\d+)""#).expect("static regex"),
            Regex::new(r#"Alarm_data="([^"]*)""#).expect("static regex"),
        ]
    })
}

impl AlarmEvent {
    /// Parse a framed record; `None` for anything that is not an alarm report.
    pub fn parse(message: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(message);
        if !text.contains(ALARM_MESSAGE_TAG) {
            return None;
        }

        let [code, flag, data] = attribute_regexes();
        let capture = |re: &Regex| re.captures(&text).map(|c| c[1].to_string());

        Some(Self {
            code: capture(code),
            flag: capture(flag),
            data: capture(data),
        })
    }

    /// True when the alarm flag equals the configured trigger value.
    pub fn is_triggered(&self, alarm_flag: &str) -> bool {
        self.flag.as_deref() == Some(alarm_flag)
    }
}

use snafu::ResultExt;

use super::error::{InvalidUtf8Snafu, ProtocolError};

/// Splits a chunked byte stream into complete text lines.
///
/// Bytes after the last `\n` stay in a carry-over buffer until the next push, so a
/// multi-byte character or a record split across reads is reassembled before it is
/// decoded. Splitting on the `\n` byte is safe for UTF-8 input because the byte never
/// occurs inside a multi-byte sequence.
#[derive(Debug, Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
    lines_emitted: usize,
}

/// One complete line with its 1-based position in the stream.
pub type DecodedLine = (usize, Result<String, ProtocolError>);

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<DecodedLine> {
        self.carry.extend_from_slice(bytes);

        let Some(last_newline) = self.carry.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let remainder = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, remainder);

        complete
            .split(|byte| *byte == b'\n')
            // The final split after the trailing newline is always empty.
            .take(complete.iter().filter(|byte| **byte == b'\n').count())
            .map(|line| self.emit(line.to_vec()))
            .collect()
    }

    /// Flushes a final unterminated line, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<DecodedLine> {
        if self.carry.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.carry);
        Some(self.emit(line))
    }

    /// Bytes still waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    fn emit(&mut self, mut line: Vec<u8>) -> DecodedLine {
        self.lines_emitted += 1;
        let line_number = self.lines_emitted;

        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let text = String::from_utf8(line).context(InvalidUtf8Snafu {
            stage: "decode-line-utf8",
            line_number,
        });
        (line_number, text)
    }
}

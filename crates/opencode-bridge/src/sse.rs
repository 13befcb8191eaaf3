// SPDX-License-Identifier: MIT OR Apache-2.0
//! Minimal server-sent-events parsing: `data:` accumulation, blank-line
//! dispatch, comment and field tolerance.

/// Incremental SSE parser fed one line at a time.
#[derive(Debug, Default)]
pub struct SseParser {
    data: String,
}

impl SseParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline).
    ///
    /// Returns the joined `data` payload when the line completes an event.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.data));
        }

        // Comments and non-data fields (event:, id:, retry:) are skipped.
        if line.starts_with(':') {
            return None;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        None
    }
}

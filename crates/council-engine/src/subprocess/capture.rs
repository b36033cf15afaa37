//! Bounded capture of a child's stdout.
//!
//! Output is buffered in memory until it would exceed the cap. From then on
//! everything seen so far and everything after goes to a temporary file, and
//! memory holds only a sliding window of the last `max_chars` characters.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

/// Prefixed to output that was cut down to its tail.
pub const OUTPUT_TRUNCATION_NOTICE: &str = "[... earlier output truncated ...]";

#[derive(Debug)]
pub struct OutputCapture {
    max_chars: usize,
    window: String,
    window_chars: usize,
    total_chars: usize,
    spill: Option<NamedTempFile>,
}

impl OutputCapture {
    pub const fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            window: String::new(),
            window_chars: 0,
            total_chars: 0,
            spill: None,
        }
    }

    /// Append one chunk (normally a line including its newline).
    pub fn push(&mut self, chunk: &str) -> std::io::Result<()> {
        let chunk_chars = chunk.chars().count();
        self.total_chars += chunk_chars;

        if self.spill.is_none() && self.window_chars + chunk_chars > self.max_chars {
            let mut file = NamedTempFile::new()?;
            file.write_all(self.window.as_bytes())?;
            debug!(
                path = %file.path().display(),
                max_chars = self.max_chars,
                "Output above cap, spilling to temporary file"
            );
            self.spill = Some(file);
        }
        if let Some(file) = self.spill.as_mut() {
            file.write_all(chunk.as_bytes())?;
        }

        self.window.push_str(chunk);
        self.window_chars += chunk_chars;
        if self.window_chars > self.max_chars {
            let excess = self.window_chars - self.max_chars;
            let cut = self
                .window
                .char_indices()
                .nth(excess)
                .map_or(self.window.len(), |(idx, _)| idx);
            self.window.drain(..cut);
            self.window_chars = self.max_chars;
        }
        Ok(())
    }

    pub const fn is_truncated(&self) -> bool {
        self.spill.is_some()
    }

    pub const fn total_chars(&self) -> usize {
        self.total_chars
    }

    /// Location of the spill file while the capture is alive.
    pub fn spill_path(&self) -> Option<&Path> {
        self.spill.as_ref().map(NamedTempFile::path)
    }

    /// Full output, or the retained tail behind the truncation notice.
    /// Dropping the capture removes the spill file.
    pub fn finish(self) -> String {
        if self.is_truncated() {
            format!("{OUTPUT_TRUNCATION_NOTICE}\n{}", self.window.trim())
        } else {
            self.window.trim().to_string()
        }
    }
}

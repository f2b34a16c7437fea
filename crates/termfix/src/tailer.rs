//! Tail-from-end line source over a growing capture file.
//!
//! The monitored terminal pipes its output into a log file (`script -f` or
//! a `Tee-Object` pipeline); this module follows that file the way
//! `tail -f` would. Pre-existing content is skipped, appended bytes are
//! split into complete lines, ANSI escape sequences are stripped, and the
//! stream never ends on its own - transient read errors are logged and
//! retried.

use anyhow::{Context, Result};
use regex::Regex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Configuration for the line source.
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Poll interval between size checks
    pub poll_interval: Duration,
    /// How long to wait for the file to appear before giving up
    pub create_timeout: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            create_timeout: Duration::from_secs(30),
        }
    }
}

/// Follows a growing log file, yielding complete appended lines.
pub struct LineSource {
    path: PathBuf,
    file: File,
    offset: u64,
    /// Trailing bytes of an incomplete line, held until its newline lands
    partial: Vec<u8>,
    ansi: Regex,
}

impl LineSource {
    /// Open the capture file, waiting up to `create_timeout` for the
    /// external process to create it, and seek to the current end so only
    /// new output is observed.
    ///
    /// # Errors
    /// Returns an error if the file does not appear within the timeout.
    pub async fn open(path: &Path, config: &TailConfig) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + config.create_timeout;
        while !path.exists() {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "capture file {} was not created within {:?} - was the capture command run?",
                    path.display(),
                    config.create_timeout
                );
            }
            tokio::time::sleep(config.poll_interval).await;
        }

        let mut file = File::open(path)
            .await
            .with_context(|| format!("Failed to open capture file {}", path.display()))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .await
            .context("Failed to seek to end of capture file")?;

        debug!(path = %path.display(), offset, "Tailing capture file");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            offset,
            partial: Vec::new(),
            ansi: ansi_pattern(),
        })
    }

    /// Read whatever complete lines have been appended since the last
    /// poll. Returns an empty vec when nothing new arrived. I/O hiccups
    /// are transient: they log, reset the handle where needed, and yield
    /// an empty batch rather than an error.
    pub async fn poll_lines(&mut self) -> Vec<String> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Capture file unreadable, retrying");
                return Vec::new();
            }
        };

        // Truncation (capture restarted): re-follow from the new end
        if size < self.offset {
            warn!(path = %self.path.display(), "Capture file shrank, re-seeking to end");
            if let Err(e) = self.reopen_at_end().await {
                warn!(error = %e, "Failed to reopen capture file");
            }
            return Vec::new();
        }

        if size == self.offset {
            return Vec::new();
        }

        let Ok(len) = usize::try_from(size - self.offset) else {
            warn!(path = %self.path.display(), "Appended region too large for one read");
            return Vec::new();
        };
        let mut chunk = vec![0u8; len];
        let read = async {
            self.file.seek(SeekFrom::Start(self.offset)).await?;
            self.file.read_exact(&mut chunk).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = read {
            warn!(path = %self.path.display(), error = %e, "Transient read failure, retrying");
            return Vec::new();
        }
        self.offset = size;

        self.split_lines(&chunk)
    }

    /// Split a freshly read chunk into complete lines, carrying any
    /// trailing partial line over to the next poll.
    fn split_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut buffer = std::mem::take(&mut self.partial);
        buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, byte) in buffer.iter().enumerate() {
            if *byte == b'\n' {
                let raw = String::from_utf8_lossy(&buffer[start..i]);
                let clean = self.clean_line(&raw);
                if !clean.is_empty() {
                    lines.push(clean);
                }
                start = i + 1;
            }
        }
        self.partial = buffer[start..].to_vec();
        lines
    }

    /// Strip ANSI escape sequences and trailing control characters.
    fn clean_line(&self, raw: &str) -> String {
        let stripped = self.ansi.replace_all(raw, "");
        stripped
            .trim_end_matches(['\r', '\u{7}', '\u{8}'])
            .trim_end()
            .to_string()
    }

    async fn reopen_at_end(&mut self) -> Result<()> {
        let mut file = File::open(&self.path).await?;
        self.offset = file.seek(SeekFrom::End(0)).await?;
        self.file = file;
        self.partial.clear();
        Ok(())
    }
}

/// Regex matching ANSI escape sequences (CSI and two-byte forms).
pub(crate) fn ansi_pattern() -> Regex {
    Regex::new(r"\x1b(?:[@-Z\\_\-]|\[[0-?]*[ -/]*[@-~])").unwrap()
}

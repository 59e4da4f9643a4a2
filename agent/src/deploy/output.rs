//! Append-only output buffer, one per deployment

use std::sync::RwLock;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::AgentError;
use crate::filesys::file::File;

/// Lines kept in memory; older lines remain in the log file only
pub const DEFAULT_MAX_LINES: usize = 5_000;

#[derive(Debug, Default)]
struct Lines {
    /// Absolute index of `lines[0]`
    base: u64,
    lines: Vec<String>,
}

/// Single writer, many readers. Readers never wait on the writer's file I/O.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: RwLock<Lines>,
    log_file: Option<File>,
    writer: Mutex<Option<fs::File>>,
    max_lines: usize,
}

impl OutputBuffer {
    /// Memory-only buffer
    pub fn in_memory() -> Self {
        Self {
            lines: RwLock::new(Lines::default()),
            log_file: None,
            writer: Mutex::new(None),
            max_lines: DEFAULT_MAX_LINES,
        }
    }

    /// Buffer mirrored to `log_file`, appending to what is already there
    pub async fn open(log_file: File) -> Result<Self, AgentError> {
        let mut lines = Lines::default();
        if let Some(existing) = log_file.read_string_opt().await? {
            lines.lines = existing.lines().map(String::from).collect();
        }
        let buffer = Self {
            lines: RwLock::new(lines),
            log_file: Some(log_file),
            writer: Mutex::new(None),
            max_lines: DEFAULT_MAX_LINES,
        };
        buffer.trim();
        Ok(buffer)
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines.max(1);
        self.trim();
        self
    }

    /// Append one line
    pub async fn push(&self, line: impl Into<String>) {
        let line = line.into();
        let mut writer = self.writer.lock().await;

        if let Some(log_file) = &self.log_file {
            if let Err(e) = self.write_line(&mut writer, log_file, &line).await {
                warn!("Failed to append to {}: {}", log_file.path().display(), e);
            }
        }

        {
            let mut lines = self.lines.write().unwrap_or_else(|e| e.into_inner());
            lines.lines.push(line);
        }
        self.trim();
    }

    async fn write_line(
        &self,
        writer: &mut Option<fs::File>,
        log_file: &File,
        line: &str,
    ) -> Result<(), AgentError> {
        if writer.is_none() {
            if let Some(parent) = log_file.path().parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file.path())
                .await?;
            *writer = Some(file);
        }
        if let Some(file) = writer.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        Ok(())
    }

    fn trim(&self) {
        let mut lines = self.lines.write().unwrap_or_else(|e| e.into_inner());
        if lines.lines.len() > self.max_lines {
            let excess = lines.lines.len() - self.max_lines;
            lines.lines.drain(..excess);
            lines.base += excess as u64;
        }
    }

    /// Total lines ever pushed; the cursor for `since`
    pub fn cursor(&self) -> u64 {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        lines.base + lines.lines.len() as u64
    }

    /// Last `n` lines
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        let start = lines.lines.len().saturating_sub(n);
        lines.lines[start..].to_vec()
    }

    /// Lines after `cursor`, and the new cursor. Lines that fell out of
    /// memory are skipped.
    pub fn since(&self, cursor: u64) -> (Vec<String>, u64) {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        let end = lines.base + lines.lines.len() as u64;
        let start = cursor.clamp(lines.base, end);
        let offset = (start - lines.base) as usize;
        (lines.lines[offset..].to_vec(), end)
    }
}

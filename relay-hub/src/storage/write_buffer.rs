//! Pending durable-log lines.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 WriteBuffer                   │
//! │                                              │
//! │  lines: [ "[t0] a" | "[t1] b" | "[t2] c" ]   │
//! │                                              │
//! │  stage()  → copy of the first N lines, joined│
//! │  commit() → drop exactly those N lines       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Staging does not remove anything. Lines leave the buffer only when the
//! caller commits after a successful write, so a failed write is retried on
//! the next cycle and lines enqueued while a write is in flight are kept for
//! the next one.

use crate::protocol::{log_line, Payload};

/// A contiguous block of pending lines ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBlock {
    /// Number of buffered lines this block covers
    pub lines: usize,
    /// Newline-joined lines with a trailing newline
    pub block: String,
}

impl StagedBlock {
    pub fn len_bytes(&self) -> usize {
        self.block.len()
    }
}

#[derive(Debug, Default)]
pub struct WriteBuffer {
    lines: Vec<String>,
    total_enqueued: u64,
    total_flushed: u64,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the formatted log line for `payload`.
    ///
    /// Returns the number of pending lines after the append.
    pub fn enqueue(&mut self, payload: &Payload, timestamp_ms: u64) -> usize {
        self.lines.push(log_line(payload, timestamp_ms));
        self.total_enqueued += 1;
        self.lines.len()
    }

    /// Snapshot everything currently pending. `None` when empty.
    pub fn stage(&self) -> Option<StagedBlock> {
        if self.lines.is_empty() {
            return None;
        }
        let mut block = self.lines.join("\n");
        block.push('\n');
        Some(StagedBlock {
            lines: self.lines.len(),
            block,
        })
    }

    /// Drop the lines covered by a block that was written successfully.
    pub fn commit(&mut self, staged: &StagedBlock) {
        let count = staged.lines.min(self.lines.len());
        self.lines.drain(..count);
        self.total_flushed += count as u64;
    }

    pub fn pending(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    pub fn total_flushed(&self) -> u64 {
        self.total_flushed
    }
}

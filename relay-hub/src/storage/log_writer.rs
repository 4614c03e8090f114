//! Periodic durable-log writer.
//!
//! Flush cycle:
//! ```text
//! Idle ──tick──► CheckEligibility ──no connections / empty──► Idle
//!                      │
//!                      └──► Flushing ──ok──► commit lines ──► Idle
//!                                  └──err──► keep lines   ──► Idle (retry next tick)
//! ```
//!
//! The sink lock is held for the whole cycle, so two cycles can never issue
//! overlapping appends. The timer only drives [`DurableLogWriter::flush_if_due`];
//! tests call it directly.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};

use super::write_buffer::WriteBuffer;
use crate::registry::ConnectionRegistry;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("failed to open durable log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("durable log append failed ({pending} lines kept for retry): {source}")]
    Write {
        pending: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to close durable log: {0}")]
    Close(#[source] io::Error),
    #[error("durable log is closed")]
    Closed,
}

/// Append-only destination for flushed blocks.
#[async_trait]
pub trait LogSink: Send {
    /// Append one block as a single write.
    async fn append(&mut self, block: &[u8]) -> io::Result<()>;

    /// Release the underlying resource.
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Log file opened once in append mode and kept for the process lifetime.
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for FileSink {
    async fn append(&mut self, block: &[u8]) -> io::Result<()> {
        self.file.write_all(block).await?;
        self.file.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No live connections; nothing touched
    NoConnections,
    /// Write buffer empty; nothing touched
    Empty,
    /// Lines appended and removed from the buffer
    Flushed { lines: usize, bytes: usize },
}

/// Flush counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub flushes: u64,
    pub flush_failures: u64,
    pub skipped: u64,
    pub lines_persisted: u64,
    pub bytes_persisted: u64,
}

#[derive(Default)]
struct AtomicFlushStats {
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    skipped: AtomicU64,
    lines_persisted: AtomicU64,
    bytes_persisted: AtomicU64,
}

pub struct DurableLogWriter<S: LogSink> {
    /// `None` once closed
    sink: Mutex<Option<S>>,
    buffer: Arc<Mutex<WriteBuffer>>,
    registry: Arc<ConnectionRegistry>,
    stats: AtomicFlushStats,
}

impl<S: LogSink> DurableLogWriter<S> {
    pub fn new(sink: S, buffer: Arc<Mutex<WriteBuffer>>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            buffer,
            registry,
            stats: AtomicFlushStats::default(),
        }
    }

    /// One flush cycle.
    ///
    /// Skips without touching the sink when there are no live connections or
    /// nothing is pending. On write failure the pending lines stay buffered.
    pub async fn flush_if_due(&self) -> Result<FlushOutcome, LogError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(LogError::Closed)?;

        if self.registry.is_empty().await {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(FlushOutcome::NoConnections);
        }
        self.write_pending(sink).await
    }

    /// Flush whatever is pending regardless of live connections.
    pub async fn drain(&self) -> Result<FlushOutcome, LogError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(LogError::Closed)?;
        self.write_pending(sink).await
    }

    /// Drain, then release the sink. Later cycles fail with [`LogError::Closed`].
    pub async fn close(&self) -> Result<FlushOutcome, LogError> {
        let mut guard = self.sink.lock().await;
        let Some(mut sink) = guard.take() else {
            return Err(LogError::Closed);
        };
        let outcome = self.write_pending(&mut sink).await;
        sink.close().await.map_err(LogError::Close)?;
        outcome
    }

    async fn write_pending(&self, sink: &mut S) -> Result<FlushOutcome, LogError> {
        let staged = {
            let buffer = self.buffer.lock().await;
            buffer.stage()
        };
        let Some(staged) = staged else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(FlushOutcome::Empty);
        };

        if let Err(source) = sink.append(staged.block.as_bytes()).await {
            self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            return Err(LogError::Write {
                pending: staged.lines,
                source,
            });
        }

        self.buffer.lock().await.commit(&staged);

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats.lines_persisted.fetch_add(staged.lines as u64, Ordering::Relaxed);
        self.stats.bytes_persisted.fetch_add(staged.len_bytes() as u64, Ordering::Relaxed);

        Ok(FlushOutcome::Flushed {
            lines: staged.lines,
            bytes: staged.len_bytes(),
        })
    }

    /// Drive flush cycles every `period` until the writer is closed.
    ///
    /// The first cycle runs one full period after start.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.flush_if_due().await {
                Ok(FlushOutcome::Flushed { lines, bytes }) => {
                    log::debug!("Flushed {lines} lines ({bytes} bytes) to durable log");
                }
                Ok(outcome) => log::trace!("Flush cycle skipped: {outcome:?}"),
                Err(LogError::Closed) => break,
                Err(e) => log::error!("{e}"),
            }
        }
    }

    pub fn stats(&self) -> FlushStats {
        FlushStats {
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            flush_failures: self.stats.flush_failures.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            lines_persisted: self.stats.lines_persisted.load(Ordering::Relaxed),
            bytes_persisted: self.stats.bytes_persisted.load(Ordering::Relaxed),
        }
    }

    pub async fn pending_lines(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

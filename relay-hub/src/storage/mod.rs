//! Durable-log persistence.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐   enqueue    ┌─────────────┐
//! │ BroadcastEngine │ ───────────► │ WriteBuffer │
//! └─────────────────┘              └──────┬──────┘
//!                                         │ stage / commit
//!                                         ▼
//!                               ┌──────────────────┐   append   ┌─────────────┐
//!                   tick ─────► │ DurableLogWriter │ ─────────► │ LogSink     │
//!                               └──────────────────┘            │ (FileSink)  │
//!                                                               └─────────────┘
//! ```
//!
//! Log format: one line per message, `[<unix-epoch-millis>] <payload>\n`.

pub mod write_buffer;
pub mod log_writer;

pub use write_buffer::{StagedBlock, WriteBuffer};
pub use log_writer::{DurableLogWriter, FileSink, FlushOutcome, FlushStats, LogError, LogSink};

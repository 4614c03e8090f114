//! # relay-hub — Real-time WebSocket message relay
//!
//! Clients hold persistent WebSocket sessions to a central hub, publish opaque
//! messages, and receive what everyone else publishes. Newly joined clients get
//! a replay of the most recent messages, and all traffic is appended to a
//! durable log on a fixed interval.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ Client A    │ ◄─────────────────► │ RelayServer  │
//! │ Client B    │   text / binary     │ (accept loop)│
//! └─────────────┘                     └──────┬───────┘
//!                                            │ on_message
//!                                            ▼
//!                                    ┌────────────────┐
//!                                    │ BroadcastEngine│
//!                                    └──┬──────┬───┬──┘
//!                                       │      │   │
//!                         ┌─────────────┘      │   └──────────────┐
//!                         ▼                    ▼                  ▼
//!                  ┌─────────────┐    ┌─────────────────┐  ┌─────────────┐
//!                  │HistoryBuffer│    │ConnectionRegistry│  │ WriteBuffer │
//!                  │ (replay)    │    │ (fan-out)        │  │ (pending)   │
//!                  └─────────────┘    └─────────────────┘  └──────┬──────┘
//!                                                                 │ every 10s
//!                                                                 ▼
//!                                                        ┌─────────────────┐
//!                                                        │DurableLogWriter │
//!                                                        │ → history.log   │
//!                                                        └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Resolved operating parameters and validation
//! - [`protocol`] — Opaque payload model, log-line and replay encodings
//! - [`history`] — Bounded window of recent messages replayed to new clients
//! - [`registry`] — Live set of connections and their outbound sinks
//! - [`broadcast`] — Fan-out with self-echo control
//! - [`storage`] — Write buffer and periodic durable-log writer
//! - [`server`] — WebSocket accept loop wiring everything together

pub mod config;
pub mod protocol;
pub mod history;
pub mod registry;
pub mod broadcast;
pub mod storage;
pub mod server;

// Re-exports for convenience
pub use config::{ConfigError, RelayConfig};
pub use protocol::{Payload, ProtocolError};
pub use history::HistoryBuffer;
pub use registry::{ChannelSink, ConnectionId, ConnectionRegistry, DeliveryError, PeerSink};
pub use broadcast::{BroadcastEngine, BroadcastStats, FanOut};
pub use storage::{
    DurableLogWriter, FileSink, FlushOutcome, FlushStats, LogError, LogSink, StagedBlock,
    WriteBuffer,
};
pub use server::{RelayError, RelayServer, RelayStats};

//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── HistoryBuffer (replay on join)
//!             ├── session task ──► BroadcastEngine ── ConnectionRegistry ──► Client A/B/C
//! Client B ──┘      ▲                │
//!                   │                └── WriteBuffer ◄── DurableLogWriter (tick) ──► history.log
//!          outbound channel
//! ```
//!
//! Each session runs in its own task: inbound frames go to the engine,
//! payloads queued on the session's channel go out on the socket. When the
//! session ends it is unregistered; the socket itself belongs to the
//! transport.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::{BroadcastEngine, BroadcastStats};
use crate::config::{ConfigError, RelayConfig};
use crate::protocol::{Payload, ProtocolError};
use crate::registry::{ChannelSink, ConnectionId, ConnectionRegistry};
use crate::storage::{
    DurableLogWriter, FileSink, FlushOutcome, FlushStats, LogError, LogSink, WriteBuffer,
};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub broadcast: BroadcastStats,
    pub flush: FlushStats,
}

/// The relay server.
pub struct RelayServer<S: LogSink = FileSink> {
    config: RelayConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    engine: Arc<BroadcastEngine>,
    log_writer: Arc<DurableLogWriter<S>>,
    total_connections: Arc<AtomicU64>,
}

impl RelayServer<FileSink> {
    /// Validate the config, open the durable log, and bind the listener.
    ///
    /// Failing to open the log is fatal.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let sink = FileSink::open(&config.log_path).await?;
        Self::with_sink(config, sink).await
    }
}

impl<S: LogSink + 'static> RelayServer<S> {
    /// Bind with a caller-provided log sink.
    pub async fn with_sink(config: RelayConfig, sink: S) -> Result<Self, RelayError> {
        config.validate()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let write_buffer = Arc::new(Mutex::new(WriteBuffer::new()));
        let engine = Arc::new(BroadcastEngine::new(
            &config,
            registry.clone(),
            write_buffer.clone(),
        ));
        let log_writer = Arc::new(DurableLogWriter::new(sink, write_buffer, registry));

        Ok(Self {
            config,
            listener,
            local_addr,
            engine,
            log_writer,
            total_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<BroadcastEngine> {
        &self.engine
    }

    pub fn log_writer(&self) -> &Arc<DurableLogWriter<S>> {
        &self.log_writer
    }

    /// Human-readable status lines describing the running relay.
    pub fn startup_report(&self) -> Vec<String> {
        let echo = if self.config.self_echo { "will" } else { "will not" };
        let history = match self.config.history_window {
            0 => "No history will be sent to new client connections.".to_string(),
            n => format!("New connections will receive up to {n} history items."),
        };
        vec![
            format!("Relay listening on port {}", self.local_addr.port()),
            format!("This relay {echo} send received messages back to the immediate sender."),
            history,
        ]
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            broadcast: self.engine.stats().await,
            flush: self.log_writer.stats(),
        }
    }

    /// Serve until the process exits.
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then stop every session, drain the
    /// write buffer and release the durable log.
    ///
    /// Sessions are unregistered before the final drain, so every message
    /// the relay accepted is in the log once this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        for line in self.startup_report() {
            log::info!("{line}");
        }

        let flusher = tokio::spawn(self.log_writer.clone().run(self.config.flush_interval));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            self.total_connections.fetch_add(1, Ordering::Relaxed);

                            let engine = self.engine.clone();
                            let stop = stop_rx.clone();
                            sessions.spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, engine, stop).await {
                                    log::error!("Connection error from {addr}: {e}");
                                }
                            });
                        }
                        Err(e) => log::warn!("Failed to accept connection: {e}"),
                    }
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Session task failed: {e}");
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        let open_sessions = sessions.len();
        while let Some(finished) = sessions.join_next().await {
            if let Err(e) = finished {
                log::error!("Session task failed: {e}");
            }
        }
        if open_sessions > 0 {
            log::info!("Closed {open_sessions} sessions");
        }

        // Waits for any in-flight cycle; the timer task exits once it sees
        // the writer closed.
        let closed = self.log_writer.close().await;
        flusher.abort();

        match closed? {
            FlushOutcome::Flushed { lines, .. } => {
                log::info!("Flushed {lines} pending lines to durable log on shutdown");
            }
            _ => log::debug!("Nothing pending in durable log on shutdown"),
        }
        Ok(())
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<BroadcastEngine>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let ws_stream = tokio::select! {
        ws = tokio_tungstenite::accept_async(stream) => ws?,
        _ = stop.changed() => return Ok(()),
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let id = ConnectionId::new();
    let (sink, mut outbound) = ChannelSink::channel();
    let replayed = engine.join(id, sink.clone()).await?;
    log::info!("Connection {id} established from {addr} (replayed {replayed:?} history items)");

    let result: Result<(), RelayError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(msg)) => {
                            if let Some(payload) = Payload::from_ws(&msg) {
                                engine.on_message(id, payload).await;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }

                out = outbound.recv() => {
                    match out {
                        Some(payload) => ws_sender.send(payload.to_ws()).await?,
                        None => break,
                    }
                }

                _ = stop.changed() => {
                    // Deliver what was relayed before the stop, then close.
                    while let Ok(payload) = outbound.try_recv() {
                        ws_sender.send(payload.to_ws()).await?;
                    }
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    sink.close();
    engine.leave(&id).await;
    log::info!("Connection {id} from {addr} closed");

    result
}

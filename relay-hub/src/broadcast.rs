//! Fan-out of inbound messages to every live connection.
//!
//! For each inbound payload the engine records it in the history window,
//! enqueues its durable-log line, and pushes it to every open connection,
//! skipping the sender unless self-echo is enabled. Exclusion compares
//! [`ConnectionId`]s, never addresses or content.
//!
//! The history lock doubles as the ordering lock: one message is fully fanned
//! out before the next one starts, and a joining connection is registered and
//! sent its replay in the same critical section, so it neither misses nor
//! duplicates a message around its join.
//!
//! Sends only enqueue onto per-connection channels, so a slow peer never
//! stalls the loop. A failed send is counted and skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::RelayConfig;
use crate::history::HistoryBuffer;
use crate::protocol::{encode_replay, now_millis, Payload, ProtocolError};
use crate::registry::{ConnectionId, ConnectionRegistry, PeerSink};
use crate::storage::WriteBuffer;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_relayed: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub active_peers: usize,
}

/// Lock-free counters behind [`BroadcastStats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_relayed: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Per-message fan-out result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub skipped_closed: usize,
    pub failed: usize,
}

pub struct BroadcastEngine {
    self_echo: bool,
    history_window: usize,
    history: Mutex<HistoryBuffer>,
    registry: Arc<ConnectionRegistry>,
    write_buffer: Arc<Mutex<WriteBuffer>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastEngine {
    pub fn new(
        config: &RelayConfig,
        registry: Arc<ConnectionRegistry>,
        write_buffer: Arc<Mutex<WriteBuffer>>,
    ) -> Self {
        Self::with_policy(config.self_echo, config.history_window, registry, write_buffer)
    }

    pub fn with_policy(
        self_echo: bool,
        history_window: usize,
        registry: Arc<ConnectionRegistry>,
        write_buffer: Arc<Mutex<WriteBuffer>>,
    ) -> Self {
        Self {
            self_echo,
            history_window,
            history: Mutex::new(HistoryBuffer::new(history_window)),
            registry,
            write_buffer,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Relay one inbound payload from `sender`.
    pub async fn on_message(&self, sender: ConnectionId, payload: Payload) -> FanOut {
        let mut history = self.history.lock().await;
        history.record(payload.clone());

        {
            let mut buffer = self.write_buffer.lock().await;
            buffer.enqueue(&payload, now_millis());
        }

        let fan_out = self.fan_out(sender, &payload).await;
        drop(history);

        self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.stats.deliveries.fetch_add(fan_out.delivered as u64, Ordering::Relaxed);
        self.stats.delivery_failures.fetch_add(fan_out.failed as u64, Ordering::Relaxed);

        fan_out
    }

    async fn fan_out(&self, sender: ConnectionId, payload: &Payload) -> FanOut {
        let mut result = FanOut::default();

        for (id, sink) in self.registry.live().await {
            if !self.self_echo && id == sender {
                continue;
            }
            if !sink.is_open() {
                result.skipped_closed += 1;
                continue;
            }
            match sink.send(payload.clone()) {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    result.failed += 1;
                    log::debug!("Delivery to {id} failed: {e}");
                }
            }
        }

        result
    }

    /// Register a new connection and send it the history replay.
    ///
    /// Returns the number of replayed entries, or `None` when the history
    /// window is zero and no replay frame was sent at all.
    pub async fn join(
        &self,
        id: ConnectionId,
        sink: Arc<dyn PeerSink>,
    ) -> Result<Option<usize>, ProtocolError> {
        let history = self.history.lock().await;

        let replayed = if self.history_window > 0 {
            let tail = history.snapshot_tail(self.history_window);
            let replay = encode_replay(&tail)?;
            if let Err(e) = sink.send(replay) {
                log::debug!("History replay to {id} failed: {e}");
            }
            Some(tail.len())
        } else {
            None
        };

        self.registry.register(id, sink).await;
        Ok(replayed)
    }

    /// Unregister a departed connection.
    pub async fn leave(&self, id: &ConnectionId) -> bool {
        self.registry.remove(id).await
    }

    /// The payloads a connection joining now would be replayed.
    pub async fn history_snapshot(&self) -> Vec<Payload> {
        self.history.lock().await.snapshot_tail(self.history_window)
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get broadcast statistics (lock-free counters plus live peer count).
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.stats.delivery_failures.load(Ordering::Relaxed),
            active_peers: self.registry.len().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelSink, DeliveryError};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        engine: BroadcastEngine,
        write_buffer: Arc<Mutex<WriteBuffer>>,
    }

    fn harness(self_echo: bool, history_window: usize) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let write_buffer = Arc::new(Mutex::new(WriteBuffer::new()));
        let engine =
            BroadcastEngine::with_policy(self_echo, history_window, registry, write_buffer.clone());
        Harness { engine, write_buffer }
    }

    async fn connect(engine: &BroadcastEngine) -> (ConnectionId, Arc<ChannelSink>, UnboundedReceiver<Payload>) {
        let id = ConnectionId::new();
        let (sink, rx) = ChannelSink::channel();
        engine.join(id, sink.clone()).await.unwrap();
        (id, sink, rx)
    }

    fn assert_silent(rx: &mut UnboundedReceiver<Payload>) {
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    /// Sink that reports open but rejects every send.
    struct BrokenSink;

    impl PeerSink for BrokenSink {
        fn is_open(&self) -> bool {
            true
        }

        fn send(&self, _payload: Payload) -> Result<(), DeliveryError> {
            Err(DeliveryError::Failed("socket reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fan_out_without_self_echo() {
        let h = harness(false, 0);
        let (a, _, mut rx_a) = connect(&h.engine).await;
        let (_, _, mut rx_b) = connect(&h.engine).await;
        let (_, _, mut rx_c) = connect(&h.engine).await;

        let result = h.engine.on_message(a, Payload::text("P")).await;
        assert_eq!(result.delivered, 2);

        assert_eq!(rx_b.try_recv().unwrap(), Payload::text("P"));
        assert_eq!(rx_c.try_recv().unwrap(), Payload::text("P"));
        assert_silent(&mut rx_a);
        assert_silent(&mut rx_b);
        assert_silent(&mut rx_c);
    }

    #[tokio::test]
    async fn test_fan_out_with_self_echo() {
        let h = harness(true, 0);
        let (a, _, mut rx_a) = connect(&h.engine).await;
        let (_, _, mut rx_b) = connect(&h.engine).await;
        let (_, _, mut rx_c) = connect(&h.engine).await;

        let result = h.engine.on_message(a, Payload::text("P")).await;
        assert_eq!(result.delivered, 3);

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(rx.try_recv().unwrap(), Payload::text("P"));
            assert_silent(rx);
        }
    }

    #[tokio::test]
    async fn test_exclusion_by_identity() {
        // Two sessions from the same client are independent
        let h = harness(false, 0);
        let (first, _, mut rx_first) = connect(&h.engine).await;
        let (_, _, mut rx_second) = connect(&h.engine).await;

        h.engine.on_message(first, Payload::text("same-client")).await;
        assert_silent(&mut rx_first);
        assert_eq!(rx_second.try_recv().unwrap(), Payload::text("same-client"));
    }

    #[tokio::test]
    async fn test_identical_content_still_delivered() {
        let h = harness(false, 0);
        let (a, _, _rx_a) = connect(&h.engine).await;
        let (b, _, mut rx_b) = connect(&h.engine).await;

        h.engine.on_message(a, Payload::text("dup")).await;
        h.engine.on_message(a, Payload::text("dup")).await;
        assert_eq!(rx_b.try_recv().unwrap(), Payload::text("dup"));
        assert_eq!(rx_b.try_recv().unwrap(), Payload::text("dup"));

        h.engine.on_message(b, Payload::text("dup")).await;
        assert_silent(&mut rx_b);
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_abort_fan_out() {
        let h = harness(false, 0);
        let (a, _, _rx_a) = connect(&h.engine).await;
        let (_, closed_sink, _rx_closed) = connect(&h.engine).await;
        closed_sink.close();
        h.engine.join(ConnectionId::new(), Arc::new(BrokenSink)).await.unwrap();
        let (_, _, mut rx_ok) = connect(&h.engine).await;

        let result = h.engine.on_message(a, Payload::binary(vec![1u8, 2])).await;
        assert_eq!(
            result,
            FanOut {
                delivered: 1,
                skipped_closed: 1,
                failed: 1
            }
        );
        assert_eq!(rx_ok.try_recv().unwrap(), Payload::binary(vec![1u8, 2]));

        let stats = h.engine.stats().await;
        assert_eq!(stats.messages_relayed, 1);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.delivery_failures, 1);
        assert_eq!(stats.active_peers, 4);
    }

    #[tokio::test]
    async fn test_history_replay_on_join() {
        let h = harness(false, 2);
        let (a, _, _rx_a) = connect(&h.engine).await;
        for msg in ["a", "b", "c"] {
            h.engine.on_message(a, Payload::text(msg)).await;
        }

        let id = ConnectionId::new();
        let (sink, mut rx) = ChannelSink::channel();
        assert_eq!(h.engine.join(id, sink).await.unwrap(), Some(2));
        assert_eq!(rx.try_recv().unwrap(), Payload::text(r#"["b","c"]"#));
        assert_silent(&mut rx);
    }

    #[tokio::test]
    async fn test_empty_history_replays_empty_array() {
        let h = harness(false, 20);
        let id = ConnectionId::new();
        let (sink, mut rx) = ChannelSink::channel();
        assert_eq!(h.engine.join(id, sink).await.unwrap(), Some(0));
        assert_eq!(rx.try_recv().unwrap(), Payload::text("[]"));
    }

    #[tokio::test]
    async fn test_zero_history_sends_nothing_on_join() {
        let h = harness(false, 0);
        let (a, _, _rx_a) = connect(&h.engine).await;
        h.engine.on_message(a, Payload::text("a")).await;

        let id = ConnectionId::new();
        let (sink, mut rx) = ChannelSink::channel();
        assert_eq!(h.engine.join(id, sink).await.unwrap(), None);
        assert_silent(&mut rx);
        assert!(h.engine.registry().contains(&id).await);
    }

    #[tokio::test]
    async fn test_history_and_log_recorded_without_receivers() {
        let h = harness(false, 5);
        let (a, _, _rx_a) = connect(&h.engine).await;

        let result = h.engine.on_message(a, Payload::text("lonely")).await;
        assert_eq!(result.delivered, 0);

        assert_eq!(h.engine.history_snapshot().await, vec![Payload::text("lonely")]);
        let buffer = h.write_buffer.lock().await;
        assert_eq!(buffer.len(), 1);
        assert!(buffer.pending()[0].ends_with("] lonely"));
    }

    #[tokio::test]
    async fn test_log_lines_follow_broadcast_order() {
        let h = harness(false, 0);
        let (a, _, _rx_a) = connect(&h.engine).await;
        let (b, _, _rx_b) = connect(&h.engine).await;

        h.engine.on_message(a, Payload::text("x")).await;
        h.engine.on_message(b, Payload::text("y")).await;

        let buffer = h.write_buffer.lock().await;
        let payloads: Vec<&str> = buffer
            .pending()
            .iter()
            .map(|line| line.split_once("] ").unwrap().1)
            .collect();
        assert_eq!(payloads, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let h = harness(false, 0);
        let (a, _, _rx_a) = connect(&h.engine).await;
        let (b, _, mut rx_b) = connect(&h.engine).await;

        assert!(h.engine.leave(&b).await);
        h.engine.on_message(a, Payload::text("gone")).await;
        assert_silent(&mut rx_b);
        assert_eq!(h.engine.stats().await.active_peers, 1);
    }

    #[tokio::test]
    async fn test_concurrent_senders_see_same_order() {
        let h = Arc::new(harness(true, 0));
        let (a, _, mut rx_a) = connect(&h.engine).await;
        let (b, _, mut rx_b) = connect(&h.engine).await;

        let mut tasks = Vec::new();
        for i in 0..50 {
            let h = h.clone();
            let sender = if i % 2 == 0 { a } else { b };
            tasks.push(tokio::spawn(async move {
                h.engine.on_message(sender, Payload::text(i.to_string())).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while let Ok(p) = rx_a.try_recv() {
            seen_a.push(p);
        }
        while let Ok(p) = rx_b.try_recv() {
            seen_b.push(p);
        }
        assert_eq!(seen_a.len(), 50);
        assert_eq!(seen_a, seen_b);
    }

    #[tokio::test]
    async fn test_maximum_history_window_from_config() {
        let config = RelayConfig::from_raw(8443, false, i64::MAX).unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let write_buffer = Arc::new(Mutex::new(WriteBuffer::new()));
        let engine = BroadcastEngine::new(&config, registry, write_buffer);
        assert_eq!(engine.history_window(), i64::MAX as usize);

        let (a, _, _rx_a) = connect(&engine).await;
        engine.on_message(a, Payload::text("one")).await;
        engine.on_message(a, Payload::text("two")).await;
        assert_eq!(
            engine.history_snapshot().await,
            vec![Payload::text("one"), Payload::text("two")]
        );

        let (_, _, mut rx_late) = connect(&engine).await;
        assert_eq!(rx_late.try_recv().unwrap(), Payload::text(r#"["one","two"]"#));
    }
}

//! Bounded window of recently broadcast messages.
//!
//! Every relayed payload is recorded here; a newly joined connection receives
//! the most recent `window` entries, oldest first. Entries beyond the window
//! are evicted on insert, which keeps memory bounded without changing what is
//! ever read back out.

use std::collections::VecDeque;

use crate::protocol::Payload;

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<Payload>,
    window: usize,
    total_recorded: u64,
}

impl HistoryBuffer {
    /// Create a buffer that retains the last `window` payloads.
    ///
    /// Storage grows with what is recorded, not with `window`.
    pub fn new(window: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            window,
            total_recorded: 0,
        }
    }

    /// Append a payload. O(1); evicts the oldest entry once the window is full.
    pub fn record(&mut self, payload: Payload) {
        self.total_recorded += 1;
        if self.window == 0 {
            return;
        }
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(payload);
    }

    /// The most recent `min(n, len)` entries in arrival order.
    pub fn snapshot_tail(&self, n: usize) -> Vec<Payload> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Payloads recorded since creation, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }
}

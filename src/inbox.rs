//! Thread-safe FIFO between the broker poller and the control loop. The
//! poller appends record batches from any thread; the control loop drains
//! everything before each take-work pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rdkafka::message::OwnedMessage;

#[derive(Default)]
pub struct WorkInbox {
    batches: Mutex<VecDeque<Vec<OwnedMessage>>>,
    pending: AtomicUsize,
}

impl WorkInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: Vec<OwnedMessage>) {
        if batch.is_empty() {
            return;
        }
        self.pending.fetch_add(batch.len(), Ordering::SeqCst);
        self.batches.lock().push_back(batch);
    }

    pub fn drain(&self) -> Vec<Vec<OwnedMessage>> {
        let drained: Vec<_> = {
            let mut batches = self.batches.lock();
            batches.drain(..).collect()
        };
        let count: usize = drained.iter().map(Vec::len).sum();
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::SeqCst);
        }
        drained
    }

    /// Records appended but not yet drained.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.pending_count() == 0
    }
}

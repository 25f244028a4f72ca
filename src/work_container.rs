use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;

use crate::types::Partition;

const STATE_PENDING: u8 = 0;
const STATE_SUCCEEDED: u8 = 1;
const STATE_FAILED: u8 = 2;

/// Terminal result of the user function for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Succeeded,
    /// The latest attempt failed; the record becomes takeable again once
    /// its retry delay elapses.
    Failed,
}

/// Per-record work state. A container is co-owned by exactly one
/// processing shard and one partition commit queue; exactly one worker
/// owns it while it is in flight, so the mutable fields only need
/// atomic-level guarding for the hand-off itself.
pub struct WorkContainer {
    message: OwnedMessage,
    partition: Partition,
    in_flight: AtomicBool,
    attempts: AtomicU32,
    state: AtomicU8,
    not_before: Mutex<Option<Instant>>,
}

impl WorkContainer {
    pub(crate) fn new(message: OwnedMessage) -> Self {
        let partition = Partition::from_message(&message);
        Self {
            message,
            partition,
            in_flight: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            state: AtomicU8::new(STATE_PENDING),
            not_before: Mutex::new(None),
        }
    }

    pub fn message(&self) -> &OwnedMessage {
        &self.message
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.message.offset()
    }

    pub fn state(&self) -> WorkState {
        match self.state.load(Ordering::SeqCst) {
            STATE_SUCCEEDED => WorkState::Succeeded,
            STATE_FAILED => WorkState::Failed,
            _ => WorkState::Pending,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Number of failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// A container may be handed to a worker iff it is not already in
    /// flight, has not succeeded, and its retry delay has elapsed.
    pub(crate) fn is_takeable(&self, now: Instant) -> bool {
        !self.is_in_flight() && self.state() != WorkState::Succeeded && self.delay_passed(now)
    }

    fn delay_passed(&self, now: Instant) -> bool {
        match *self.not_before.lock() {
            Some(not_before) => now >= not_before,
            None => true,
        }
    }

    pub(crate) fn take_as_work(&self) {
        self.in_flight.store(true, Ordering::SeqCst);
    }

    /// Flip to `Succeeded` and clear the in-flight flag. Returns whether
    /// the container was in flight, so the caller decrements its counter
    /// exactly once even if a worker reports twice.
    pub(crate) fn succeed(&self) -> bool {
        self.state.store(STATE_SUCCEEDED, Ordering::SeqCst);
        self.in_flight.swap(false, Ordering::SeqCst)
    }

    /// Record a failed attempt: enter the `Failed` state, push
    /// `not_before` out by the backoff for this attempt, and clear the
    /// in-flight flag. Returns whether the container was in flight.
    pub(crate) fn fail(&self, now: Instant, base_delay: Duration, max_delay: Duration) -> bool {
        self.state.store(STATE_FAILED, Ordering::SeqCst);
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = backoff(attempt, base_delay, max_delay);
        *self.not_before.lock() = Some(now + delay);
        self.in_flight.swap(false, Ordering::SeqCst)
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    cmp::min(base.saturating_mul(1 << exponent), max)
}

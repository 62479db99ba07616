//! Retry queue for routed messages that could not be delivered.

use std::collections::VecDeque;

use tracing::warn;

use crate::identity::PeerId;
use crate::message::RoutedMessage;

pub const DEFAULT_RETRY_CAPACITY: usize = 10;
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Outcome of recording a failed send.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Queued for another attempt. Carries the message evicted to make room,
    /// if the queue was full.
    Queued { evicted: Option<RoutedMessage> },
    /// Too many failures; the message was dropped.
    Dropped(RoutedMessage),
}

/// Bounded FIFO of routed messages awaiting a usable route.
#[derive(Debug)]
pub struct RetryQueue {
    queue: VecDeque<RoutedMessage>,
    capacity: usize,
    max_failures: u32,
}

impl RetryQueue {
    pub fn new(capacity: usize, max_failures: u32) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            max_failures,
        }
    }

    /// Count one more failure against `msg` and queue it, or drop it once
    /// it has failed more than `max_failures` times.
    pub fn record_failure(&mut self, mut msg: RoutedMessage) -> FailureOutcome {
        msg.failures += 1;
        if msg.failures > self.max_failures {
            warn!(
                "Dropping routed message {} after {} failed attempts",
                msg.message.tag(),
                msg.failures
            );
            return FailureOutcome::Dropped(msg);
        }

        self.queue.push_back(msg);
        let evicted = if self.queue.len() > self.capacity {
            let oldest = self.queue.pop_front();
            if let Some(old) = &oldest {
                warn!("Retry queue full, dropping oldest message {}", old.message.tag());
            }
            oldest
        } else {
            None
        };
        FailureOutcome::Queued { evicted }
    }

    /// Remove and return every queued message whose destination satisfies
    /// `resolvable`, preserving queue order.
    pub fn take_resolvable<F>(&mut self, mut resolvable: F) -> Vec<RoutedMessage>
    where
        F: FnMut(&PeerId) -> bool,
    {
        let mut ready = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.queue.len());
        for msg in self.queue.drain(..) {
            match msg.destination() {
                Some(dest) if resolvable(dest) => ready.push(msg),
                _ => waiting.push_back(msg),
            }
        }
        self.queue = waiting;
        ready
    }

    /// Remove and return everything queued.
    pub fn take_all(&mut self) -> Vec<RoutedMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutedMessage> {
        self.queue.iter()
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_CAPACITY, DEFAULT_MAX_FAILURES)
    }
}

//! The inline timing-message input port consumed directly by the rapid-block and streaming
//! engines (§4.D step 4, §4.E step 5-6), distinct from the white-rabbit event stream the
//! realignment stage ([`crate::realignment`]) matches against *after* tags have already been
//! produced.
//!
//! A single producer (the scheduler, relaying messages from an upstream timing source) pushes
//! messages; a single consumer (the engine's work step) pops them in FIFO order. Unlike the
//! chunk pool's rings, depth here is small and unbounded growth is a caller bug, not a steady
//! state, so a plain mutex-guarded deque is enough.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::tags::TimingMessage;

/// FIFO queue of pending [`TimingMessage`]s awaiting a trigger to attach to.
pub struct TimingMessageQueue {
    messages: Mutex<VecDeque<TimingMessage>>,
}

impl TimingMessageQueue {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueues a timing message, as if received on the engine's timing input port (§6):
    /// `trigger_offset_s` is converted to nanoseconds here, matching "the offset is converted to
    /// ns (multiplied by 1e9) and stored together with name and time".
    pub fn push(&self, name: String, trigger_time_ns: i64, trigger_offset_s: f64) {
        let mut messages = self.messages.lock().unwrap();
        messages.push_back(TimingMessage {
            name,
            trigger_time_ns,
            trigger_offset_ns: (trigger_offset_s * 1.0e9) as i64,
        });
    }

    /// Pops the oldest pending message, if any.
    pub fn pop_front(&self) -> Option<TimingMessage> {
        self.messages.lock().unwrap().pop_front()
    }

    /// Returns the most recently pushed message without removing it, for the "triggers disabled"
    /// case (§4.E step 6), which tags using the most recent message rather than consuming the
    /// queue in order.
    pub fn peek_back(&self) -> Option<TimingMessage> {
        self.messages.lock().unwrap().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimingMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn converts_offset_seconds_to_nanoseconds_on_push() {
        let q = TimingMessageQueue::new();
        q.push("t0".into(), 1_000, 0.000_001_5);
        let msg = q.pop_front().unwrap();
        assert_eq!(msg.name, "t0");
        assert_eq!(msg.trigger_time_ns, 1_000);
        assert_eq!(msg.trigger_offset_ns, 1_500);
    }

    #[test]
    fn pops_in_fifo_order() {
        let q = TimingMessageQueue::new();
        q.push("a".into(), 1, 0.0);
        q.push("b".into(), 2, 0.0);
        assert_eq!(q.pop_front().unwrap().name, "a");
        assert_eq!(q.pop_front().unwrap().name, "b");
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn peek_back_does_not_remove() {
        let q = TimingMessageQueue::new();
        q.push("a".into(), 1, 0.0);
        q.push("b".into(), 2, 0.0);
        assert_eq!(q.peek_back().unwrap().name, "b");
        assert_eq!(q.len(), 2);
    }
}

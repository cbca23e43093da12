//! Bounded in-order queue of inbound message events
//!
//! Messages are appended by the receive loop and drained by the emitter,
//! serialized by a single mutex. The queue is unbounded by default; a soft
//! cap can be set so a slow consumer fails the connection instead of
//! growing memory without limit.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::events::MessageEvent;

/// FIFO of assembled inbound messages
pub struct EventQueue {
    inner: Mutex<VecDeque<MessageEvent>>,
    soft_cap: Option<usize>,
}

impl EventQueue {
    /// Create a queue; `soft_cap` limits the number of undelivered events
    pub fn new(soft_cap: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            soft_cap,
        }
    }

    /// Append an event. Returns the event back when the soft cap is hit.
    pub fn push(&self, event: MessageEvent) -> Result<(), MessageEvent> {
        let mut q = self.inner.lock();
        if let Some(cap) = self.soft_cap {
            if q.len() >= cap {
                return Err(event);
            }
        }
        q.push_back(event);
        Ok(())
    }

    /// Dequeue the oldest event, or `None` when empty
    pub fn pop(&self) -> Option<MessageEvent> {
        self.inner.lock().pop_front()
    }

    /// Number of undelivered events
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessageKind;
    use bytes::Bytes;

    fn event(tag: u8) -> MessageEvent {
        MessageEvent {
            kind: MessageKind::Binary,
            data: Bytes::copy_from_slice(&[tag]),
        }
    }

    #[test]
    fn fifo_order() {
        let q = EventQueue::new(None);
        q.push(event(1)).unwrap();
        q.push(event(2)).unwrap();
        q.push(event(3)).unwrap();

        assert_eq!(q.pop().unwrap().data[0], 1);
        assert_eq!(q.pop().unwrap().data[0], 2);
        assert_eq!(q.pop().unwrap().data[0], 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn soft_cap_rejects_overflow() {
        let q = EventQueue::new(Some(2));
        q.push(event(1)).unwrap();
        q.push(event(2)).unwrap();
        let rejected = q.push(event(3)).unwrap_err();
        assert_eq!(rejected.data[0], 3);
        assert_eq!(q.len(), 2);

        // Draining makes room again
        q.pop();
        q.push(event(3)).unwrap();
    }

    #[test]
    fn unbounded_by_default() {
        let q = EventQueue::new(None);
        for i in 0..1000 {
            q.push(event((i % 256) as u8)).unwrap();
        }
        assert_eq!(q.len(), 1000);
    }
}

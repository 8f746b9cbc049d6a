// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The system-event ring embedded in `procdata` (spec §3/§6).
//!
//! Posts `EV_PREEMPT_PENDING`/`EV_VCORE_PREEMPT`/`EV_CHECK_MSGS` to user
//! space. The source leaves producer/consumer ordering beyond
//! single-producer/single-consumer unspecified, so this is implemented
//! as a small lock-guarded ring rather than a lock-free SPSC queue —
//! strictly more ordering than required, not less.

use alloc::collections::VecDeque;

use crate::collab::UserEvent;
use crate::sync::SpinMutex;

/// Bounded FIFO of [`UserEvent`]s awaiting delivery to user space.
pub struct EventRing {
    queue: SpinMutex<VecDeque<UserEvent>>,
    capacity: usize,
}

impl EventRing {
    /// A fresh, empty ring holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: SpinMutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Post `event`. If the ring is full, the oldest undelivered event
    /// is dropped and logged — user space is expected to drain this
    /// ring promptly; a full ring means it has fallen behind.
    pub fn post(&self, event: UserEvent) {
        let mut q = self.queue.lock();
        if q.len() == self.capacity {
            let dropped = q.pop_front();
            log::warn!("event ring full, dropping {:?}", dropped);
        }
        q.push_back(event);
    }

    /// Pop the oldest pending event, if any.
    pub fn poll(&self) -> Option<UserEvent> {
        self.queue.lock().pop_front()
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the ring currently holds no events.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_poll_is_fifo() {
        let ring = EventRing::new(4);
        ring.post(UserEvent::PreemptPending(1));
        ring.post(UserEvent::CheckMsgs(1));
        assert_eq!(ring.poll(), Some(UserEvent::PreemptPending(1)));
        assert_eq!(ring.poll(), Some(UserEvent::CheckMsgs(1)));
        assert_eq!(ring.poll(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let ring = EventRing::new(2);
        ring.post(UserEvent::CheckMsgs(0));
        ring.post(UserEvent::CheckMsgs(1));
        ring.post(UserEvent::CheckMsgs(2));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.poll(), Some(UserEvent::CheckMsgs(1)));
        assert_eq!(ring.poll(), Some(UserEvent::CheckMsgs(2)));
    }
}

// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Shared fakes for the end-to-end scenario tests (spec §8).
//!
//! These stand in for the host kernel's collaborators (`collab.rs`):
//! a trap frame that just remembers its entry address, a scheduler and
//! transport that record what they were told instead of acting on real
//! hardware, and a transport that can additionally be drained and
//! redelivered to simulate a message actually crossing to another
//! pcore's dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use polycore::collab::{AddressSpace, AncillaryState, HandlerId, MessageTransport, MsgPriority, Scheduler, TrapFrame};
use polycore::pcpu::QueuedMessage;
use polycore::{PcoreId, ProcessId};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeFrame {
    pub entry: u64,
    pub sanitized: bool,
}

impl TrapFrame for FakeFrame {
    fn fresh(entry: u64, _stack_top: u64) -> Self {
        FakeFrame { entry, sanitized: false }
    }
    fn sanitize(&mut self) {
        self.sanitized = true;
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeAnc;
impl AncillaryState for FakeAnc {
    fn save() -> Self {
        Self
    }
    fn restore(&self) {}
}

/// Records every `activate`/`tlb_shootdown` call it sees.
#[derive(Default)]
pub struct FakeAddressSpace {
    pub activations: AtomicUsize,
    pub shootdowns: AtomicUsize,
}
impl AddressSpace for FakeAddressSpace {
    fn activate(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }
    fn tlb_shootdown(&self, _start: usize, _end: usize) {
        self.shootdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scheduler stand-in: just counts what it was told, same as the unit
/// tests in `destroy.rs`/`grant.rs`.
#[derive(Default)]
pub struct RecordingScheduler {
    pub scheduled: AtomicUsize,
    pub idled: AtomicUsize,
    pub waiting: AtomicUsize,
}
impl Scheduler for RecordingScheduler {
    fn schedule_scp(&self, _pid: ProcessId) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }
    fn put_idle_core(&self, _pcore: PcoreId) {
        self.idled.fetch_add(1, Ordering::SeqCst);
    }
    fn on_process_waiting(&self, _pid: ProcessId) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
    }
}

/// A transport that queues each send onto its destination pcore's
/// local inbox instead of delivering it immediately, so a test can
/// drive the receiving side's dispatch loop itself and observe the
/// handler's effects separately from the sender's.
#[derive(Default)]
pub struct QueueTransport {
    inboxes: Mutex<HashMap<PcoreId, Vec<QueuedMessage>>>,
}

impl MessageTransport for QueueTransport {
    fn send(&self, dst_pcore: PcoreId, handler: HandlerId, a0: u64, a1: u64, a2: u64, _priority: MsgPriority) {
        self.inboxes
            .lock()
            .unwrap()
            .entry(dst_pcore)
            .or_default()
            .push(QueuedMessage { handler, a0, a1, a2 });
    }
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop every message queued for `pcoreid`, oldest first.
    pub fn drain(&self, pcoreid: PcoreId) -> Vec<QueuedMessage> {
        self.inboxes.lock().unwrap().remove(&pcoreid).unwrap_or_default()
    }

    pub fn total_sent(&self) -> usize {
        self.inboxes.lock().unwrap().values().map(|v| v.len()).sum()
    }
}

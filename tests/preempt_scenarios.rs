// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end coverage for single and bulk preemption (spec §8
//! scenarios 3 and 4), including the userspace-driven yield race that
//! a single preempt must lose gracefully.

mod support;

use polycore::collab::UserEvent;
use polycore::vcpd::VcpdFlags;
use polycore::{dispatch, grant, kmsg, pcpu::PerCpuInfo, process::Process, refcount::ProcRef, ProcState};

use support::{FakeAnc, FakeFrame, QueueTransport, RecordingScheduler};

fn running_m(pid: u32, pcores: &[u32]) -> (ProcRef<Process<FakeFrame, FakeAnc>>, RecordingScheduler, QueueTransport) {
    let p = ProcRef::new(Process::new(pid, 0, 0, 0, 0xf00d));
    p.mark_mcp();
    p.locked.lock().state = ProcState::RunnableM;
    let scheduler = RecordingScheduler::default();
    let transport = QueueTransport::new();
    grant::give_cores(&p, pcores, &scheduler, &transport).unwrap();
    p.locked.lock().state = ProcState::RunningM;
    (p, scheduler, transport)
}

#[test]
fn single_preempt_loses_the_yield_race_then_completes() {
    let (proc, scheduler, transport) = running_m(1, &[3, 5, 7]);
    let vcoreid = proc.maps.pcore(5).vcoreid().unwrap();

    grant::preempt_core(&proc, 5, 100, &transport).unwrap();

    assert_eq!(proc.procdata.events.poll(), Some(UserEvent::PreemptPending(vcoreid)));
    assert!(proc.maps.vcore(vcoreid).preempt_served.load(core::sync::atomic::Ordering::SeqCst));
    assert!(proc.procdata.vcore_preempt_data[vcoreid as usize].flags.contains(VcpdFlags::VC_K_LOCK));
    assert_eq!(proc.num_vcores(), 2);

    // Vcore 1 races to yield before the `__preempt` it was warned about
    // has actually run on its pcore: it must see `preempt_served` and
    // back off rather than unmap itself a second time.
    let mut racer = PerCpuInfo::<FakeFrame, FakeAnc>::new();
    racer.set_owner(proc.clone(), vcoreid);
    let outcome = dispatch::yield_core(&proc, &mut racer, 5, false, &scheduler).unwrap();
    assert_eq!(outcome, dispatch::YieldOutcome::AbortedPreemptServed);

    // Now the `__preempt` that was actually in flight lands.
    let mut pcpu = PerCpuInfo::<FakeFrame, FakeAnc>::new();
    pcpu.set_owner(proc.clone(), vcoreid);
    let queued = transport.drain(5);
    assert_eq!(queued.len(), 1);
    let msg = unsafe { kmsg::from_queued::<FakeFrame, FakeAnc>(queued[0]) };
    kmsg::dispatch(msg, &mut pcpu, 5);

    let vcpd = &proc.procdata.vcore_preempt_data[vcoreid as usize];
    assert!(vcpd.flags.contains(VcpdFlags::VC_PREEMPTED));
    assert!(!vcpd.flags.contains(VcpdFlags::VC_K_LOCK));
    assert!(!proc.maps.vcore(vcoreid).is_valid());
    assert_eq!(proc.num_vcores(), 2);
    assert!(proc.locked.lock().lists.inactive.contains(&vcoreid));
}

#[test]
fn bulk_preempt_then_restart_drains_the_remainder() {
    let (proc, scheduler, transport) = running_m(2, &[10, 11, 12, 13]);

    let n = grant::preempt_all(&proc, 1000, &transport).unwrap();
    assert_eq!(n, 4);
    assert_eq!(proc.num_vcores(), 0);
    assert_eq!(proc.locked.lock().state, ProcState::RunnableM);
    assert_eq!(proc.locked.lock().lists.bulk_preempted.len(), 4);

    grant::give_cores(&proc, &[9, 11], &scheduler, &transport).unwrap();
    assert_eq!(proc.num_vcores(), 2);
    assert_eq!(proc.locked.lock().state, ProcState::RunnableM);
    assert_eq!(proc.locked.lock().lists.bulk_preempted.len(), 2, "two vcores are still awaiting a restart");

    grant::run_m(&proc, &transport).unwrap();
    assert_eq!(proc.locked.lock().state, ProcState::RunningM);
    assert!(proc.locked.lock().lists.bulk_preempted.is_empty());
    assert_eq!(proc.procdata.events.len(), 2, "the two stragglers each get an EV_VCORE_PREEMPT");
    assert_eq!(transport.drain(9).len(), 1);
    assert_eq!(transport.drain(11).len(), 1);
}

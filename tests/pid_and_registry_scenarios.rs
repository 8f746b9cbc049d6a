// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end coverage for pid recycling under pressure and for the
//! registry's refusal to hand back a stale (refcount-zero) process
//! (spec §8 scenarios 5 and 6).
//!
//! Both tests build their own [`PidAllocator`]/[`ProcessRegistry`]
//! rather than going through [`polycore::destroy::alloc`], since that
//! helper draws from the process-wide pid allocator shared with every
//! other test binary's allocations and would make pid-exhaustion
//! behavior nondeterministic under parallel test execution.

mod support;

use polycore::pid::PidAllocator;
use polycore::process::Process;
use polycore::refcount::ProcRef;
use polycore::registry::ProcessRegistry;
use polycore::status::ProcError;

use support::{FakeAnc, FakeFrame};

type Reg = ProcessRegistry<Process<FakeFrame, FakeAnc>>;

#[test]
fn pid_recycling_under_pressure() {
    const PID_MAX: u32 = 64;
    let allocator = PidAllocator::new(PID_MAX);

    let mut pids = Vec::new();
    for _ in 0..PID_MAX {
        pids.push(allocator.allocate().unwrap());
    }
    assert_eq!(allocator.allocate(), Err(ProcError::NoFreePid), "the space is exactly full");

    for &pid in pids.iter().rev() {
        allocator.free(pid);
    }

    let recycled = allocator.allocate().unwrap();
    assert!((1..=PID_MAX).contains(&recycled), "recycled pid must stay in range");
    assert!(pids.contains(&recycled), "a full space can only hand back a pid that was just freed");
}

#[test]
fn stale_lookup_is_refused_once_the_last_reference_drops() {
    let registry = Reg::new();
    let proc = ProcRef::new(Process::<FakeFrame, FakeAnc>::new(7, 0, 0, 0, 0));
    registry.insert(7, unsafe { proc.clone_consuming_manual_unit() }).unwrap();

    // Thread A's lookup, while proc (the registry's own handle plus
    // the caller's) is still alive, must succeed and bump refcount.
    let found = registry.lookup(7).expect("process is still live");
    assert_eq!(found.refcount(), 3);
    drop(found);

    // Thread B releases every reference: the caller's handle and the
    // registry's own unit.
    registry.remove(7);
    drop(proc);

    // A subsequent lookup must never resurrect a refcount-zero handle.
    assert!(registry.lookup(7).is_none());
}

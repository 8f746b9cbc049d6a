// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! polycore demo entry point.
//!
//! Mirrors the teacher's `kmain` shape but performs no real hardware
//! bring-up: no paging, no interrupts, no bootloader handoff. It exists
//! to show the library wired end to end — allocate a process, ready it,
//! hand it a pcore, let it run, and tear it down — against trivial
//! collaborator stand-ins, not as a bootable kernel image.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;

use panic_halt as _;

use polycore::{
    collab::{AddressSpace, AncillaryState, HandlerId, MessageTransport, MsgPriority, Scheduler, TrapFrame},
    destroy, dispatch,
    pcpu::PerCpuInfo,
    process::Process,
    registry::ProcessRegistry,
};

mod demo_allocator;

#[derive(Clone, Default)]
struct DemoFrame {
    entry: u64,
}

impl TrapFrame for DemoFrame {
    fn fresh(entry: u64, _stack_top: u64) -> Self {
        DemoFrame { entry }
    }
    fn sanitize(&mut self) {}
}

#[derive(Clone, Default)]
struct DemoAnc;
impl AncillaryState for DemoAnc {
    fn save() -> Self {
        Self
    }
    fn restore(&self) {}
}

struct DemoAddressSpace;
impl AddressSpace for DemoAddressSpace {
    fn activate(&self) {}
    fn tlb_shootdown(&self, _start: usize, _end: usize) {}
}

/// Scheduler stand-in: no real run queue, just logs what it's told.
struct DemoScheduler;
impl Scheduler for DemoScheduler {
    fn schedule_scp(&self, pid: polycore::ProcessId) {
        log::info!("demo scheduler: {} ready to run single-core", pid);
    }
    fn put_idle_core(&self, pcore: polycore::PcoreId) {
        log::info!("demo scheduler: pcore {} returned to idle pool", pcore);
    }
    fn on_process_waiting(&self, pid: polycore::ProcessId) {
        log::info!("demo scheduler: {} is waiting", pid);
    }
}

/// Transport stand-in: there is only ever one pcore in this demo, so
/// "sending" a message just dispatches it locally instead of crossing
/// to another core.
struct DemoTransport;
impl MessageTransport for DemoTransport {
    fn send(&self, _dst_pcore: polycore::PcoreId, _handler: HandlerId, _a0: u64, _a1: u64, _a2: u64, _priority: MsgPriority) {
        log::info!("demo transport: dropping message, no second pcore to deliver it to");
    }
}

/// Entry point. A real kernel's bootloader would call this after
/// setting up paging and a stack; this demo just calls it directly
/// from `main`-equivalent startup.
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    demo_allocator::init();

    let registry: ProcessRegistry<Process<DemoFrame, DemoAnc>> = ProcessRegistry::new();
    let scheduler = DemoScheduler;
    let transport = DemoTransport;

    let proc = destroy::alloc::<DemoFrame, DemoAnc>(0, 0, 0, 0x1000, &registry)
        .expect("alloc: pid space should not be exhausted on a fresh boot");
    *proc.address_space.lock() = Some(Box::new(DemoAddressSpace));
    destroy::ready(&proc, &scheduler).expect("ready: freshly allocated process is CREATED");

    let mut pcpu: PerCpuInfo<DemoFrame, DemoAnc> = PerCpuInfo::new();
    dispatch::run_s(&proc, &mut pcpu, 0).expect("run_s: vcore 0 should map cleanly on an idle pcore");

    destroy::destroy(&proc, &registry, &scheduler, &transport).expect("destroy: process must be tearable down");

    log::info!("polycore demo: process {} ran and was torn down", proc.pid);

    loop {
        core::hint::spin_loop();
    }
}

// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! polycore: the process and vcore lifecycle core of a many-core
//! research kernel (spec §1).
//!
//! This crate owns pid allocation, the process registry, the
//! six-state process state machine, the vcore<->pcore maps and lists,
//! the grant/revoke protocol, the cross-core kernel-message handlers,
//! the per-pcore dispatch loop, and the VCPD user/kernel shared
//! control block. It does not own a scheduler, an address-space
//! manager, architecture-specific trap-frame decoding, or the
//! kernel-message transport itself — those are named as traits in
//! [`collab`] for a host kernel to supply.
//!
//! Built `no_std` outside of tests: the host kernel provides its own
//! global allocator. Every type generic over a trap frame or
//! ancillary-state type (`F`/`A` throughout) is so that this crate
//! never assumes a particular architecture.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod collab;
pub mod config;
pub mod destroy;
pub mod dispatch;
pub mod events;
pub mod grant;
pub mod kmsg;
pub mod pcpu;
pub mod pid;
pub mod process;
pub mod refcount;
pub mod registry;
pub mod state;
pub mod status;
pub mod sync;
pub mod vcore;
pub mod vcpd;

pub use collab::{AddressSpace, AncillaryState, HandlerId, MessageTransport, MsgPriority, Scheduler, TrapFrame, UserEvent};
pub use pid::ProcessId;
pub use process::Process;
pub use refcount::ProcRef;
pub use registry::ProcessRegistry;
pub use state::ProcState;
pub use status::{ProcError, Result};
pub use vcore::{PcoreId, VcoreId};

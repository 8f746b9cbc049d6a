// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Vcore Preempt Data (C9): the per-vcore user/kernel shared control
//! block embedded in `ProcData`.
//!
//! This is the one piece of process state both the kernel and user
//! space write. Flag transitions are documented in spec §5 and must
//! not be reordered: `VC_K_LOCK` is set before `__preempt` is sent and
//! cleared by the handler only after all frame state has been saved;
//! user-space recovery must observe it clear before touching the saved
//! frames.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::collab::{AncillaryState, TrapFrame};

bitflags::bitflags! {
    /// Atomic bitfield manipulated with atomic or/and from both kernel
    /// and user space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VcpdFlags: u32 {
        /// Set by `__preempt` once the vcore's frames are saved and it
        /// has been unmapped; cleared when the vcore is next started.
        const VC_PREEMPTED = 1 << 0;
        /// Set before a `__preempt` message is sent, cleared by the
        /// handler after saving state. User-space recovery code must
        /// wait for this to clear before reading `preempt_tf`.
        const VC_K_LOCK = 1 << 1;
        /// Set once `__startcore`/`__preempt` handling has reached a
        /// point where the vcore can safely receive further messages.
        const VC_CAN_RCV_MSG = 1 << 2;
    }
}

/// Atomic wrapper around [`VcpdFlags`], since the bitflags type itself
/// is plain data (not `Sync`-safe to mutate by reference).
#[derive(Debug, Default)]
pub struct AtomicVcpdFlags(core::sync::atomic::AtomicU32);

impl AtomicVcpdFlags {
    /// A fresh, empty flag word.
    pub const fn new() -> Self {
        Self(core::sync::atomic::AtomicU32::new(0))
    }

    /// Current snapshot.
    pub fn load(&self) -> VcpdFlags {
        VcpdFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Atomic `flags |= bits`.
    pub fn set(&self, bits: VcpdFlags) {
        self.0.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Atomic `flags &= !bits`.
    pub fn clear(&self, bits: VcpdFlags) {
        self.0.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Whether every bit in `bits` is currently set.
    pub fn contains(&self, bits: VcpdFlags) -> bool {
        self.load().contains(bits)
    }
}

/// Per-vcore shared control block (spec §3's VCPD).
///
/// `notif_tf`/`preempt_tf`/`preempt_anc` are `UnsafeCell`-wrapped: the
/// kernel-message handlers write them through a shared `&Process`
/// (processes are accessed via [`crate::refcount::ProcRef`], never
/// `&mut`), with `VC_K_LOCK` and the owning-pcore check serialising
/// access instead of the borrow checker.
pub struct Vcpd<F, A>
where
    F: TrapFrame,
    A: AncillaryState,
{
    notif_tf: UnsafeCell<F>,
    preempt_tf: UnsafeCell<F>,
    preempt_anc: UnsafeCell<A>,
    /// Whether a notification is waiting to be delivered.
    pub notif_pending: AtomicBool,
    /// Whether the vcore is currently masking notifications (akin to
    /// an interrupt gate).
    pub notif_disabled: AtomicBool,
    /// `VC_PREEMPTED` / `VC_K_LOCK` / `VC_CAN_RCV_MSG`.
    pub flags: AtomicVcpdFlags,
    /// User-provided vcore-context stack base, used to build a fresh
    /// trap frame on `__startcore`/`__notify`.
    pub transition_stack: AtomicU64,
}

unsafe impl<F: TrapFrame, A: AncillaryState> Sync for Vcpd<F, A> {}

impl<F, A> Vcpd<F, A>
where
    F: TrapFrame + Default,
    A: AncillaryState + Default,
{
    /// A freshly zeroed VCPD, as installed at process creation before
    /// any vcore has ever run.
    pub fn new() -> Self {
        Self {
            notif_tf: UnsafeCell::new(F::default()),
            preempt_tf: UnsafeCell::new(F::default()),
            preempt_anc: UnsafeCell::new(A::default()),
            notif_pending: AtomicBool::new(false),
            notif_disabled: AtomicBool::new(false),
            flags: AtomicVcpdFlags::new(),
            transition_stack: AtomicU64::new(0),
        }
    }
}

impl<F, A> Vcpd<F, A>
where
    F: TrapFrame,
    A: AncillaryState,
{
    /// A snapshot of the saved notification-slot frame.
    pub fn notif_tf(&self) -> F {
        unsafe { (*self.notif_tf.get()).clone() }
    }

    /// A snapshot of the saved preemption-slot frame.
    pub fn preempt_tf(&self) -> F {
        unsafe { (*self.preempt_tf.get()).clone() }
    }

    /// A snapshot of the saved FP/ancillary state.
    pub fn preempt_anc(&self) -> A {
        unsafe { (*self.preempt_anc.get()).clone() }
    }

    /// Overwrite the notification-slot frame. Caller must hold
    /// `VC_K_LOCK` or otherwise be the sole writer (spec §5).
    pub fn set_notif_tf(&self, frame: F) {
        unsafe { *self.notif_tf.get() = frame };
    }

    /// Overwrite the preemption-slot frame. Same caller obligation as
    /// [`Self::set_notif_tf`].
    pub fn set_preempt_tf(&self, frame: F) {
        unsafe { *self.preempt_tf.get() = frame };
    }

    /// Overwrite the saved ancillary (FP) state.
    pub fn set_preempt_anc(&self, anc: A) {
        unsafe { *self.preempt_anc.get() = anc };
    }
}

impl<F, A> Default for Vcpd<F, A>
where
    F: TrapFrame + Default,
    A: AncillaryState + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_clear_roundtrip() {
        let flags = AtomicVcpdFlags::new();
        assert!(flags.load().is_empty());
        flags.set(VcpdFlags::VC_K_LOCK);
        assert!(flags.contains(VcpdFlags::VC_K_LOCK));
        flags.set(VcpdFlags::VC_PREEMPTED);
        assert!(flags.contains(VcpdFlags::VC_PREEMPTED | VcpdFlags::VC_K_LOCK));
        flags.clear(VcpdFlags::VC_K_LOCK);
        assert!(!flags.contains(VcpdFlags::VC_K_LOCK));
        assert!(flags.contains(VcpdFlags::VC_PREEMPTED));
    }
}

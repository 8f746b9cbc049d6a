// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process state machine (C4).
//!
//! Six states, one terminal. Transitions are validated against a fixed
//! table; anything not in the table is an invariant violation (spec
//! §7: non-recoverable, since it means the rest of the kernel has
//! already gotten the process into an inconsistent state) and panics
//! rather than returning an error.

/// A process's position in its six-state lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Just allocated; not yet runnable.
    Created,
    /// Single-core process, ready to run but not on a pcore.
    RunnableS,
    /// Single-core process, actively running on its one pcore.
    RunningS,
    /// Blocked (e.g. on an external event); holds zero vcores.
    Waiting,
    /// Many-core process, ready to run but currently holds zero
    /// online vcores (or is between bulk preempt and restart).
    RunnableM,
    /// Many-core process, holds at least one online vcore.
    RunningM,
    /// Terminal. No further transitions.
    Dying,
}

impl ProcState {
    /// The debug name exposed to user space (spec §6).
    pub const fn as_str(self) -> &'static str {
        match self {
            ProcState::Created => "CREATED",
            ProcState::RunnableS => "RUNNABLE_S",
            ProcState::RunningS => "RUNNING_S",
            ProcState::Waiting => "WAITING",
            ProcState::RunnableM => "RUNNABLE_M",
            ProcState::RunningM => "RUNNING_M",
            ProcState::Dying => "DYING",
        }
    }

    /// Whether `to` is a legal transition target from `self`, per the
    /// table in spec §4.4.
    pub const fn can_transition_to(self, to: ProcState) -> bool {
        use ProcState::*;
        matches!(
            (self, to),
            (Created, RunnableS)
                | (Created, Dying)
                | (RunnableS, RunningS)
                | (RunnableS, Dying)
                | (RunningS, RunnableS)
                | (RunningS, RunnableM)
                | (RunningS, Waiting)
                | (RunningS, Dying)
                | (Waiting, RunnableS)
                | (Waiting, RunnableM)
                | (RunnableM, RunningM)
                | (RunnableM, Dying)
                | (RunningM, RunnableS)
                | (RunningM, RunnableM)
                | (RunningM, Waiting)
                | (RunningM, Dying)
        )
    }

    /// Apply the transition, panicking (spec: fatal invariant
    /// violation) if it is not legal. `Dying` is terminal: transitions
    /// out of it always fail, including to `Dying` again (callers that
    /// want "already dying, no-op" semantics must check state first;
    /// see `destroy::destroy`).
    pub fn set(&mut self, to: ProcState) {
        if !self.can_transition_to(to) {
            panic!(
                "invalid process state transition: {} -> {}",
                self.as_str(),
                to.as_str()
            );
        }
        log::debug!("state: {} -> {}", self.as_str(), to.as_str());
        *self = to;
    }
}

impl core::fmt::Display for ProcState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

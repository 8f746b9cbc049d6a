// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Error taxonomy for the process/vcore core.
//!
//! Per spec: resource exhaustion and benign race losses are recoverable
//! and returned to the caller as a [`ProcError`]; invariant violations
//! and illegal state transitions are fatal and surface as a panic
//! instead (see the `state` and `vcore` modules), not as a variant here.

/// Result type for fallible core operations.
pub type Result<T = ()> = core::result::Result<T, ProcError>;

/// Recoverable error conditions raised by the process/vcore core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ProcError {
    /// The pid bitmap has no free entry left.
    NoFreePid = -1,

    /// `pid` does not name a live, discoverable process.
    NotFound = -2,

    /// The process registry already has an entry for this pid.
    AlreadyExists = -3,

    /// A grant/revoke call targeted more pcores than the caller supplied,
    /// or asked for more vcores than the process has left to give.
    InvalidArgs = -4,

    /// The operation is not valid in the process's current state (a
    /// "user bug": warn and ignore, per spec §7, rather than abort).
    BadState = -5,

    /// A caller-supplied vcore or pcore index is out of its map's range.
    OutOfRange = -6,

    /// The requested vcore/pcore is not currently mapped.
    NotMapped = -7,

    /// Allocation failed (no free vcore slot, full event ring, etc).
    NoResources = -8,
}

impl ProcError {
    /// A short machine name, for debug logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            ProcError::NoFreePid => "no_free_pid",
            ProcError::NotFound => "not_found",
            ProcError::AlreadyExists => "already_exists",
            ProcError::InvalidArgs => "invalid_args",
            ProcError::BadState => "bad_state",
            ProcError::OutOfRange => "out_of_range",
            ProcError::NotMapped => "not_mapped",
            ProcError::NoResources => "no_resources",
        }
    }
}

impl core::fmt::Display for ProcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Execution tracing hooks.
//!
//! The VM only emits events requested by a [`TraceMask`]; with [`TraceMask::NONE`] the hot loop
//! does no tracing work at all.
//!
//! To enable tracing, pass a [`TraceMask`] and [`TraceSink`] to [`VirtualMachine::run_traced`].

#[cfg(doc)]
use crate::vm::VirtualMachine;

use crate::opcode::Opcode;
use crate::vm::RunError;

/// A set of trace events requested by a [`TraceSink`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceMask(u32);

impl core::ops::BitOr for TraceMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for TraceMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl TraceMask {
    /// No tracing.
    pub const NONE: Self = Self(0);
    /// Run boundaries: [`TraceSink::run_start`] and [`TraceSink::run_end`].
    pub const RUN: Self = Self(1 << 0);
    /// Each interpreted instruction: [`TraceSink::instr`].
    pub const INSTR: Self = Self(1 << 1);
    /// Call frames ([`ScopeKind::CallFrame`]).
    pub const CALL: Self = Self(1 << 2);
    /// Host imports ([`ScopeKind::HostImport`]).
    pub const HOST: Self = Self(1 << 3);
    /// Native routine entries and exits: [`TraceSink::native_enter`] and
    /// [`TraceSink::native_exit`].
    pub const NATIVE: Self = Self(1 << 4);
    /// Everything.
    pub const ALL: Self = Self(0b1_1111);

    /// Returns `true` if this mask includes all bits in `other`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// The kind of scope being entered/exited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    /// A function activation.
    CallFrame {
        /// Function index.
        func: u32,
    },
    /// A host import invocation.
    HostImport {
        /// Import index (among function imports).
        import: u32,
    },
}

/// Run outcome for tracing.
#[derive(Clone, Debug)]
pub enum TraceOutcome<'a> {
    /// Returned normally, with the result if any.
    Ok(Option<i64>),
    /// Trapped or faulted.
    Err(&'a RunError),
}

/// Receives VM events.
///
/// Every method has an empty default, so sinks implement only what they use.
pub trait TraceSink {
    /// Returns the set of events the sink wants.
    fn mask(&self) -> TraceMask {
        TraceMask::NONE
    }

    /// Start of a run of `entry` with `arg_count` arguments.
    fn run_start(&mut self, _entry: u32, _arg_count: usize) {}

    /// One interpreted instruction at byte offset `pc` of `func`, before it executes.
    fn instr(&mut self, _func: u32, _pc: u32, _opcode: Opcode) {}

    /// Entering a scope; `depth` is the frame count after entering.
    fn scope_enter(&mut self, _kind: ScopeKind, _depth: usize) {}

    /// Leaving a scope; `depth` is the frame count before leaving.
    fn scope_exit(&mut self, _kind: ScopeKind, _depth: usize) {}

    /// Entering `func`'s native routine at `continuation`.
    fn native_enter(&mut self, _func: u32, _continuation: u32) {}

    /// The native routine of `func` returned `code`.
    fn native_exit(&mut self, _func: u32, _code: i32) {}

    /// End of a run.
    fn run_end(&mut self, _outcome: TraceOutcome<'_>) {}
}

/// A sink that records nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoTrace;

impl TraceSink for NoTrace {}

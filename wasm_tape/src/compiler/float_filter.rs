// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Floating-point admission pass.

use crate::asm::Label;
use crate::bytecode::{Instruction, Op};
use crate::compiler::CompileErrorKind;

/// What to do with floating-point operations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FloatPolicy {
    /// Keep them.
    #[default]
    Allow,
    /// Fail compilation on the first one.
    Reject,
    /// Replace each with [`Op::FpDisabled`], which traps if executed.
    Trap,
}

/// Applies `policy` to `code` in place.
///
/// A replaced instruction keeps its target register so the surrounding def/use structure (and
/// therefore register allocation) is unchanged.
pub(crate) fn filter_floating_point(
    code: &mut [Instruction<Label>],
    policy: FloatPolicy,
) -> Result<(), CompileErrorKind> {
    if policy == FloatPolicy::Allow {
        return Ok(());
    }
    for inst in code.iter_mut() {
        let Some(op) = inst.op.opcode() else {
            continue;
        };
        if !op.is_float() {
            continue;
        }
        match policy {
            FloatPolicy::Reject => return Err(CompileErrorKind::FloatingPoint(op)),
            FloatPolicy::Trap => inst.op = Op::FpDisabled,
            FloatPolicy::Allow => {}
        }
    }
    Ok(())
}

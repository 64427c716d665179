// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Gas instrumentation.
//!
//! Each basic block is charged once, on entry, for the summed cost of every instruction in it.
//! The charge runs before anything else in the block, so a block whose charge does not fit the
//! remaining budget executes none of its instructions.

use core::fmt;

use hashbrown::HashMap;

use crate::analysis::cfg::build_basic_blocks;
use crate::asm::Label;
use crate::bytecode::{Instruction, Op};
use crate::opcode::Opcode;

/// Per-opcode gas cost.
pub trait CostPolicy: Send + Sync {
    /// Returns the cost of executing one instruction with opcode `op`.
    fn cost(&self, op: Opcode) -> u64;
}

/// Every instruction costs the same.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SimpleCostPolicy {
    /// Cost charged per executed instruction.
    pub per_instruction: u64,
}

impl Default for SimpleCostPolicy {
    fn default() -> Self {
        Self { per_instruction: 1 }
    }
}

impl CostPolicy for SimpleCostPolicy {
    fn cost(&self, _op: Opcode) -> u64 {
        self.per_instruction
    }
}

/// A default cost with per-opcode overrides.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TableCostPolicy {
    /// Cost of opcodes without an override.
    pub default: u64,
    /// Opcode-specific costs.
    pub overrides: HashMap<Opcode, u64>,
}

impl TableCostPolicy {
    /// Creates a policy charging `default` for every opcode.
    #[must_use]
    pub fn new(default: u64) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Sets the cost of `op`.
    #[must_use]
    pub fn with(mut self, op: Opcode, cost: u64) -> Self {
        self.overrides.insert(op, cost);
        self
    }
}

impl fmt::Debug for TableCostPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableCostPolicy")
            .field("default", &self.default)
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl CostPolicy for TableCostPolicy {
    fn cost(&self, op: Opcode) -> u64 {
        self.overrides.get(&op).copied().unwrap_or(self.default)
    }
}

/// Returns `code` with an [`Op::AddGas`] charge at the head of every basic block.
///
/// The charge goes right after the block's label (if any), ahead of any `phi`. Blocks whose cost
/// sums to zero get no charge.
#[must_use]
pub(crate) fn insert_gas_counters(
    code: Vec<Instruction<Label>>,
    policy: &dyn CostPolicy,
) -> Vec<Instruction<Label>> {
    let blocks = build_basic_blocks(&code);
    let mut out = Vec::with_capacity(code.len() + blocks.len());
    let mut insts = code.into_iter();

    for b in &blocks {
        let block: Vec<_> = insts.by_ref().take(b.instr_end - b.instr_start).collect();
        let cost = block
            .iter()
            .filter_map(|i| i.op.opcode())
            .fold(0_u64, |acc, op| acc.saturating_add(policy.cost(op)));

        let mut block = block.into_iter();
        if let Some(first) = block.next() {
            let charge = (cost > 0).then(|| Instruction::effect(Op::AddGas(cost)));
            if matches!(first.op, Op::Place(_)) {
                out.push(first);
                out.extend(charge);
            } else {
                out.extend(charge);
                out.push(first);
            }
        }
        out.extend(block);
    }
    out
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Liveness-based register allocation.
//!
//! Two virtual registers interfere when one is defined while the other is live. Registers are
//! colored greedily in order of first appearance, each taking the lowest color none of its
//! neighbors holds, and every operand is rewritten to its color.

use crate::analysis::bitset::BitSet;
use crate::analysis::cfg::{build_basic_blocks, compute_reachable};
use crate::analysis::liveness::compute_liveness;
use crate::asm::Label;
use crate::bytecode::{Instruction, Reg};
use crate::compiler::CompileErrorKind;

/// Rewrites `code` from `num_vregs` virtual registers to physical ones and returns the number of
/// physical registers (always at least 1).
///
/// Fails if any register is live on entry, i.e. read on some path before it is written.
pub(crate) fn allocate_registers(
    code: &mut [Instruction<Label>],
    num_vregs: u32,
) -> Result<u32, CompileErrorKind> {
    let n = num_vregs as usize;
    let mut out_of_range = false;
    for inst in code.iter_mut() {
        inst.for_each_reg_mut(|r| out_of_range |= r.index() >= n);
    }
    if out_of_range {
        return Err(CompileErrorKind::AllocatorInconsistency);
    }

    let blocks = build_basic_blocks(code);
    let reachable = compute_reachable(&blocks);
    let liveness = compute_liveness(n, code, &blocks, &reachable);
    if liveness.live_in.first().is_some_and(|s| !s.is_empty()) {
        return Err(CompileErrorKind::AllocatorInconsistency);
    }

    let mut neighbors: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (bi, b) in blocks.iter().enumerate() {
        let mut live: BitSet = liveness.live_out[bi].clone();
        for inst in code[b.instr_start..b.instr_end].iter().rev() {
            if let Some(t) = inst.target {
                for other in live.iter() {
                    if other != t.index() {
                        neighbors[t.index()].push(other as u32);
                        neighbors[other].push(t.0);
                    }
                }
                live.clear(t.index());
            }
            inst.for_each_use(|r| live.set(r.index()));
        }
    }

    let mut order: Vec<u32> = Vec::with_capacity(n);
    let mut seen = vec![false; n];
    for inst in code.iter_mut() {
        inst.for_each_reg_mut(|r| {
            if !seen[r.index()] {
                seen[r.index()] = true;
                order.push(r.0);
            }
        });
    }

    let mut color: Vec<Option<u32>> = vec![None; n];
    let mut num_colors = 0_u32;
    let mut taken: Vec<bool> = Vec::new();
    for v in order {
        let adj = &neighbors[v as usize];
        taken.clear();
        taken.resize(adj.len() + 1, false);
        for &u in adj {
            if let Some(c) = color[u as usize]
                && let Some(slot) = taken.get_mut(c as usize)
            {
                *slot = true;
            }
        }
        let c = taken.iter().position(|t| !t).unwrap_or(adj.len());
        let c = u32::try_from(c).unwrap_or(u32::MAX);
        color[v as usize] = Some(c);
        num_colors = num_colors.max(c + 1);
    }

    let mut missing = false;
    for inst in code.iter_mut() {
        inst.for_each_reg_mut(|r| match color[r.index()] {
            Some(c) => *r = Reg(c),
            None => missing = true,
        });
    }
    if missing {
        return Err(CompileErrorKind::AllocatorInconsistency);
    }

    Ok(num_colors.max(1))
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Control-flow graph (CFG) construction for label-addressed code.

use hashbrown::HashMap;

use crate::asm::Label;
use crate::bytecode::{Instruction, Op};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BasicBlock {
    pub(crate) instr_start: usize,
    pub(crate) instr_end: usize,
    pub(crate) succs: Vec<usize>,
}

/// Splits `code` into basic blocks.
///
/// Leaders are: entry, every placed label, and the instruction after any branch. A label that is
/// targeted but never placed gets no edge; the encoder reports it later.
#[must_use]
pub(crate) fn build_basic_blocks(code: &[Instruction<Label>]) -> Vec<BasicBlock> {
    let mut leader = vec![false; code.len() + 1];
    leader[0] = true;
    for (i, inst) in code.iter().enumerate() {
        match inst.op {
            Op::Place(_) => leader[i] = true,
            Op::Jmp { .. }
            | Op::JmpIf { .. }
            | Op::JmpTable { .. }
            | Op::ReturnVoid
            | Op::ReturnValue(_)
            | Op::Unreachable => leader[i + 1] = true,
            _ => {}
        }
    }

    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut start = 0;
    for i in 1..=code.len() {
        if leader[i] || i == code.len() {
            if start < i {
                blocks.push(BasicBlock {
                    instr_start: start,
                    instr_end: i,
                    succs: Vec::new(),
                });
            }
            start = i;
        }
    }

    let mut label_block: HashMap<Label, usize> = HashMap::new();
    for (bi, b) in blocks.iter().enumerate() {
        if let Op::Place(l) = code[b.instr_start].op {
            label_block.insert(l, bi);
        }
    }

    let n = blocks.len();
    for (bi, b) in blocks.iter_mut().enumerate() {
        let last = &code[b.instr_end - 1];
        let fallthrough = (bi + 1 < n).then_some(bi + 1);
        let mut succs: Vec<usize> = Vec::new();
        last.op.for_each_target(|l| {
            if let Some(&t) = label_block.get(l) {
                succs.push(t);
            }
        });
        if !last.op.is_terminator()
            && let Some(f) = fallthrough
        {
            succs.push(f);
        }
        succs.sort_unstable();
        succs.dedup();
        b.succs = succs;
    }

    blocks
}

#[must_use]
pub(crate) fn compute_reachable(blocks: &[BasicBlock]) -> Vec<bool> {
    let mut reachable = vec![false; blocks.len()];
    if blocks.is_empty() {
        return reachable;
    }
    let mut stack = vec![0_usize];
    reachable[0] = true;
    while let Some(b) = stack.pop() {
        for &s in &blocks[b].succs {
            if !reachable[s] {
                reachable[s] = true;
                stack.push(s);
            }
        }
    }
    reachable
}

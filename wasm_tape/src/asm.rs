// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bytecode builder ("assembler") for register bytecode.
//!
//! Instructions are pushed with symbolic [`Label`] targets. Each target word is written as a
//! placeholder and patched with the label's byte offset in [`Asm::finish`], so callers never
//! compute instruction lengths themselves.

use core::fmt;

use crate::bytecode::{Instruction, Op, encode_with};
use crate::format::Writer;

/// A label for control-flow targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    /// Returns the label id.
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// A label that was referenced but never placed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedLabel(pub Label);

impl fmt::Display for UnresolvedLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label L{} was referenced but never placed", self.0.0)
    }
}

impl core::error::Error for UnresolvedLabel {}

#[derive(Copy, Clone, Debug)]
struct Fixup {
    at: usize,
    label: Label,
}

/// Bytecode builder.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    out: Writer,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
}

impl Asm {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current byte offset ("pc") in the output.
    #[must_use]
    pub fn pc(&self) -> u32 {
        u32::try_from(self.out.len()).unwrap_or(u32::MAX)
    }

    /// Allocates a new label.
    #[must_use]
    pub fn label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len()).unwrap_or(u32::MAX);
        self.labels.push(None);
        Label(id)
    }

    /// Places `label` at the current `pc`.
    ///
    /// Labels allocated elsewhere (e.g. by the compiler) are accepted; the table grows to fit.
    pub fn place(&mut self, label: Label) {
        let idx = label.0 as usize;
        if idx >= self.labels.len() {
            self.labels.resize(idx + 1, None);
        }
        self.labels[idx] = Some(self.pc());
    }

    /// Appends one instruction. [`Op::Place`] places its label instead of emitting bytes.
    pub fn push(&mut self, inst: &Instruction<Label>) -> &mut Self {
        if let Op::Place(label) = inst.op {
            self.place(label);
            return self;
        }
        let fixups = &mut self.fixups;
        encode_with(inst, &mut self.out, |w, label| {
            fixups.push(Fixup {
                at: w.len(),
                label: *label,
            });
            w.write_u32_le(0);
        });
        self
    }

    /// Appends every instruction in `insts`.
    pub fn extend<'a>(
        &mut self,
        insts: impl IntoIterator<Item = &'a Instruction<Label>>,
    ) -> &mut Self {
        for inst in insts {
            self.push(inst);
        }
        self
    }

    /// Finalizes and returns the encoded bytecode with every target patched.
    pub fn finish(mut self) -> Result<Vec<u8>, UnresolvedLabel> {
        for f in &self.fixups {
            let Some(target_pc) = self.labels.get(f.label.0 as usize).copied().flatten() else {
                return Err(UnresolvedLabel(f.label));
            };
            self.out.patch_u32_le(f.at, target_pc);
        }
        Ok(self.out.into_inner())
    }
}

/// Assembles a whole instruction list.
pub fn assemble(insts: &[Instruction<Label>]) -> Result<Vec<u8>, UnresolvedLabel> {
    let mut a = Asm::new();
    a.extend(insts);
    a.finish()
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `tracing` integration for `wasm_tape`.
//!
//! [`TracingTraceSink`] turns the VM's trace hooks into `tracing` spans: one span per call frame
//! and per host import, nested the way the frames are. Native routine entries and exits, and
//! optionally every interpreted instruction, become events inside the current span.
//!
//! Span names are static; the human-readable frame name goes into the `label` field, resolved
//! through a [`LabelResolver`].

use std::collections::BTreeMap;

use tracing::span::EnteredSpan;
use tracing::{Level, debug, event, span};
use wasm_tape::module::{ImportKind, Module};
use wasm_tape::opcode::Opcode;
use wasm_tape::trace::{ScopeKind, TraceMask, TraceOutcome, TraceSink};

/// Supplies display labels for frames.
pub trait LabelResolver {
    /// Label for a call frame of `func`.
    fn call_frame_label(&mut self, _func: u32) -> Option<String> {
        None
    }

    /// Label for host import `import`.
    fn host_import_label(&mut self, _import: u32) -> Option<String> {
        None
    }
}

/// Labels nothing; spans carry only indices.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoLabels;

impl LabelResolver for NoLabels {}

/// Labels frames with the module's debug names and imports with `module.field`.
#[derive(Clone, Debug, Default)]
pub struct ModuleLabels {
    functions: BTreeMap<u32, String>,
    imports: Vec<String>,
}

impl ModuleLabels {
    /// Collects the labels of `module`.
    #[must_use]
    pub fn new(module: &Module) -> Self {
        let imports: Vec<String> = module
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Function { .. }))
            .map(|i| format!("{}.{}", i.module, i.field))
            .collect();
        let mut functions: BTreeMap<u32, String> = module
            .function_names
            .iter()
            .map(|(func, name)| (*func, name.clone()))
            .collect();
        for (idx, name) in imports.iter().enumerate() {
            let func = u32::try_from(idx).unwrap_or(u32::MAX);
            functions.entry(func).or_insert_with(|| name.clone());
        }
        Self { functions, imports }
    }
}

impl LabelResolver for ModuleLabels {
    fn call_frame_label(&mut self, func: u32) -> Option<String> {
        self.functions.get(&func).cloned()
    }

    fn host_import_label(&mut self, import: u32) -> Option<String> {
        self.imports.get(import as usize).cloned()
    }
}

/// A [`TraceSink`] that reports into `tracing`.
pub struct TracingTraceSink<R: LabelResolver = NoLabels> {
    resolver: R,
    mask: TraceMask,
    spans: Vec<EnteredSpan>,
}

impl<R: LabelResolver> core::fmt::Debug for TracingTraceSink<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TracingTraceSink")
            .field("mask", &self.mask)
            .field("open_spans", &self.spans.len())
            .finish_non_exhaustive()
    }
}

impl Default for TracingTraceSink<NoLabels> {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingTraceSink<NoLabels> {
    /// Creates a sink without labels.
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolver(NoLabels)
    }
}

impl<R: LabelResolver> TracingTraceSink<R> {
    /// Creates a sink that labels frames through `resolver`.
    ///
    /// Every event except per-instruction tracing is enabled.
    #[must_use]
    pub fn with_resolver(resolver: R) -> Self {
        Self {
            resolver,
            mask: TraceMask::RUN | TraceMask::CALL | TraceMask::HOST | TraceMask::NATIVE,
            spans: Vec::new(),
        }
    }

    /// Also emits an event for every interpreted instruction.
    #[must_use]
    pub fn with_instructions(mut self) -> Self {
        self.mask |= TraceMask::INSTR;
        self
    }

    /// Returns the resolver.
    pub fn resolver_mut(&mut self) -> &mut R {
        &mut self.resolver
    }
}

impl<R: LabelResolver> TraceSink for TracingTraceSink<R> {
    fn mask(&self) -> TraceMask {
        self.mask
    }

    fn run_start(&mut self, entry: u32, arg_count: usize) {
        debug!(entry, arg_count, "run start");
    }

    fn instr(&mut self, func: u32, pc: u32, opcode: Opcode) {
        event!(Level::TRACE, func, pc, op = opcode.name());
    }

    fn scope_enter(&mut self, kind: ScopeKind, depth: usize) {
        let span = match kind {
            ScopeKind::CallFrame { func } => {
                let label = self.resolver.call_frame_label(func).unwrap_or_default();
                span!(Level::TRACE, "call_frame", func, depth, label = %label)
            }
            ScopeKind::HostImport { import } => {
                let label = self.resolver.host_import_label(import).unwrap_or_default();
                span!(Level::TRACE, "host_import", import, label = %label)
            }
        };
        self.spans.push(span.entered());
    }

    fn scope_exit(&mut self, _kind: ScopeKind, _depth: usize) {
        self.spans.pop();
    }

    fn native_enter(&mut self, func: u32, continuation: u32) {
        event!(Level::TRACE, func, continuation, "native enter");
    }

    fn native_exit(&mut self, func: u32, code: i32) {
        event!(Level::TRACE, func, code, "native exit");
    }

    fn run_end(&mut self, outcome: TraceOutcome<'_>) {
        // A trap leaves the frames of the failed call chain open.
        self.spans.clear();
        match outcome {
            TraceOutcome::Ok(result) => debug!(?result, "run end"),
            TraceOutcome::Err(error) => debug!(%error, "run trapped"),
        }
    }
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host import interface.
//!
//! Imports are resolved once, at instantiation, through an embedder-provided [`ImportResolver`].
//! The engine never interprets an import: it invokes the resolved [`HostFunction`] with an
//! [`ImportContext`] over the calling frame and stores the returned 64-bit value.

use core::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

/// Errors a host function can return. Any of them traps the running call chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostError {
    /// A parameter index past the import's arity.
    MissingParam(usize),
    /// A memory access outside linear memory.
    MemoryOutOfBounds {
        /// Start address.
        addr: u64,
        /// Access length in bytes.
        len: u64,
    },
    /// A global index out of range.
    InvalidGlobal(u32),
    /// The host failed for its own reasons.
    Failed(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParam(i) => write!(f, "import parameter {i} does not exist"),
            Self::MemoryOutOfBounds { addr, len } => {
                write!(
                    f,
                    "host memory access of {len} bytes at {addr:#x} is out of bounds"
                )
            }
            Self::InvalidGlobal(i) => write!(f, "global {i} out of range"),
            Self::Failed(msg) => write!(f, "host call failed: {msg}"),
        }
    }
}

impl core::error::Error for HostError {}

/// A resolved host function.
pub type HostFunction = Arc<dyn Fn(&mut ImportContext<'_>) -> Result<i64, HostError> + Send + Sync>;

/// What a host function sees of the VM while it runs.
pub struct ImportContext<'a> {
    params: &'a [i64],
    memory: &'a mut [u8],
    globals: &'a mut [i64],
}

impl<'a> ImportContext<'a> {
    pub(crate) fn new(params: &'a [i64], memory: &'a mut [u8], globals: &'a mut [i64]) -> Self {
        Self {
            params,
            memory,
            globals,
        }
    }

    /// The call arguments, in declaration order. `i32` arguments are zero-extended.
    #[must_use]
    pub fn params(&self) -> &[i64] {
        self.params
    }

    /// Returns argument `idx`.
    pub fn param(&self, idx: usize) -> Result<i64, HostError> {
        self.params
            .get(idx)
            .copied()
            .ok_or(HostError::MissingParam(idx))
    }

    /// Linear memory.
    #[must_use]
    pub fn memory(&self) -> &[u8] {
        self.memory
    }

    /// Linear memory, writable. The host cannot resize it.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.memory
    }

    fn range(&self, addr: u64, len: u64) -> Result<core::ops::Range<usize>, HostError> {
        let oob = HostError::MemoryOutOfBounds { addr, len };
        let end = addr.checked_add(len).ok_or_else(|| oob.clone())?;
        if end > self.memory.len() as u64 {
            return Err(oob);
        }
        Ok(addr as usize..end as usize)
    }

    /// Reads `len` bytes at `addr`.
    pub fn read(&self, addr: u64, len: u64) -> Result<&[u8], HostError> {
        let r = self.range(addr, len)?;
        Ok(&self.memory[r])
    }

    /// Writes `bytes` at `addr`.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), HostError> {
        let r = self.range(addr, bytes.len() as u64)?;
        self.memory[r].copy_from_slice(bytes);
        Ok(())
    }

    /// Global values, in global index order.
    #[must_use]
    pub fn globals(&self) -> &[i64] {
        self.globals
    }

    /// Sets global `idx`.
    pub fn set_global(&mut self, idx: u32, value: i64) -> Result<(), HostError> {
        let slot = self
            .globals
            .get_mut(idx as usize)
            .ok_or(HostError::InvalidGlobal(idx))?;
        *slot = value;
        Ok(())
    }
}

impl fmt::Debug for ImportContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportContext")
            .field("params", &self.params)
            .field("memory_len", &self.memory.len())
            .field("globals", &self.globals.len())
            .finish()
    }
}

/// Resolves a module's imports.
pub trait ImportResolver: Send {
    /// Returns the host function for `module`.`field`, if provided.
    fn resolve_function(&self, module: &str, field: &str) -> Option<HostFunction>;

    /// Returns the value of global `module`.`field`, if provided.
    fn resolve_global(&self, _module: &str, _field: &str) -> Option<i64> {
        None
    }

    /// Returns an independent copy of this resolver for a cloned VM.
    fn clone_resolver(&self) -> Box<dyn ImportResolver>;
}

/// A resolver that provides nothing. Modules with imports fail to instantiate against it.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoImports;

impl ImportResolver for NoImports {
    fn resolve_function(&self, _module: &str, _field: &str) -> Option<HostFunction> {
        None
    }

    fn clone_resolver(&self) -> Box<dyn ImportResolver> {
        Box::new(*self)
    }
}

/// A resolver built from explicit `(module, field)` registrations.
#[derive(Clone, Default)]
pub struct HostRegistry {
    functions: HashMap<(String, String), HostFunction>,
    globals: HashMap<(String, String), i64>,
}

impl HostRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host function.
    pub fn insert_function(
        &mut self,
        module: &str,
        field: &str,
        f: impl Fn(&mut ImportContext<'_>) -> Result<i64, HostError> + Send + Sync + 'static,
    ) {
        self.functions
            .insert((module.into(), field.into()), Arc::new(f));
    }

    /// Registers a host function, builder style.
    #[must_use]
    pub fn with_function(
        mut self,
        module: &str,
        field: &str,
        f: impl Fn(&mut ImportContext<'_>) -> Result<i64, HostError> + Send + Sync + 'static,
    ) -> Self {
        self.insert_function(module, field, f);
        self
    }

    /// Registers a global value, builder style.
    #[must_use]
    pub fn with_global(mut self, module: &str, field: &str, value: i64) -> Self {
        self.globals.insert((module.into(), field.into()), value);
        self
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("functions", &self.functions.len())
            .field("globals", &self.globals)
            .finish()
    }
}

impl ImportResolver for HostRegistry {
    fn resolve_function(&self, module: &str, field: &str) -> Option<HostFunction> {
        self.functions
            .get(&(module.to_owned(), field.to_owned()))
            .cloned()
    }

    fn resolve_global(&self, module: &str, field: &str) -> Option<i64> {
        self.globals
            .get(&(module.to_owned(), field.to_owned()))
            .copied()
    }

    fn clone_resolver(&self) -> Box<dyn ImportResolver> {
        Box::new(self.clone())
    }
}

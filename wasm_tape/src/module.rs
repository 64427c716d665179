// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Decoded module model.
//!
//! A [`Module`] is the already-parsed program handed to the compiler: types, the import table,
//! function bodies as [`Operator`] sequences, globals, memory/table limits, segments and exports.
//! It is immutable once built.
//!
//! The function index space is imported functions followed by locally defined functions; globals
//! follow the same rule.

use hashbrown::HashMap;

use crate::operator::Operator;

/// Size of one linear-memory page in bytes.
pub const PAGE_SIZE: usize = 65_536;

/// Largest number of pages a 32-bit address space can hold.
pub const MAX_PAGES: u32 = 65_536;

/// A value type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
}

impl ValueType {
    /// Returns `true` for the float types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// A function signature.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FuncType {
    /// Parameter types.
    pub params: Vec<ValueType>,
    /// Result types (at most one).
    pub results: Vec<ValueType>,
}

impl FuncType {
    /// Creates a signature from parameter and result types.
    #[must_use]
    pub fn new(params: impl Into<Vec<ValueType>>, results: impl Into<Vec<ValueType>>) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }
}

/// What an import provides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportKind {
    /// A host function with the given type index.
    Function {
        /// Index into [`Module::types`].
        type_idx: u32,
    },
    /// A host-provided global.
    Global {
        /// Value type of the global.
        ty: ValueType,
        /// Whether the module may write it.
        mutable: bool,
    },
}

/// An import entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    /// Host module name.
    pub module: String,
    /// Field name within the host module.
    pub field: String,
    /// What the import provides.
    pub kind: ImportKind,
}

/// A locally defined function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Function {
    /// Index into [`Module::types`].
    pub type_idx: u32,
    /// Declared locals (beyond the parameters) as run-length `(count, type)` pairs.
    pub locals: Vec<(u32, ValueType)>,
    /// Operator sequence, terminated by a final [`Operator::End`].
    pub body: Vec<Operator>,
}

impl Function {
    /// Total number of declared locals, saturating at `u32::MAX`.
    #[must_use]
    pub fn num_declared_locals(&self) -> u32 {
        self.locals
            .iter()
            .fold(0_u32, |acc, (n, _)| acc.saturating_add(*n))
    }
}

/// A constant initializer expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstExpr {
    /// `i32.const`.
    I32(i32),
    /// `i64.const`.
    I64(i64),
    /// `f32.const` as raw bits.
    F32(u32),
    /// `f64.const` as raw bits.
    F64(u64),
    /// The value of an (imported) global.
    GetGlobal(u32),
}

/// A locally defined global.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Global {
    /// Value type.
    pub ty: ValueType,
    /// Whether the global may be written.
    pub mutable: bool,
    /// Initial value.
    pub init: ConstExpr,
}

/// Page limits for linear memory or entry limits for a table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    /// Initial size.
    pub initial: u32,
    /// Optional maximum size.
    pub maximum: Option<u32>,
}

/// Initial table contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementSegment {
    /// Starting table index.
    pub offset: ConstExpr,
    /// Function indices placed at consecutive table slots.
    pub functions: Vec<u32>,
}

/// Initial memory contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSegment {
    /// Starting memory address.
    pub offset: ConstExpr,
    /// Bytes copied at instantiation.
    pub bytes: Vec<u8>,
}

/// What an export refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportKind {
    /// A function index.
    Function(u32),
    /// A global index.
    Global(u32),
    /// The linear memory.
    Memory,
    /// The table.
    Table,
}

/// An export entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// Exported name.
    pub name: String,
    /// What is exported.
    pub kind: ExportKind,
}

/// A decoded module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Module {
    /// Signature table.
    pub types: Vec<FuncType>,
    /// Imports, in declaration order.
    pub imports: Vec<Import>,
    /// Locally defined functions.
    pub functions: Vec<Function>,
    /// Locally defined globals.
    pub globals: Vec<Global>,
    /// Linear memory limits, if the module has a memory.
    pub memory: Option<Limits>,
    /// Table limits, if the module has a table.
    pub table: Option<Limits>,
    /// Table initializers.
    pub elements: Vec<ElementSegment>,
    /// Memory initializers.
    pub data: Vec<DataSegment>,
    /// Export table.
    pub exports: Vec<Export>,
    /// Function run once before the first invocation.
    pub start: Option<u32>,
    /// Debug names keyed by function index.
    pub function_names: HashMap<u32, String>,
}

impl Module {
    /// Number of imported functions (they occupy the low function indices).
    #[must_use]
    pub fn num_imported_functions(&self) -> u32 {
        let n = self
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Function { .. }))
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Number of imported globals (they occupy the low global indices).
    #[must_use]
    pub fn num_imported_globals(&self) -> u32 {
        let n = self
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global { .. }))
            .count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Size of the function index space.
    #[must_use]
    pub fn num_functions(&self) -> u32 {
        let defined = u32::try_from(self.functions.len()).unwrap_or(u32::MAX);
        self.num_imported_functions().saturating_add(defined)
    }

    /// Size of the global index space.
    #[must_use]
    pub fn num_globals(&self) -> u32 {
        let defined = u32::try_from(self.globals.len()).unwrap_or(u32::MAX);
        self.num_imported_globals().saturating_add(defined)
    }

    /// Returns the type index of function `func` in the index space.
    #[must_use]
    pub fn function_type_index(&self, func: u32) -> Option<u32> {
        let imported = self.num_imported_functions();
        if func < imported {
            return self
                .imports
                .iter()
                .filter_map(|i| match i.kind {
                    ImportKind::Function { type_idx } => Some(type_idx),
                    ImportKind::Global { .. } => None,
                })
                .nth(func as usize);
        }
        self.functions
            .get((func - imported) as usize)
            .map(|f| f.type_idx)
    }

    /// Returns the signature of function `func` in the index space.
    #[must_use]
    pub fn function_type(&self, func: u32) -> Option<&FuncType> {
        self.types.get(self.function_type_index(func)? as usize)
    }

    /// Returns the value type and mutability of global `global` in the index space.
    #[must_use]
    pub fn global_type(&self, global: u32) -> Option<(ValueType, bool)> {
        let imported = self.num_imported_globals();
        if global < imported {
            return self
                .imports
                .iter()
                .filter_map(|i| match i.kind {
                    ImportKind::Global { ty, mutable } => Some((ty, mutable)),
                    ImportKind::Function { .. } => None,
                })
                .nth(global as usize);
        }
        self.globals
            .get((global - imported) as usize)
            .map(|g| (g.ty, g.mutable))
    }

    /// Looks up an exported function by name.
    #[must_use]
    pub fn export_function(&self, name: &str) -> Option<u32> {
        self.exports.iter().find_map(|e| match e.kind {
            ExportKind::Function(idx) if e.name == name => Some(idx),
            _ => None,
        })
    }

    /// Returns the debug name of `func`, if any.
    #[must_use]
    pub fn function_name(&self, func: u32) -> Option<&str> {
        self.function_names.get(&func).map(String::as_str)
    }
}

/// Fluent builder for [`Module`]s.
///
/// Indices returned by the builder are already in the module's index spaces. Imports must be
/// declared before any function or global is defined, otherwise earlier indices would shift.
#[derive(Clone, Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or reuses) a signature and returns its type index.
    pub fn func_type(&mut self, params: &[ValueType], results: &[ValueType]) -> u32 {
        let ty = FuncType::new(params, results);
        if let Some(idx) = self.module.types.iter().position(|t| *t == ty) {
            return u32::try_from(idx).unwrap_or(u32::MAX);
        }
        self.module.types.push(ty);
        u32::try_from(self.module.types.len() - 1).unwrap_or(u32::MAX)
    }

    /// Declares an imported function and returns its function index.
    pub fn import_function(
        &mut self,
        module: &str,
        field: &str,
        params: &[ValueType],
        results: &[ValueType],
    ) -> u32 {
        debug_assert!(
            self.module.functions.is_empty(),
            "imports must precede defined functions"
        );
        let type_idx = self.func_type(params, results);
        self.module.imports.push(Import {
            module: module.into(),
            field: field.into(),
            kind: ImportKind::Function { type_idx },
        });
        self.module.num_imported_functions() - 1
    }

    /// Declares an imported global and returns its global index.
    pub fn import_global(
        &mut self,
        module: &str,
        field: &str,
        ty: ValueType,
        mutable: bool,
    ) -> u32 {
        debug_assert!(
            self.module.globals.is_empty(),
            "imports must precede defined globals"
        );
        self.module.imports.push(Import {
            module: module.into(),
            field: field.into(),
            kind: ImportKind::Global { ty, mutable },
        });
        self.module.num_imported_globals() - 1
    }

    /// Defines a function and returns its function index.
    pub fn function(
        &mut self,
        params: &[ValueType],
        results: &[ValueType],
        locals: &[(u32, ValueType)],
        body: Vec<Operator>,
    ) -> u32 {
        let type_idx = self.func_type(params, results);
        self.module.functions.push(Function {
            type_idx,
            locals: locals.to_vec(),
            body,
        });
        self.module.num_functions() - 1
    }

    /// Defines a global and returns its global index.
    pub fn global(&mut self, ty: ValueType, mutable: bool, init: ConstExpr) -> u32 {
        self.module.globals.push(Global { ty, mutable, init });
        self.module.num_globals() - 1
    }

    /// Declares the linear memory.
    pub fn memory(&mut self, initial: u32, maximum: Option<u32>) -> &mut Self {
        self.module.memory = Some(Limits { initial, maximum });
        self
    }

    /// Declares the table.
    pub fn table(&mut self, initial: u32, maximum: Option<u32>) -> &mut Self {
        self.module.table = Some(Limits { initial, maximum });
        self
    }

    /// Adds a table initializer at a constant offset.
    pub fn element(&mut self, offset: u32, functions: &[u32]) -> &mut Self {
        self.module.elements.push(ElementSegment {
            offset: ConstExpr::I32(offset.cast_signed()),
            functions: functions.to_vec(),
        });
        self
    }

    /// Adds a memory initializer at a constant address.
    pub fn data(&mut self, offset: u32, bytes: &[u8]) -> &mut Self {
        self.module.data.push(DataSegment {
            offset: ConstExpr::I32(offset.cast_signed()),
            bytes: bytes.to_vec(),
        });
        self
    }

    /// Exports function `func` as `name`.
    pub fn export_function(&mut self, name: &str, func: u32) -> &mut Self {
        self.module.exports.push(Export {
            name: name.into(),
            kind: ExportKind::Function(func),
        });
        self
    }

    /// Sets the start function.
    pub fn start(&mut self, func: u32) -> &mut Self {
        self.module.start = Some(func);
        self
    }

    /// Attaches a debug name to `func`.
    pub fn name_function(&mut self, func: u32, name: &str) -> &mut Self {
        self.module.function_names.insert(func, name.into());
        self
    }

    /// Finishes the module.
    #[must_use]
    pub fn build(self) -> Module {
        self.module
    }
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Opcode tags for the register bytecode.
//!
//! Numeric operators share their tag between the stack-machine input ([`crate::operator`]) and
//! the register form, so the compiler never needs a translation table for arithmetic.

/// Operand layout class of an opcode.
///
/// Every opcode except the [`OpClass::Special`] ones has a uniform layout determined by its class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Opcode with its own operand layout (control flow, calls, locals, globals, memory size).
    Special,
    /// 32-bit immediate.
    Const32,
    /// 64-bit immediate.
    Const64,
    /// One source register.
    Unary,
    /// Two source registers.
    Binary,
    /// `align, offset, base`.
    Load,
    /// `align, offset, base, value`.
    Store,
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal, $mnemonic:literal, $class:ident;)*) => {
        /// A register-bytecode opcode.
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $(
                #[doc = concat!("`", $mnemonic, "`")]
                $name = $byte,
            )*
        }

        impl Opcode {
            /// Every opcode, in tag order.
            pub const ALL: &'static [Self] = &[$(Self::$name),*];

            /// Parses an opcode from its tag byte.
            #[must_use]
            pub const fn from_u8(b: u8) -> Option<Self> {
                match b {
                    $($byte => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Returns the textual mnemonic used by the disassembler.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $mnemonic,)*
                }
            }

            /// Returns the operand layout class.
            #[must_use]
            pub const fn class(self) -> OpClass {
                match self {
                    $(Self::$name => OpClass::$class,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", Special;
    Unreachable = 0x01, "unreachable", Special;
    Select = 0x02, "select", Special;
    Phi = 0x03, "phi", Special;
    Jmp = 0x04, "jmp", Special;
    JmpIf = 0x05, "jmp_if", Special;
    JmpTable = 0x06, "jmp_table", Special;
    ReturnVoid = 0x07, "return_void", Special;
    ReturnValue = 0x08, "return_value", Special;
    Call = 0x09, "call", Special;
    CallIndirect = 0x0A, "call_indirect", Special;
    InvokeImport = 0x0B, "invoke_import", Special;
    AddGas = 0x0C, "add_gas", Special;
    FpDisabled = 0x0D, "fp_disabled", Special;
    GetLocal = 0x10, "get_local", Special;
    SetLocal = 0x11, "set_local", Special;
    GetGlobal = 0x12, "get_global", Special;
    SetGlobal = 0x13, "set_global", Special;
    CurrentMemory = 0x14, "current_memory", Special;
    GrowMemory = 0x15, "grow_memory", Special;

    I32Const = 0x18, "i32.const", Const32;
    I64Const = 0x19, "i64.const", Const64;
    F32Const = 0x1A, "f32.const", Const32;
    F64Const = 0x1B, "f64.const", Const64;

    I32Clz = 0x20, "i32.clz", Unary;
    I32Ctz = 0x21, "i32.ctz", Unary;
    I32Popcnt = 0x22, "i32.popcnt", Unary;
    I32Eqz = 0x23, "i32.eqz", Unary;
    I32Add = 0x24, "i32.add", Binary;
    I32Sub = 0x25, "i32.sub", Binary;
    I32Mul = 0x26, "i32.mul", Binary;
    I32DivS = 0x27, "i32.div_s", Binary;
    I32DivU = 0x28, "i32.div_u", Binary;
    I32RemS = 0x29, "i32.rem_s", Binary;
    I32RemU = 0x2A, "i32.rem_u", Binary;
    I32And = 0x2B, "i32.and", Binary;
    I32Or = 0x2C, "i32.or", Binary;
    I32Xor = 0x2D, "i32.xor", Binary;
    I32Shl = 0x2E, "i32.shl", Binary;
    I32ShrS = 0x2F, "i32.shr_s", Binary;
    I32ShrU = 0x30, "i32.shr_u", Binary;
    I32Rotl = 0x31, "i32.rotl", Binary;
    I32Rotr = 0x32, "i32.rotr", Binary;
    I32Eq = 0x33, "i32.eq", Binary;
    I32Ne = 0x34, "i32.ne", Binary;
    I32LtS = 0x35, "i32.lt_s", Binary;
    I32LtU = 0x36, "i32.lt_u", Binary;
    I32GtS = 0x37, "i32.gt_s", Binary;
    I32GtU = 0x38, "i32.gt_u", Binary;
    I32LeS = 0x39, "i32.le_s", Binary;
    I32LeU = 0x3A, "i32.le_u", Binary;
    I32GeS = 0x3B, "i32.ge_s", Binary;
    I32GeU = 0x3C, "i32.ge_u", Binary;

    I64Clz = 0x40, "i64.clz", Unary;
    I64Ctz = 0x41, "i64.ctz", Unary;
    I64Popcnt = 0x42, "i64.popcnt", Unary;
    I64Eqz = 0x43, "i64.eqz", Unary;
    I64Add = 0x44, "i64.add", Binary;
    I64Sub = 0x45, "i64.sub", Binary;
    I64Mul = 0x46, "i64.mul", Binary;
    I64DivS = 0x47, "i64.div_s", Binary;
    I64DivU = 0x48, "i64.div_u", Binary;
    I64RemS = 0x49, "i64.rem_s", Binary;
    I64RemU = 0x4A, "i64.rem_u", Binary;
    I64And = 0x4B, "i64.and", Binary;
    I64Or = 0x4C, "i64.or", Binary;
    I64Xor = 0x4D, "i64.xor", Binary;
    I64Shl = 0x4E, "i64.shl", Binary;
    I64ShrS = 0x4F, "i64.shr_s", Binary;
    I64ShrU = 0x50, "i64.shr_u", Binary;
    I64Rotl = 0x51, "i64.rotl", Binary;
    I64Rotr = 0x52, "i64.rotr", Binary;
    I64Eq = 0x53, "i64.eq", Binary;
    I64Ne = 0x54, "i64.ne", Binary;
    I64LtS = 0x55, "i64.lt_s", Binary;
    I64LtU = 0x56, "i64.lt_u", Binary;
    I64GtS = 0x57, "i64.gt_s", Binary;
    I64GtU = 0x58, "i64.gt_u", Binary;
    I64LeS = 0x59, "i64.le_s", Binary;
    I64LeU = 0x5A, "i64.le_u", Binary;
    I64GeS = 0x5B, "i64.ge_s", Binary;
    I64GeU = 0x5C, "i64.ge_u", Binary;

    F32Abs = 0x60, "f32.abs", Unary;
    F32Neg = 0x61, "f32.neg", Unary;
    F32Ceil = 0x62, "f32.ceil", Unary;
    F32Floor = 0x63, "f32.floor", Unary;
    F32Trunc = 0x64, "f32.trunc", Unary;
    F32Nearest = 0x65, "f32.nearest", Unary;
    F32Sqrt = 0x66, "f32.sqrt", Unary;
    F32Add = 0x67, "f32.add", Binary;
    F32Sub = 0x68, "f32.sub", Binary;
    F32Mul = 0x69, "f32.mul", Binary;
    F32Div = 0x6A, "f32.div", Binary;
    F32Min = 0x6B, "f32.min", Binary;
    F32Max = 0x6C, "f32.max", Binary;
    F32Copysign = 0x6D, "f32.copysign", Binary;
    F32Eq = 0x6E, "f32.eq", Binary;
    F32Ne = 0x6F, "f32.ne", Binary;
    F32Lt = 0x70, "f32.lt", Binary;
    F32Gt = 0x71, "f32.gt", Binary;
    F32Le = 0x72, "f32.le", Binary;
    F32Ge = 0x73, "f32.ge", Binary;

    F64Abs = 0x78, "f64.abs", Unary;
    F64Neg = 0x79, "f64.neg", Unary;
    F64Ceil = 0x7A, "f64.ceil", Unary;
    F64Floor = 0x7B, "f64.floor", Unary;
    F64Trunc = 0x7C, "f64.trunc", Unary;
    F64Nearest = 0x7D, "f64.nearest", Unary;
    F64Sqrt = 0x7E, "f64.sqrt", Unary;
    F64Add = 0x7F, "f64.add", Binary;
    F64Sub = 0x80, "f64.sub", Binary;
    F64Mul = 0x81, "f64.mul", Binary;
    F64Div = 0x82, "f64.div", Binary;
    F64Min = 0x83, "f64.min", Binary;
    F64Max = 0x84, "f64.max", Binary;
    F64Copysign = 0x85, "f64.copysign", Binary;
    F64Eq = 0x86, "f64.eq", Binary;
    F64Ne = 0x87, "f64.ne", Binary;
    F64Lt = 0x88, "f64.lt", Binary;
    F64Gt = 0x89, "f64.gt", Binary;
    F64Le = 0x8A, "f64.le", Binary;
    F64Ge = 0x8B, "f64.ge", Binary;

    I32WrapI64 = 0x90, "i32.wrap/i64", Unary;
    I32TruncSF32 = 0x91, "i32.trunc_s/f32", Unary;
    I32TruncUF32 = 0x92, "i32.trunc_u/f32", Unary;
    I32TruncSF64 = 0x93, "i32.trunc_s/f64", Unary;
    I32TruncUF64 = 0x94, "i32.trunc_u/f64", Unary;
    I64ExtendSI32 = 0x95, "i64.extend_s/i32", Unary;
    I64ExtendUI32 = 0x96, "i64.extend_u/i32", Unary;
    I64TruncSF32 = 0x97, "i64.trunc_s/f32", Unary;
    I64TruncUF32 = 0x98, "i64.trunc_u/f32", Unary;
    I64TruncSF64 = 0x99, "i64.trunc_s/f64", Unary;
    I64TruncUF64 = 0x9A, "i64.trunc_u/f64", Unary;
    F32ConvertSI32 = 0x9B, "f32.convert_s/i32", Unary;
    F32ConvertUI32 = 0x9C, "f32.convert_u/i32", Unary;
    F32ConvertSI64 = 0x9D, "f32.convert_s/i64", Unary;
    F32ConvertUI64 = 0x9E, "f32.convert_u/i64", Unary;
    F32DemoteF64 = 0x9F, "f32.demote/f64", Unary;
    F64ConvertSI32 = 0xA0, "f64.convert_s/i32", Unary;
    F64ConvertUI32 = 0xA1, "f64.convert_u/i32", Unary;
    F64ConvertSI64 = 0xA2, "f64.convert_s/i64", Unary;
    F64ConvertUI64 = 0xA3, "f64.convert_u/i64", Unary;
    F64PromoteF32 = 0xA4, "f64.promote/f32", Unary;
    I32ReinterpretF32 = 0xA5, "i32.reinterpret/f32", Unary;
    I64ReinterpretF64 = 0xA6, "i64.reinterpret/f64", Unary;
    F32ReinterpretI32 = 0xA7, "f32.reinterpret/i32", Unary;
    F64ReinterpretI64 = 0xA8, "f64.reinterpret/i64", Unary;

    I32Load = 0xB0, "i32.load", Load;
    I64Load = 0xB1, "i64.load", Load;
    F32Load = 0xB2, "f32.load", Load;
    F64Load = 0xB3, "f64.load", Load;
    I32Load8S = 0xB4, "i32.load8_s", Load;
    I32Load8U = 0xB5, "i32.load8_u", Load;
    I32Load16S = 0xB6, "i32.load16_s", Load;
    I32Load16U = 0xB7, "i32.load16_u", Load;
    I64Load8S = 0xB8, "i64.load8_s", Load;
    I64Load8U = 0xB9, "i64.load8_u", Load;
    I64Load16S = 0xBA, "i64.load16_s", Load;
    I64Load16U = 0xBB, "i64.load16_u", Load;
    I64Load32S = 0xBC, "i64.load32_s", Load;
    I64Load32U = 0xBD, "i64.load32_u", Load;

    I32Store = 0xC0, "i32.store", Store;
    I64Store = 0xC1, "i64.store", Store;
    F32Store = 0xC2, "f32.store", Store;
    F64Store = 0xC3, "f64.store", Store;
    I32Store8 = 0xC4, "i32.store8", Store;
    I32Store16 = 0xC5, "i32.store16", Store;
    I64Store8 = 0xC6, "i64.store8", Store;
    I64Store16 = 0xC7, "i64.store16", Store;
    I64Store32 = 0xC8, "i64.store32", Store;
}

impl Opcode {
    /// Returns the opcode tag byte.
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` if control never falls through to the next instruction.
    #[must_use]
    pub const fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::JmpTable | Self::ReturnVoid | Self::ReturnValue | Self::Unreachable
        )
    }

    /// Returns `true` if the instruction touches floating-point values in any way.
    ///
    /// Reinterpretations count: they are the only way float bits reach integer code.
    #[must_use]
    pub const fn is_float(self) -> bool {
        let b = self as u8;
        match self {
            Self::F32Const
            | Self::F64Const
            | Self::F32Load
            | Self::F64Load
            | Self::F32Store
            | Self::F64Store => true,
            Self::I32WrapI64 | Self::I64ExtendSI32 | Self::I64ExtendUI32 => false,
            _ => (b >= 0x60 && b <= 0x8B) || (b >= 0x90 && b <= 0xA8),
        }
    }

    /// Returns the number of bytes a load or store touches, or `None` for other opcodes.
    #[must_use]
    pub const fn access_size(self) -> Option<u32> {
        match self {
            Self::I32Load8S
            | Self::I32Load8U
            | Self::I64Load8S
            | Self::I64Load8U
            | Self::I32Store8
            | Self::I64Store8 => Some(1),
            Self::I32Load16S
            | Self::I32Load16U
            | Self::I64Load16S
            | Self::I64Load16U
            | Self::I32Store16
            | Self::I64Store16 => Some(2),
            Self::I32Load
            | Self::F32Load
            | Self::I64Load32S
            | Self::I64Load32U
            | Self::I32Store
            | Self::F32Store
            | Self::I64Store32 => Some(4),
            Self::I64Load | Self::F64Load | Self::I64Store | Self::F64Store => Some(8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_stable() {
        assert_eq!(Opcode::Jmp as u8, 0x04);
        assert_eq!(Opcode::I32Add as u8, 0x24);
        assert_eq!(Opcode::I64Add as u8, 0x44);
        assert_eq!(Opcode::F64Ge as u8, 0x8B);
        assert_eq!(Opcode::I64Store32 as u8, 0xC8);
    }

    #[test]
    fn from_u8_inverts_byte() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.byte()), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
        assert_eq!(Opcode::from_u8(0x0E), None);
    }

    #[test]
    fn float_classification() {
        assert!(Opcode::F32Add.is_float());
        assert!(Opcode::F64Load.is_float());
        assert!(Opcode::I32TruncSF64.is_float());
        assert!(Opcode::I64ReinterpretF64.is_float());
        assert!(!Opcode::I32WrapI64.is_float());
        assert!(!Opcode::I64ExtendUI32.is_float());
        assert!(!Opcode::I64Load.is_float());
        assert!(!Opcode::Select.is_float());
    }

    #[test]
    fn terminator_classification() {
        assert!(Opcode::Jmp.is_terminator());
        assert!(Opcode::JmpTable.is_terminator());
        assert!(Opcode::ReturnValue.is_terminator());
        assert!(Opcode::Unreachable.is_terminator());
        assert!(!Opcode::JmpIf.is_terminator());
        assert!(!Opcode::Call.is_terminator());
    }
}

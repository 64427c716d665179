// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Numeric operator semantics.
//!
//! Values live in 64-bit cells. 32-bit integers and `f32` bit patterns are stored zero-extended;
//! every result produced here keeps that invariant.

use crate::opcode::Opcode;
use crate::vm::Trap;

#[inline]
fn i32_of(x: i64) -> i32 {
    x as i32
}

#[inline]
fn u32_of(x: i64) -> u32 {
    x as u32
}

#[inline]
fn from_u32(v: u32) -> i64 {
    i64::from(v)
}

#[inline]
fn from_i32(v: i32) -> i64 {
    from_u32(v.cast_unsigned())
}

#[inline]
fn from_bool(b: bool) -> i64 {
    i64::from(b)
}

#[inline]
fn f32_of(x: i64) -> f32 {
    f32::from_bits(u32_of(x))
}

#[inline]
fn f64_of(x: i64) -> f64 {
    f64::from_bits(x.cast_unsigned())
}

#[inline]
fn from_f32(v: f32) -> i64 {
    from_u32(v.to_bits())
}

#[inline]
fn from_f64(v: f64) -> i64 {
    v.to_bits().cast_signed()
}

fn min_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        // Only differs for signed zeros.
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn max_f32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

fn min_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn max_f64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

// Float-to-int truncations trap on NaN and on results outside the target range. `f32` inputs are
// promoted to `f64` first, which is exact.

fn trunc_i32(x: f64) -> Result<i32, Trap> {
    let t = x.trunc();
    if x.is_nan() || t < -2_147_483_648.0 || t >= 2_147_483_648.0 {
        return Err(Trap::Arithmetic);
    }
    Ok(t as i32)
}

fn trunc_u32(x: f64) -> Result<u32, Trap> {
    let t = x.trunc();
    if x.is_nan() || t <= -1.0 || t >= 4_294_967_296.0 {
        return Err(Trap::Arithmetic);
    }
    Ok(t as u32)
}

fn trunc_i64(x: f64) -> Result<i64, Trap> {
    let t = x.trunc();
    if x.is_nan() || t < -9_223_372_036_854_775_808.0 || t >= 9_223_372_036_854_775_808.0 {
        return Err(Trap::Arithmetic);
    }
    Ok(t as i64)
}

fn trunc_u64(x: f64) -> Result<u64, Trap> {
    let t = x.trunc();
    if x.is_nan() || t <= -1.0 || t >= 18_446_744_073_709_551_616.0 {
        return Err(Trap::Arithmetic);
    }
    Ok(t as u64)
}

/// Evaluates a one-operand operator (including conversions).
pub(crate) fn eval_unary(op: Opcode, a: i64) -> Result<i64, Trap> {
    use Opcode as O;
    Ok(match op {
        O::I32Clz => from_u32(u32_of(a).leading_zeros()),
        O::I32Ctz => from_u32(u32_of(a).trailing_zeros()),
        O::I32Popcnt => from_u32(u32_of(a).count_ones()),
        O::I32Eqz => from_bool(u32_of(a) == 0),
        O::I64Clz => i64::from(a.leading_zeros()),
        O::I64Ctz => i64::from(a.trailing_zeros()),
        O::I64Popcnt => i64::from(a.count_ones()),
        O::I64Eqz => from_bool(a == 0),

        O::F32Abs => from_f32(f32_of(a).abs()),
        O::F32Neg => from_f32(-f32_of(a)),
        O::F32Ceil => from_f32(f32_of(a).ceil()),
        O::F32Floor => from_f32(f32_of(a).floor()),
        O::F32Trunc => from_f32(f32_of(a).trunc()),
        O::F32Nearest => from_f32(f32_of(a).round_ties_even()),
        O::F32Sqrt => from_f32(f32_of(a).sqrt()),
        O::F64Abs => from_f64(f64_of(a).abs()),
        O::F64Neg => from_f64(-f64_of(a)),
        O::F64Ceil => from_f64(f64_of(a).ceil()),
        O::F64Floor => from_f64(f64_of(a).floor()),
        O::F64Trunc => from_f64(f64_of(a).trunc()),
        O::F64Nearest => from_f64(f64_of(a).round_ties_even()),
        O::F64Sqrt => from_f64(f64_of(a).sqrt()),

        O::I32WrapI64 => from_u32(u32_of(a)),
        O::I32TruncSF32 => from_i32(trunc_i32(f64::from(f32_of(a)))?),
        O::I32TruncUF32 => from_u32(trunc_u32(f64::from(f32_of(a)))?),
        O::I32TruncSF64 => from_i32(trunc_i32(f64_of(a))?),
        O::I32TruncUF64 => from_u32(trunc_u32(f64_of(a))?),
        O::I64ExtendSI32 => i64::from(i32_of(a)),
        O::I64ExtendUI32 => from_u32(u32_of(a)),
        O::I64TruncSF32 => trunc_i64(f64::from(f32_of(a)))?,
        O::I64TruncUF32 => trunc_u64(f64::from(f32_of(a)))?.cast_signed(),
        O::I64TruncSF64 => trunc_i64(f64_of(a))?,
        O::I64TruncUF64 => trunc_u64(f64_of(a))?.cast_signed(),
        O::F32ConvertSI32 => from_f32(i32_of(a) as f32),
        O::F32ConvertUI32 => from_f32(u32_of(a) as f32),
        O::F32ConvertSI64 => from_f32(a as f32),
        O::F32ConvertUI64 => from_f32(a.cast_unsigned() as f32),
        O::F32DemoteF64 => from_f32(f64_of(a) as f32),
        O::F64ConvertSI32 => from_f64(f64::from(i32_of(a))),
        O::F64ConvertUI32 => from_f64(f64::from(u32_of(a))),
        O::F64ConvertSI64 => from_f64(a as f64),
        O::F64ConvertUI64 => from_f64(a.cast_unsigned() as f64),
        O::F64PromoteF32 => from_f64(f64::from(f32_of(a))),
        O::I32ReinterpretF32 | O::F32ReinterpretI32 => from_u32(u32_of(a)),
        O::I64ReinterpretF64 | O::F64ReinterpretI64 => a,

        _ => return Err(Trap::InvalidExecution),
    })
}

/// Evaluates a two-operand operator (including comparisons).
pub(crate) fn eval_binary(op: Opcode, a: i64, b: i64) -> Result<i64, Trap> {
    use Opcode as O;
    Ok(match op {
        O::I32Add => from_i32(i32_of(a).wrapping_add(i32_of(b))),
        O::I32Sub => from_i32(i32_of(a).wrapping_sub(i32_of(b))),
        O::I32Mul => from_i32(i32_of(a).wrapping_mul(i32_of(b))),
        O::I32DivS => {
            let (x, y) = (i32_of(a), i32_of(b));
            if y == 0 || (x == i32::MIN && y == -1) {
                return Err(Trap::Arithmetic);
            }
            from_i32(x / y)
        }
        O::I32DivU => {
            let (x, y) = (u32_of(a), u32_of(b));
            if y == 0 {
                return Err(Trap::Arithmetic);
            }
            from_u32(x / y)
        }
        O::I32RemS => {
            let (x, y) = (i32_of(a), i32_of(b));
            if y == 0 {
                return Err(Trap::Arithmetic);
            }
            from_i32(x.wrapping_rem(y))
        }
        O::I32RemU => {
            let (x, y) = (u32_of(a), u32_of(b));
            if y == 0 {
                return Err(Trap::Arithmetic);
            }
            from_u32(x % y)
        }
        O::I32And => from_u32(u32_of(a) & u32_of(b)),
        O::I32Or => from_u32(u32_of(a) | u32_of(b)),
        O::I32Xor => from_u32(u32_of(a) ^ u32_of(b)),
        O::I32Shl => from_u32(u32_of(a).wrapping_shl(u32_of(b))),
        O::I32ShrS => from_i32(i32_of(a).wrapping_shr(u32_of(b))),
        O::I32ShrU => from_u32(u32_of(a).wrapping_shr(u32_of(b))),
        O::I32Rotl => from_u32(u32_of(a).rotate_left(u32_of(b))),
        O::I32Rotr => from_u32(u32_of(a).rotate_right(u32_of(b))),
        O::I32Eq => from_bool(u32_of(a) == u32_of(b)),
        O::I32Ne => from_bool(u32_of(a) != u32_of(b)),
        O::I32LtS => from_bool(i32_of(a) < i32_of(b)),
        O::I32LtU => from_bool(u32_of(a) < u32_of(b)),
        O::I32GtS => from_bool(i32_of(a) > i32_of(b)),
        O::I32GtU => from_bool(u32_of(a) > u32_of(b)),
        O::I32LeS => from_bool(i32_of(a) <= i32_of(b)),
        O::I32LeU => from_bool(u32_of(a) <= u32_of(b)),
        O::I32GeS => from_bool(i32_of(a) >= i32_of(b)),
        O::I32GeU => from_bool(u32_of(a) >= u32_of(b)),

        O::I64Add => a.wrapping_add(b),
        O::I64Sub => a.wrapping_sub(b),
        O::I64Mul => a.wrapping_mul(b),
        O::I64DivS => {
            if b == 0 || (a == i64::MIN && b == -1) {
                return Err(Trap::Arithmetic);
            }
            a / b
        }
        O::I64DivU => {
            if b == 0 {
                return Err(Trap::Arithmetic);
            }
            (a.cast_unsigned() / b.cast_unsigned()).cast_signed()
        }
        O::I64RemS => {
            if b == 0 {
                return Err(Trap::Arithmetic);
            }
            a.wrapping_rem(b)
        }
        O::I64RemU => {
            if b == 0 {
                return Err(Trap::Arithmetic);
            }
            (a.cast_unsigned() % b.cast_unsigned()).cast_signed()
        }
        O::I64And => a & b,
        O::I64Or => a | b,
        O::I64Xor => a ^ b,
        O::I64Shl => a.wrapping_shl(u32_of(b)),
        O::I64ShrS => a.wrapping_shr(u32_of(b)),
        O::I64ShrU => a.cast_unsigned().wrapping_shr(u32_of(b)).cast_signed(),
        O::I64Rotl => a.rotate_left(u32_of(b)),
        O::I64Rotr => a.rotate_right(u32_of(b)),
        O::I64Eq => from_bool(a == b),
        O::I64Ne => from_bool(a != b),
        O::I64LtS => from_bool(a < b),
        O::I64LtU => from_bool(a.cast_unsigned() < b.cast_unsigned()),
        O::I64GtS => from_bool(a > b),
        O::I64GtU => from_bool(a.cast_unsigned() > b.cast_unsigned()),
        O::I64LeS => from_bool(a <= b),
        O::I64LeU => from_bool(a.cast_unsigned() <= b.cast_unsigned()),
        O::I64GeS => from_bool(a >= b),
        O::I64GeU => from_bool(a.cast_unsigned() >= b.cast_unsigned()),

        O::F32Add => from_f32(f32_of(a) + f32_of(b)),
        O::F32Sub => from_f32(f32_of(a) - f32_of(b)),
        O::F32Mul => from_f32(f32_of(a) * f32_of(b)),
        O::F32Div => from_f32(f32_of(a) / f32_of(b)),
        O::F32Min => from_f32(min_f32(f32_of(a), f32_of(b))),
        O::F32Max => from_f32(max_f32(f32_of(a), f32_of(b))),
        O::F32Copysign => from_f32(f32_of(a).copysign(f32_of(b))),
        O::F32Eq => from_bool(f32_of(a) == f32_of(b)),
        O::F32Ne => from_bool(f32_of(a) != f32_of(b)),
        O::F32Lt => from_bool(f32_of(a) < f32_of(b)),
        O::F32Gt => from_bool(f32_of(a) > f32_of(b)),
        O::F32Le => from_bool(f32_of(a) <= f32_of(b)),
        O::F32Ge => from_bool(f32_of(a) >= f32_of(b)),

        O::F64Add => from_f64(f64_of(a) + f64_of(b)),
        O::F64Sub => from_f64(f64_of(a) - f64_of(b)),
        O::F64Mul => from_f64(f64_of(a) * f64_of(b)),
        O::F64Div => from_f64(f64_of(a) / f64_of(b)),
        O::F64Min => from_f64(min_f64(f64_of(a), f64_of(b))),
        O::F64Max => from_f64(max_f64(f64_of(a), f64_of(b))),
        O::F64Copysign => from_f64(f64_of(a).copysign(f64_of(b))),
        O::F64Eq => from_bool(f64_of(a) == f64_of(b)),
        O::F64Ne => from_bool(f64_of(a) != f64_of(b)),
        O::F64Lt => from_bool(f64_of(a) < f64_of(b)),
        O::F64Gt => from_bool(f64_of(a) > f64_of(b)),
        O::F64Le => from_bool(f64_of(a) <= f64_of(b)),
        O::F64Ge => from_bool(f64_of(a) >= f64_of(b)),

        _ => return Err(Trap::InvalidExecution),
    })
}

/// Reads the value a load opcode produces from `bytes` (exactly its access size).
pub(crate) fn load_value(op: Opcode, bytes: &[u8]) -> Option<i64> {
    let mut buf = [0_u8; 8];
    buf.get_mut(..bytes.len())?.copy_from_slice(bytes);
    let raw = u64::from_le_bytes(buf);
    Some(match op {
        Opcode::I32Load
        | Opcode::F32Load
        | Opcode::I32Load8U
        | Opcode::I32Load16U
        | Opcode::I64Load
        | Opcode::F64Load
        | Opcode::I64Load8U
        | Opcode::I64Load16U
        | Opcode::I64Load32U => raw.cast_signed(),
        Opcode::I32Load8S => from_i32(i32::from(raw as u8 as i8)),
        Opcode::I32Load16S => from_i32(i32::from(raw as u16 as i16)),
        Opcode::I64Load8S => i64::from(raw as u8 as i8),
        Opcode::I64Load16S => i64::from(raw as u16 as i16),
        Opcode::I64Load32S => i64::from(raw as u32 as i32),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_results_stay_zero_extended() {
        assert_eq!(eval_binary(Opcode::I32Sub, 0, 1), Ok(0xFFFF_FFFF));
        assert_eq!(eval_binary(Opcode::I32Add, 0xFFFF_FFFF, 1), Ok(0));
        assert_eq!(eval_unary(Opcode::I32Clz, 0), Ok(32));
        assert_eq!(eval_unary(Opcode::I64ExtendSI32, 0xFFFF_FFFF), Ok(-1));
        assert_eq!(
            eval_unary(Opcode::I64ExtendUI32, 0xFFFF_FFFF),
            Ok(0xFFFF_FFFF)
        );
    }

    #[test]
    fn division_faults() {
        assert_eq!(eval_binary(Opcode::I32DivS, 1, 0), Err(Trap::Arithmetic));
        assert_eq!(eval_binary(Opcode::I64RemU, 1, 0), Err(Trap::Arithmetic));
        let min32 = from_i32(i32::MIN);
        assert_eq!(
            eval_binary(Opcode::I32DivS, min32, from_i32(-1)),
            Err(Trap::Arithmetic)
        );
        assert_eq!(eval_binary(Opcode::I32RemS, min32, from_i32(-1)), Ok(0));
        assert_eq!(
            eval_binary(Opcode::I64DivS, i64::MIN, -1),
            Err(Trap::Arithmetic)
        );
        assert_eq!(eval_binary(Opcode::I64RemS, i64::MIN, -1), Ok(0));
        assert_eq!(
            eval_binary(Opcode::I32DivS, from_i32(-7), 2),
            Ok(from_i32(-3))
        );
    }

    #[test]
    fn shift_counts_are_masked() {
        assert_eq!(eval_binary(Opcode::I32Shl, 1, 33), Ok(2));
        assert_eq!(eval_binary(Opcode::I64ShrU, -1, 127), Ok(1));
        assert_eq!(
            eval_binary(Opcode::I32ShrS, from_i32(-8), 1),
            Ok(from_i32(-4))
        );
        assert_eq!(eval_binary(Opcode::I32Rotl, 0x8000_0000, 1), Ok(1));
    }

    #[test]
    fn float_min_max_handle_nan_and_zeros() {
        let nz = from_f64(-0.0);
        let pz = from_f64(0.0);
        assert_eq!(eval_binary(Opcode::F64Min, pz, nz), Ok(nz));
        assert_eq!(eval_binary(Opcode::F64Max, nz, pz), Ok(pz));
        let nan = eval_binary(Opcode::F32Min, from_f32(f32::NAN), from_f32(1.0)).unwrap();
        assert!(f32_of(nan).is_nan());
        assert_eq!(
            eval_unary(Opcode::F64Nearest, from_f64(2.5)),
            Ok(from_f64(2.0))
        );
    }

    #[test]
    fn truncation_traps_outside_range() {
        assert_eq!(
            eval_unary(Opcode::I32TruncSF64, from_f64(f64::NAN)),
            Err(Trap::Arithmetic)
        );
        assert_eq!(
            eval_unary(Opcode::I32TruncSF64, from_f64(2_147_483_648.0)),
            Err(Trap::Arithmetic)
        );
        assert_eq!(eval_unary(Opcode::I32TruncUF64, from_f64(-0.9)), Ok(0));
        assert_eq!(eval_unary(Opcode::I64TruncSF32, from_f32(-3.7)), Ok(-3));
        assert_eq!(
            eval_unary(Opcode::I64TruncUF64, from_f64(-1.0)),
            Err(Trap::Arithmetic)
        );
    }

    #[test]
    fn sign_extending_loads() {
        assert_eq!(load_value(Opcode::I32Load8S, &[0x80]), Some(0xFFFF_FF80));
        assert_eq!(load_value(Opcode::I64Load16S, &[0x00, 0x80]), Some(-32768));
        assert_eq!(load_value(Opcode::I32Load16U, &[0xFF, 0xFF]), Some(0xFFFF));
        assert_eq!(load_value(Opcode::I32Add, &[0]), None);
    }
}

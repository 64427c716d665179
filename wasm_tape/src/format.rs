// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-width little-endian primitives for the register bytecode.
//!
//! Every field in the stream is either a single byte (opcode tags), a 4-byte word (register ids,
//! indices, jump targets, 32-bit immediates) or an 8-byte word (64-bit immediates). There are no
//! varints and no per-instruction length prefixes.

use core::fmt;

/// A decode error for register bytecode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended in the middle of an instruction.
    UnexpectedEof {
        /// Byte offset where the truncated read started.
        offset: usize,
    },
    /// An opcode tag byte did not name a known instruction.
    UnknownOpcode {
        /// Byte offset of the opcode tag.
        offset: usize,
        /// The raw tag byte.
        byte: u8,
    },
    /// An instruction carried an operand that only makes sense for a different opcode class
    /// (e.g. a store tag in a binary arithmetic slot).
    OperandMismatch {
        /// Byte offset of the instruction.
        offset: usize,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { offset } => {
                write!(f, "unexpected end of bytecode at offset {offset}")
            }
            Self::UnknownOpcode { offset, byte } => {
                write!(f, "unknown opcode 0x{byte:02x} at offset {offset}")
            }
            Self::OperandMismatch { offset } => {
                write!(f, "operand layout mismatch at offset {offset}")
            }
        }
    }
}

impl core::error::Error for DecodeError {}

/// A simple byte reader with bounds checks.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Creates a reader over `bytes` positioned at `offset`.
    #[must_use]
    pub fn at(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, offset }
    }

    /// Returns the current cursor offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns `true` if every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let start = self.offset;
        let end = start
            .checked_add(N)
            .ok_or(DecodeError::UnexpectedEof { offset: start })?;
        let slice = self
            .bytes
            .get(start..end)
            .ok_or(DecodeError::UnexpectedEof { offset: start })?;
        let mut out = [0_u8; N];
        out.copy_from_slice(slice);
        self.offset = end;
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }
}

/// A growable byte writer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the writer and returns its bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    /// Writes a `u8`.
    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32_le(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64_le(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrites the 4-byte word at `at` with `v`.
    ///
    /// Out-of-range patches are ignored; callers only patch words they wrote themselves.
    pub fn patch_u32_le(&mut self, at: usize, v: u32) {
        if let Some(dst) = self.bytes.get_mut(at..at + 4) {
            dst.copy_from_slice(&v.to_le_bytes());
        }
    }
}

// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Control-flow and liveness analyses over compiler-internal instruction lists.
//!
//! These work on label-addressed code (before encoding), where jump destinations are marked by
//! [`crate::bytecode::Op::Place`] pseudo-instructions.

pub(crate) mod bitset;
pub(crate) mod cfg;
pub(crate) mod liveness;

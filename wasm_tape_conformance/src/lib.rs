// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance tests for `wasm_tape` live in `tests/`.
//!
//! Run with:
//! `cargo test -p wasm_tape_conformance`

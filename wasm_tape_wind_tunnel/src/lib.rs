// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmarks for `wasm_tape` live in `benches/`.
//!
//! Run with:
//! `cargo bench -p wasm_tape_wind_tunnel`

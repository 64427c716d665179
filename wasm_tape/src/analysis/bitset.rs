// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A fixed-size bitset over register ids.

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    #[must_use]
    pub(crate) fn new_empty(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub(crate) fn get(&self, idx: usize) -> bool {
        idx < self.len && (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub(crate) fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / 64] |= 1_u64 << (idx % 64);
        }
    }

    pub(crate) fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.words[idx / 64] &= !(1_u64 << (idx % 64));
        }
    }

    pub(crate) fn union_with(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
    }

    pub(crate) fn subtract_with(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= !*b;
        }
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterates set bits in ascending order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut w = word;
            core::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * 64 + bit)
            })
        })
    }
}

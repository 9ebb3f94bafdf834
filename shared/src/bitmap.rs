//! A fixed-length bitmap, stored as machine words.

use alloc::{vec, vec::Vec};
use core::fmt;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn locate(&self, idx: usize) -> (usize, u64) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        (idx / WORD_BITS, 1 << (idx % WORD_BITS))
    }

    pub fn test(&self, idx: usize) -> bool {
        let (word, mask) = self.locate(idx);
        self.words[word] & mask != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        let (word, mask) = self.locate(idx);
        if value {
            self.words[word] |= mask;
        } else {
            self.words[word] &= !mask;
        }
    }

    pub fn flip(&mut self, idx: usize) {
        let (word, mask) = self.locate(idx);
        self.words[word] ^= mask;
    }

    pub fn set_all(&mut self, value: bool) {
        self.words.fill(if value { u64::MAX } else { 0 });
        self.clear_tail();
    }

    /// Bits past `len` in the last word are kept clear so counting and
    /// scanning never see them.
    fn clear_tail(&mut self) {
        let tail = self.len % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }

    /// Number of bits equal to `value`.
    pub fn count(&self, value: bool) -> usize {
        let ones = self.words.iter().map(|w| w.count_ones() as usize).sum();
        if value {
            ones
        } else {
            self.len - ones
        }
    }

    /// Index of the first bit at or after `start` equal to `value`.
    pub fn scan(&self, start: usize, value: bool) -> Option<usize> {
        let mut idx = start;
        while idx < self.len {
            let word = self.words[idx / WORD_BITS];
            let word = if value { word } else { !word };
            let masked = word & (u64::MAX << (idx % WORD_BITS));
            if masked != 0 {
                let found = (idx / WORD_BITS) * WORD_BITS + masked.trailing_zeros() as usize;
                return (found < self.len).then_some(found);
            }
            idx = (idx / WORD_BITS + 1) * WORD_BITS;
        }
        None
    }

    /// Find the first bit equal to `value`, flip it and return its index.
    pub fn scan_and_flip(&mut self, value: bool) -> Option<usize> {
        let idx = self.scan(0, value)?;
        self.flip(idx);
        Some(idx)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({}/{} set)", self.count(true), self.len)
    }
}

//! Lock-free bitmap.
//!
//! Bits live in `AtomicU64` words, bit `i` being bit `i % 64` of word
//! `i / 64`. Claiming a bit is a compare-exchange on the word that holds it,
//! so two threads racing for the same free bit cannot both win. Padding bits
//! past the end of the last word are permanently set and never handed out.

use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

const BITS: usize = u64::BITS as usize;

pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// Creates a bitmap of `len` clear bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let mut words = (0..len.div_ceil(BITS))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>();
        let used_bits = len % BITS;
        if let Some(last) = words.last_mut().filter(|_| used_bits != 0) {
            *last.get_mut() = u64::MAX << used_bits;
        }
        Self {
            words: words.into_boxed_slice(),
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claims the lowest clear bit and returns its index.
    pub fn find_and_set(&self) -> Option<usize> {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != u64::MAX {
                let bit = (!current).trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(word_index * BITS + bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Sets bit `index` and returns whether it was already set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears bit `index` and returns whether it was set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn unset(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.load(Ordering::Acquire) & mask != 0
    }

    /// Sets `count` bits starting at `start`, clamped to the end of the
    /// bitmap. Returns how many bits were covered.
    pub fn set_range(&self, start: usize, count: usize) -> usize {
        let end = start.saturating_add(count).min(self.len);
        for index in start..end {
            self.set(index);
        }
        end.saturating_sub(start)
    }

    /// Number of clear bits. Not a snapshot: concurrent updates may or may
    /// not be counted.
    #[must_use]
    pub fn count_unset(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_zeros() as usize)
            .sum()
    }

    fn locate(&self, index: usize) -> (&AtomicU64, u64) {
        assert!(
            index < self.len,
            "bit index {index} out of range for bitmap of {} bits",
            self.len
        );
        (&self.words[index / BITS], 1 << (index % BITS))
    }
}

impl fmt::Debug for AtomicBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicBitmap")
            .field("len", &self.len)
            .field("unset", &self.count_unset())
            .finish()
    }
}

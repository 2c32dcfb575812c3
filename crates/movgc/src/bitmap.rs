//! Fixed-width bit vectors for per-cell liveness state.
//!
//! [`AtomicBitmap`] backs the mark bits, which marker workers set in
//! parallel, as well as pin and init bits that mutators flip on commit.
//! [`Bitmap`] is the plain variant used where a lock already serializes
//! access.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = u64::BITS as usize;

#[inline]
const fn split(index: usize) -> (usize, u64) {
    (index / WORD_BITS, 1u64 << (index % WORD_BITS))
}

/// A bitmap whose bits can be set and tested from many threads.
///
/// Setting a bit publishes with release ordering and testing reads with
/// acquire, so a worker that observes a mark also observes everything the
/// marking thread wrote before it.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// Creates a bitmap of `len` cleared bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self { words, len }
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap holds no bits at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tests bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let (word, mask) = split(index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Sets bit `index` and returns its previous value.
    ///
    /// Exactly one of several racing callers observes `false`, which is what
    /// lets the marker grey each object once.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let (word, mask) = split(index);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears bit `index` and returns its previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn reset(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let (word, mask) = split(index);
        self.words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Sets or clears bit `index`.
    #[inline]
    pub fn assign(&self, index: usize, value: bool) {
        if value {
            self.set(index);
        } else {
            self.reset(index);
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Whether no bit is set.
    #[must_use]
    pub fn none(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Clears every bit.
    pub fn clear(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Release);
        }
    }

    /// Indices of set bits in ascending order, sampled word by word.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            OnesInWord {
                bits: word.load(Ordering::Acquire),
                base: w * WORD_BITS,
            }
        })
    }
}

/// A plain bitmap for single-owner use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` cleared bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        }
    }

    /// Number of bits.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap holds no bits at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tests bit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let (word, mask) = split(index);
        self.words[word] & mask != 0
    }

    /// Sets bit `index`, returning its previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let (word, mask) = split(index);
        let prev = self.words[word] & mask != 0;
        self.words[word] |= mask;
        prev
    }

    /// Clears bit `index`, returning its previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn reset(&mut self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        let (word, mask) = split(index);
        let prev = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        prev
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no bit is set.
    #[must_use]
    pub fn none(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(w, &bits)| OnesInWord {
                bits,
                base: w * WORD_BITS,
            })
    }
}

struct OnesInWord {
    bits: u64,
    base: usize,
}

impl Iterator for OnesInWord {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.bits == 0 {
            return None;
        }
        let bit = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        Some(self.base + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicBitmap, Bitmap};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_atomic_bitmap_concurrent_set() {
        let bitmap = Arc::new(AtomicBitmap::new(512));
        let mut handles = Vec::new();

        for i in 0..4 {
            let bitmap = Arc::clone(&bitmap);
            handles.push(thread::spawn(move || {
                for j in 0..128 {
                    bitmap.set(i * 128 + j);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bitmap.count(), 512);
    }

    #[test]
    fn test_atomic_bitmap_test_and_set_wins_once() {
        let bitmap = Arc::new(AtomicBitmap::new(64));
        let winners: usize = (0..8)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || usize::from(!bitmap.set(17)))
            })
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_atomic_bitmap_set_reset() {
        let bitmap = AtomicBitmap::new(100);
        assert!(bitmap.none());
        assert!(!bitmap.set(99));
        assert!(bitmap.set(99));
        assert!(bitmap.get(99));
        assert!(bitmap.reset(99));
        assert!(!bitmap.get(99));
        bitmap.assign(3, true);
        assert_eq!(bitmap.iter_ones().collect::<Vec<_>>(), vec![3]);
        bitmap.clear();
        assert!(bitmap.none());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_atomic_bitmap_out_of_bounds() {
        let bitmap = AtomicBitmap::new(10);
        let _ = bitmap.get(10);
    }

    #[test]
    fn test_plain_bitmap_iter_ones_crosses_words() {
        let mut bitmap = Bitmap::new(200);
        for i in [0, 63, 64, 130, 199] {
            assert!(!bitmap.set(i));
        }
        assert_eq!(bitmap.count(), 5);
        assert_eq!(
            bitmap.iter_ones().collect::<Vec<_>>(),
            vec![0, 63, 64, 130, 199]
        );
        assert!(bitmap.reset(63));
        assert!(!bitmap.get(63));
        assert_eq!(bitmap.count(), 4);
    }
}

//! Plain word bitmap over chunk indices.

/// Fixed-length bitmap addressed by chunk index.
///
/// Bits are packed into `u64` words, least significant bit first. Range
/// operations clip at [`ChunkBitmap::len`] so callers may pass ranges that
/// run past the end of a device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: u64,
}

const WORD_BITS: u64 = u64::BITS as u64;

impl ChunkBitmap {
    /// Creates an all-clear bitmap holding `len` bits.
    #[must_use]
    pub fn new(len: u64) -> Self {
        let words = usize::try_from(len.div_ceil(WORD_BITS)).unwrap_or(usize::MAX);
        Self {
            words: vec![0; words],
            len,
        }
    }

    /// Number of addressable bits.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` when the bitmap addresses no bits at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Tests a single bit. Out of range bits read as clear.
    #[must_use]
    pub fn test(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    /// Sets `count` bits starting at `start`.
    pub fn set_range(&mut self, start: u64, count: u64) {
        self.update_range(start, count, true);
    }

    /// Clears `count` bits starting at `start`.
    pub fn clear_range(&mut self, start: u64, count: u64) {
        self.update_range(start, count, false);
    }

    /// Sets every bit.
    pub fn set_all(&mut self) {
        self.set_range(0, self.len);
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.words.iter().map(|word| u64::from(word.count_ones())).sum()
    }

    /// Returns `true` if any bit in `start..start + count` is set.
    #[must_use]
    pub fn any_in_range(&self, start: u64, count: u64) -> bool {
        self.next_set(start)
            .is_some_and(|index| index < start.saturating_add(count))
    }

    /// Returns the first set bit at or after `from`.
    #[must_use]
    pub fn next_set(&self, from: u64) -> Option<u64> {
        if from >= self.len {
            return None;
        }

        let (mut word_index, _) = Self::locate(from);
        let mut word = self.words[word_index] & (!0u64 << (from % WORD_BITS));

        loop {
            if word != 0 {
                let index = word_index as u64 * WORD_BITS + u64::from(word.trailing_zeros());
                return (index < self.len).then_some(index);
            }
            word_index += 1;
            word = *self.words.get(word_index)?;
        }
    }

    /// Returns the first clear bit at or after `from`, or `len` when every
    /// remaining bit is set.
    #[must_use]
    pub fn next_clear(&self, from: u64) -> u64 {
        let mut index = from;
        while index < self.len {
            let (word_index, _) = Self::locate(index);
            let word = !self.words[word_index] & (!0u64 << (index % WORD_BITS));
            if word != 0 {
                let found = word_index as u64 * WORD_BITS + u64::from(word.trailing_zeros());
                return found.min(self.len);
            }
            index = (word_index as u64 + 1) * WORD_BITS;
        }
        self.len
    }

    /// Iterates over the indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        let mut cursor = 0;
        std::iter::from_fn(move || {
            let index = self.next_set(cursor)?;
            cursor = index + 1;
            Some(index)
        })
    }

    fn update_range(&mut self, start: u64, count: u64, value: bool) {
        let end = start.saturating_add(count).min(self.len);
        let mut index = start;

        while index < end {
            let (word, _) = Self::locate(index);
            let bit = index % WORD_BITS;
            let span = (WORD_BITS - bit).min(end - index);
            let mask = if span == WORD_BITS {
                !0u64
            } else {
                ((1u64 << span) - 1) << bit
            };

            if value {
                self.words[word] |= mask;
            } else {
                self.words[word] &= !mask;
            }
            index += span;
        }
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / WORD_BITS) as usize, 1u64 << (index % WORD_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_bitmap_is_clear() {
        let bitmap = ChunkBitmap::new(130);
        assert_eq!(bitmap.len(), 130);
        assert_eq!(bitmap.count(), 0);
        assert_eq!(bitmap.next_set(0), None);
    }

    #[test]
    fn ranges_cross_word_boundaries() {
        let mut bitmap = ChunkBitmap::new(200);
        bitmap.set_range(60, 10);
        assert_eq!(bitmap.count(), 10);
        assert!(!bitmap.test(59));
        assert!(bitmap.test(60));
        assert!(bitmap.test(69));
        assert!(!bitmap.test(70));

        bitmap.clear_range(62, 3);
        assert_eq!(bitmap.count(), 7);
        assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), vec![60, 61, 65, 66, 67, 68, 69]);
    }

    #[test]
    fn ranges_are_clipped_at_length() {
        let mut bitmap = ChunkBitmap::new(10);
        bitmap.set_range(8, 100);
        assert_eq!(bitmap.count(), 2);
        assert!(!bitmap.test(10));
        bitmap.set_all();
        assert_eq!(bitmap.count(), 10);
        bitmap.clear_all();
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn full_word_ranges() {
        let mut bitmap = ChunkBitmap::new(256);
        bitmap.set_range(64, 128);
        assert_eq!(bitmap.count(), 128);
        assert_eq!(bitmap.next_set(0), Some(64));
        assert_eq!(bitmap.next_clear(64), 192);
    }

    #[test]
    fn next_clear_reports_length_when_saturated() {
        let mut bitmap = ChunkBitmap::new(70);
        bitmap.set_all();
        assert_eq!(bitmap.next_clear(0), 70);
        bitmap.clear_range(3, 1);
        assert_eq!(bitmap.next_clear(0), 3);
    }

    #[test]
    fn any_in_range_checks_window() {
        let mut bitmap = ChunkBitmap::new(64);
        bitmap.set_range(10, 1);
        assert!(bitmap.any_in_range(0, 11));
        assert!(!bitmap.any_in_range(0, 10));
        assert!(!bitmap.any_in_range(11, 50));
    }

    #[test]
    fn empty_bitmap() {
        let mut bitmap = ChunkBitmap::new(0);
        assert!(bitmap.is_empty());
        bitmap.set_range(0, 5);
        assert_eq!(bitmap.count(), 0);
        assert_eq!(bitmap.next_set(0), None);
    }

    proptest! {
        #[test]
        fn set_ranges_match_reference(len in 1u64..400, ops in prop::collection::vec((0u64..450, 0u64..130, any::<bool>()), 0..20)) {
            let mut bitmap = ChunkBitmap::new(len);
            let mut reference = vec![false; len as usize];
            for (start, count, value) in ops {
                if value {
                    bitmap.set_range(start, count);
                } else {
                    bitmap.clear_range(start, count);
                }
                for index in start..start.saturating_add(count).min(len) {
                    reference[index as usize] = value;
                }
            }

            let expected: Vec<u64> = (0..len).filter(|&index| reference[index as usize]).collect();
            prop_assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), expected.clone());
            prop_assert_eq!(bitmap.count(), expected.len() as u64);
        }
    }
}

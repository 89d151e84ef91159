//! Shared dirty bitmaps.
//!
//! A [`DirtyBitmap`] records which granularity-sized chunks of a device have
//! been written since they were last copied. Guest writes mark it through the
//! owning device's [`DirtyRegistry`]; a copy engine drains it with a
//! [`DirtyIter`] and clears chunks as it reserves them.
//!
//! Byte-range operations round outwards to whole chunks, so a one byte write
//! dirties the full chunk containing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bitmap::ChunkBitmap;

#[derive(Debug)]
struct Inner {
    granularity: u64,
    length: u64,
    enabled: AtomicBool,
    bits: Mutex<ChunkBitmap>,
}

/// Cloneable handle to a chunk-granular dirty bitmap.
#[derive(Clone, Debug)]
pub struct DirtyBitmap {
    inner: Arc<Inner>,
}

impl DirtyBitmap {
    /// Creates a clear bitmap covering `length` bytes.
    ///
    /// `granularity` must be a non-zero power of two; zero is bumped to one.
    #[must_use]
    pub fn new(granularity: u64, length: u64) -> Self {
        let granularity = granularity.max(1);
        let chunks = length.div_ceil(granularity);
        Self {
            inner: Arc::new(Inner {
                granularity,
                length,
                enabled: AtomicBool::new(true),
                bits: Mutex::new(ChunkBitmap::new(chunks)),
            }),
        }
    }

    /// Chunk size in bytes.
    #[must_use]
    pub fn granularity(&self) -> u64 {
        self.inner.granularity
    }

    /// Covered device length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.inner.length
    }

    /// Number of chunks tracked.
    #[must_use]
    pub fn chunks(&self) -> u64 {
        self.lock().len()
    }

    /// Returns `true` when guest writes are being recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Stops or resumes recording of guest writes through the registry.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Marks every chunk overlapping `offset..offset + len`.
    pub fn set(&self, offset: u64, len: u64) {
        if let Some((start, count)) = self.chunk_span(offset, len) {
            self.lock().set_range(start, count);
        }
    }

    /// Clears every chunk overlapping `offset..offset + len`.
    pub fn reset(&self, offset: u64, len: u64) {
        if let Some((start, count)) = self.chunk_span(offset, len) {
            self.lock().clear_range(start, count);
        }
    }

    /// Marks the whole device dirty.
    pub fn set_all(&self) {
        self.lock().set_all();
    }

    /// Returns `true` if the chunk containing `offset` is dirty.
    #[must_use]
    pub fn get(&self, offset: u64) -> bool {
        self.lock().test(offset / self.inner.granularity)
    }

    /// Returns `true` if chunk `index` is dirty.
    #[must_use]
    pub fn test_chunk(&self, index: u64) -> bool {
        self.lock().test(index)
    }

    /// Dirty bytes, clipped at the device end.
    #[must_use]
    pub fn count(&self) -> u64 {
        let bits = self.lock();
        let chunks = bits.count();
        if chunks == 0 {
            return 0;
        }

        let mut bytes = chunks.saturating_mul(self.inner.granularity);
        let last = bits.len() - 1;
        let tail = self.inner.length - last * self.inner.granularity;
        if bits.test(last) && tail < self.inner.granularity {
            bytes -= self.inner.granularity - tail;
        }
        bytes
    }

    /// Returns a cursor positioned at the first chunk.
    #[must_use]
    pub fn iter(&self) -> DirtyIter {
        DirtyIter {
            bitmap: self.clone(),
            cursor: 0,
        }
    }

    /// Returns `true` when both handles refer to the same bitmap.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn chunk_span(&self, offset: u64, len: u64) -> Option<(u64, u64)> {
        if len == 0 {
            return None;
        }
        let granularity = self.inner.granularity;
        let start = offset / granularity;
        let end = offset.saturating_add(len).div_ceil(granularity);
        Some((start, end - start))
    }

    fn lock(&self) -> MutexGuard<'_, ChunkBitmap> {
        self.inner.bits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forward cursor over the dirty chunks of a [`DirtyBitmap`].
///
/// The cursor is not a snapshot: chunks dirtied behind it are only seen after
/// [`DirtyIter::restart`], chunks dirtied ahead of it are seen on the current
/// pass.
#[derive(Clone, Debug)]
pub struct DirtyIter {
    bitmap: DirtyBitmap,
    cursor: u64,
}

impl DirtyIter {
    /// Returns the next dirty chunk index at or after the cursor and moves
    /// the cursor past it. `None` means the pass is exhausted.
    pub fn next_dirty(&mut self) -> Option<u64> {
        let index = self.bitmap.lock().next_set(self.cursor)?;
        self.cursor = index + 1;
        Some(index)
    }

    /// Moves the cursor to `chunk`, which is the next index examined.
    pub fn skip_to(&mut self, chunk: u64) {
        self.cursor = chunk;
    }

    /// Rewinds the cursor to the first chunk.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// Index the next call to [`DirtyIter::next_dirty`] starts from.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.cursor
    }
}

impl Iterator for DirtyIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.next_dirty()
    }
}

/// Bitmaps attached to one device.
///
/// Devices call [`DirtyRegistry::mark`] from their write paths so every
/// enabled bitmap sees the write.
#[derive(Debug, Default)]
pub struct DirtyRegistry {
    bitmaps: Mutex<Vec<DirtyBitmap>>,
}

impl DirtyRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and attaches a new bitmap.
    pub fn create(&self, granularity: u64, length: u64) -> DirtyBitmap {
        let bitmap = DirtyBitmap::new(granularity, length);
        self.lock().push(bitmap.clone());
        bitmap
    }

    /// Detaches a bitmap. Returns `false` when it was not attached.
    pub fn release(&self, bitmap: &DirtyBitmap) -> bool {
        let mut bitmaps = self.lock();
        let before = bitmaps.len();
        bitmaps.retain(|candidate| !candidate.ptr_eq(bitmap));
        bitmaps.len() != before
    }

    /// Records a write of `len` bytes at `offset` in every enabled bitmap.
    pub fn mark(&self, offset: u64, len: u64) {
        for bitmap in self.lock().iter().filter(|bitmap| bitmap.is_enabled()) {
            bitmap.set(offset, len);
        }
    }

    /// Number of attached bitmaps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no bitmap is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DirtyBitmap>> {
        self.bitmaps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: u64 = 1024;

    #[test]
    fn byte_ranges_round_out_to_chunks() {
        let bitmap = DirtyBitmap::new(64 * KIB, 1024 * KIB);
        bitmap.set(64 * KIB - 1, 2);
        assert!(bitmap.test_chunk(0));
        assert!(bitmap.test_chunk(1));
        assert!(!bitmap.test_chunk(2));
        assert_eq!(bitmap.count(), 128 * KIB);

        bitmap.reset(0, 1);
        assert!(!bitmap.get(0));
        assert!(bitmap.get(64 * KIB));
    }

    #[test]
    fn count_clips_partial_last_chunk() {
        let bitmap = DirtyBitmap::new(64 * KIB, 100 * KIB);
        assert_eq!(bitmap.chunks(), 2);
        bitmap.set_all();
        assert_eq!(bitmap.count(), 100 * KIB);
        bitmap.reset(0, 64 * KIB);
        assert_eq!(bitmap.count(), 36 * KIB);
    }

    #[test]
    fn iterator_walks_forward_and_restarts() {
        let bitmap = DirtyBitmap::new(4 * KIB, 64 * KIB);
        bitmap.set(4 * KIB, 4 * KIB);
        bitmap.set(40 * KIB, 8 * KIB);

        let mut iter = bitmap.iter();
        assert_eq!(iter.next_dirty(), Some(1));
        assert_eq!(iter.next_dirty(), Some(10));

        // Dirtied behind the cursor: invisible until restart.
        bitmap.set(0, 1);
        assert_eq!(iter.next_dirty(), Some(11));
        assert_eq!(iter.next_dirty(), None);

        iter.restart();
        assert_eq!(iter.collect::<Vec<_>>(), vec![0, 1, 10, 11]);
    }

    #[test]
    fn skip_to_moves_cursor() {
        let bitmap = DirtyBitmap::new(KIB, 16 * KIB);
        bitmap.set_all();
        let mut iter = bitmap.iter();
        iter.skip_to(12);
        assert_eq!(iter.position(), 12);
        assert_eq!(iter.next_dirty(), Some(12));
    }

    #[test]
    fn registry_marks_enabled_bitmaps_only() {
        let registry = DirtyRegistry::new();
        let live = registry.create(4 * KIB, 64 * KIB);
        let frozen = registry.create(4 * KIB, 64 * KIB);
        frozen.set_enabled(false);

        registry.mark(8 * KIB, 1);
        assert!(live.get(8 * KIB));
        assert!(!frozen.get(8 * KIB));

        assert!(registry.release(&live));
        assert!(!registry.release(&live));
        registry.mark(0, 1);
        assert!(!live.get(0));
        assert_eq!(registry.len(), 1);
    }
}

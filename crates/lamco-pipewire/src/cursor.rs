//! Cursor metadata tracking
//!
//! Tracks the cursor the producer reports alongside each frame when the
//! session uses metadata cursor mode. The consumer controls visibility; the
//! producer reports validity per frame.
//!
//! The bitmap surface is replaced only when a visible, valid report carries a
//! usable bitmap. Otherwise the previous bitmap stays and only the position
//! moves.
//!
//! ```rust,ignore
//! let mut cursor = CursorState::new();
//!
//! // From the process callback
//! cursor.update(buffer.cursor.as_ref(), &mut allocator);
//!
//! // At draw time
//! if let Some((bitmap, x, y)) = cursor.drawable() {
//!     sink.draw_cursor(bitmap, x, y, cursor.size().0, cursor.size().1);
//! }
//! ```

use tracing::{debug, warn};

use crate::buffer::CursorMeta;
use crate::surface::{SurfaceAllocator, SurfaceSlot};

/// Cursor state for one stream
#[derive(Debug)]
pub struct CursorState<S> {
    visible: bool,
    valid: bool,
    position: (i32, i32),
    hotspot: (i32, i32),
    size: (u32, u32),
    bitmap: SurfaceSlot<S>,
    stats: CursorStats,
}

impl<S> Default for CursorState<S> {
    fn default() -> Self {
        Self {
            visible: true,
            valid: false,
            position: (0, 0),
            hotspot: (0, 0),
            size: (0, 0),
            bitmap: SurfaceSlot::new(),
            stats: CursorStats::default(),
        }
    }
}

impl<S> CursorState<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the cursor meta of one frame
    ///
    /// Returns `true` when the bitmap was replaced.
    pub fn update<A>(&mut self, meta: Option<&CursorMeta<'_>>, allocator: &mut A) -> bool
    where
        A: SurfaceAllocator<Surface = S>,
    {
        self.valid = meta.is_some_and(CursorMeta::is_valid);

        let Some(meta) = meta.filter(|_| self.visible && self.valid) else {
            if !self.valid {
                self.stats.invalid_reports += 1;
            }
            return false;
        };

        let mut replaced = false;
        if let Some(bitmap) = meta.bitmap.filter(|b| b.is_usable()) {
            let color = bitmap.format().map(|f| f.surface_format());
            let surface = color.and_then(|color| {
                allocator.create_from_bytes(bitmap.width, bitmap.height, color, bitmap.stride, bitmap.pixels)
            });

            match surface {
                Some(surface) => {
                    self.bitmap.replace(surface);
                    self.hotspot = meta.hotspot;
                    self.size = (bitmap.width, bitmap.height);
                    self.stats.bitmap_updates += 1;
                    replaced = true;
                    debug!("Cursor bitmap {}x{}", bitmap.width, bitmap.height);
                }
                None => {
                    self.stats.allocation_failures += 1;
                    warn!("Failed to create cursor surface {}x{}", bitmap.width, bitmap.height);
                }
            }
        }

        self.position = meta.position;
        self.stats.position_updates += 1;
        replaced
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            self.stats.visibility_changes += 1;
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn hotspot(&self) -> (i32, i32) {
        self.hotspot
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn bitmap(&self) -> Option<&S> {
        self.bitmap.get()
    }

    /// Bitmap and top-left corner, when the cursor should be drawn
    pub fn drawable(&self) -> Option<(&S, i32, i32)> {
        if !self.visible || !self.valid {
            return None;
        }

        self.bitmap.get().map(|bitmap| {
            (
                bitmap,
                self.position.0 - self.hotspot.0,
                self.position.1 - self.hotspot.1,
            )
        })
    }

    pub fn stats(&self) -> &CursorStats {
        &self.stats
    }

    /// Drop the bitmap and forget the last report
    pub fn reset(&mut self) {
        self.bitmap.clear();
        self.valid = false;
        self.position = (0, 0);
        self.hotspot = (0, 0);
        self.size = (0, 0);
    }
}

/// Cursor statistics
#[derive(Debug, Clone, Default)]
pub struct CursorStats {
    /// Position updates applied
    pub position_updates: u64,

    /// Bitmaps replaced
    pub bitmap_updates: u64,

    /// Frames without a valid cursor
    pub invalid_reports: u64,

    /// Bitmaps the allocator refused
    pub allocation_failures: u64,

    /// Visibility toggles by the consumer
    pub visibility_changes: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::CursorBitmap;
    use crate::format::SurfaceColorFormat;
    use crate::surface::DmaBufImport;

    /// Allocator producing tagged fake surfaces
    #[derive(Default)]
    pub(crate) struct FakeAllocator {
        pub(crate) created: u32,
        pub(crate) fail_import: bool,
        pub(crate) fail_bytes: bool,
        pub(crate) swaps: u32,
    }

    #[derive(Debug, PartialEq, Eq)]
    pub(crate) struct FakeSurface {
        pub(crate) id: u32,
        pub(crate) width: u32,
        pub(crate) height: u32,
    }

    impl SurfaceAllocator for FakeAllocator {
        type Surface = FakeSurface;

        fn create_from_importable(&mut self, import: &DmaBufImport) -> Option<FakeSurface> {
            if self.fail_import {
                return None;
            }
            self.created += 1;
            Some(FakeSurface { id: self.created, width: import.width, height: import.height })
        }

        fn create_from_bytes(
            &mut self,
            width: u32,
            height: u32,
            _color: SurfaceColorFormat,
            _stride: u32,
            _data: &[u8],
        ) -> Option<FakeSurface> {
            if self.fail_bytes {
                return None;
            }
            self.created += 1;
            Some(FakeSurface { id: self.created, width, height })
        }

        fn swap_red_blue(&mut self, _surface: &mut FakeSurface) {
            self.swaps += 1;
        }
    }

    const PIXELS: [u8; 64] = [0xff; 64];

    fn meta(id: u32, with_bitmap: bool) -> CursorMeta<'static> {
        CursorMeta {
            id,
            position: (100, 200),
            hotspot: (4, 6),
            bitmap: with_bitmap.then_some(CursorBitmap {
                raw_format: libspa_sys::SPA_VIDEO_FORMAT_BGRA,
                width: 4,
                height: 4,
                stride: 16,
                pixels: &PIXELS,
            }),
        }
    }

    #[test]
    fn test_invalid_then_valid() {
        let mut alloc = FakeAllocator::default();
        let mut cursor = CursorState::new();

        // Frame K: visible but not valid
        assert!(!cursor.update(Some(&meta(0, true)), &mut alloc));
        assert!(cursor.bitmap().is_none());
        assert_eq!(alloc.created, 0);

        // Frame K+1: valid with bitmap
        assert!(cursor.update(Some(&meta(1, true)), &mut alloc));
        assert_eq!(alloc.created, 1);
        assert_eq!(cursor.stats().bitmap_updates, 1);
        assert_eq!(cursor.drawable().map(|(_, x, y)| (x, y)), Some((96, 194)));
    }

    #[test]
    fn test_position_only_keeps_bitmap() {
        let mut alloc = FakeAllocator::default();
        let mut cursor = CursorState::new();

        cursor.update(Some(&meta(1, true)), &mut alloc);
        let mut moved = meta(1, false);
        moved.position = (10, 20);

        assert!(!cursor.update(Some(&moved), &mut alloc));
        assert_eq!(cursor.position(), (10, 20));
        assert_eq!(cursor.bitmap().map(|s| s.id), Some(1));
    }

    #[test]
    fn test_hidden_cursor_ignored() {
        let mut alloc = FakeAllocator::default();
        let mut cursor = CursorState::new();
        cursor.set_visible(false);

        assert!(!cursor.update(Some(&meta(1, true)), &mut alloc));
        assert_eq!(alloc.created, 0);
        assert_eq!(cursor.position(), (0, 0));
        assert!(cursor.drawable().is_none());
    }

    #[test]
    fn test_missing_meta_invalidates() {
        let mut alloc = FakeAllocator::default();
        let mut cursor = CursorState::new();

        cursor.update(Some(&meta(1, true)), &mut alloc);
        cursor.update(None, &mut alloc);

        assert!(!cursor.is_valid());
        assert!(cursor.drawable().is_none());
        // Bitmap kept for the next valid report
        assert!(cursor.bitmap().is_some());
    }

    #[test]
    fn test_allocation_failure_keeps_old_bitmap() {
        let mut alloc = FakeAllocator::default();
        let mut cursor = CursorState::new();

        cursor.update(Some(&meta(1, true)), &mut alloc);
        alloc.fail_bytes = true;
        assert!(!cursor.update(Some(&meta(1, true)), &mut alloc));

        assert_eq!(cursor.bitmap().map(|s| s.id), Some(1));
        assert_eq!(cursor.stats().allocation_failures, 1);
    }
}

//! Graphics-side collaborators
//!
//! The crate never touches a graphics API directly. Render-surface mode goes
//! through a [`SurfaceAllocator`] and a [`RenderSink`], raw-frame mode
//! through a [`FrameSink`]. Surfaces release their native resource in
//! `Drop`.

use drm_fourcc::DrmFourcc;
use std::os::fd::RawFd;

use crate::crop::CropRegion;
use crate::format::{ColorMatrix, ColorRange, PixelFormat, SurfaceColorFormat, DRM_FORMAT_MOD_INVALID};

/// One plane of a DMA-BUF import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// Everything needed to import a DMA-BUF as a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaBufImport {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fourcc: DrmFourcc,
    pub color: SurfaceColorFormat,
    pub planes: Vec<DmaBufPlane>,
    /// `None` lets the allocator infer the layout
    pub modifier: Option<u64>,
}

impl DmaBufImport {
    pub fn new(width: u32, height: u32, format: PixelFormat, modifier: Option<u64>, planes: Vec<DmaBufPlane>) -> Self {
        Self {
            width,
            height,
            format,
            fourcc: format.drm_fourcc(),
            color: format.surface_format(),
            planes,
            modifier: modifier.filter(|&m| m != DRM_FORMAT_MOD_INVALID),
        }
    }
}

/// Creates renderable surfaces
pub trait SurfaceAllocator {
    /// Owned surface, releases itself on drop
    type Surface;

    /// Zero-copy import, `None` on failure
    fn create_from_importable(&mut self, import: &DmaBufImport) -> Option<Self::Surface>;

    /// Upload from CPU memory, `None` on failure
    fn create_from_bytes(
        &mut self,
        width: u32,
        height: u32,
        color: SurfaceColorFormat,
        stride: u32,
        data: &[u8],
    ) -> Option<Self::Surface>;

    /// Swizzle red and blue on a created surface
    fn swap_red_blue(&mut self, _surface: &mut Self::Surface) {}
}

/// Slot owning at most one surface
///
/// [`SurfaceSlot::replace`] drops the old surface before installing the
/// new one.
#[derive(Debug)]
pub struct SurfaceSlot<S> {
    surface: Option<S>,
}

impl<S> Default for SurfaceSlot<S> {
    fn default() -> Self {
        Self { surface: None }
    }
}

impl<S> SurfaceSlot<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, surface: S) {
        self.surface = None;
        self.surface = Some(surface);
    }

    pub fn clear(&mut self) {
        self.surface = None;
    }

    pub fn take(&mut self) -> Option<S> {
        self.surface.take()
    }

    pub fn get(&self) -> Option<&S> {
        self.surface.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.surface.as_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.surface.is_none()
    }
}

/// Draws surfaces in render-surface mode
pub trait RenderSink<S> {
    /// Draw the frame, restricted to `crop` when set
    fn bind_surface_for_render(&mut self, surface: &S, crop: Option<CropRegion>);

    /// Draw the cursor bitmap with its top-left corner at `(x, y)`
    fn draw_cursor(&mut self, _bitmap: &S, _x: i32, _y: i32, _width: u32, _height: u32) {}
}

/// Flat frame for raw-frame mode
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<&'a [u8]>,
    pub linesizes: Vec<u32>,
    pub color_matrix: ColorMatrix,
    pub color_range: ColorRange,
}

/// Receives raw frames
pub trait FrameSink {
    fn push_frame(&mut self, frame: &RawFrame<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Tracked(Rc<Cell<u32>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_slot_replace_drops_old() {
        let drops = Rc::new(Cell::new(0));
        let mut slot = SurfaceSlot::new();

        slot.replace(Tracked(Rc::clone(&drops)));
        assert_eq!(drops.get(), 0);

        slot.replace(Tracked(Rc::clone(&drops)));
        assert_eq!(drops.get(), 1);

        slot.clear();
        assert_eq!(drops.get(), 2);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_import_strips_invalid_modifier() {
        let plane = DmaBufPlane { fd: 10, offset: 0, stride: 7680 };

        let implicit = DmaBufImport::new(1920, 1080, PixelFormat::BGRx, Some(DRM_FORMAT_MOD_INVALID), vec![plane]);
        assert_eq!(implicit.modifier, None);
        assert_eq!(implicit.fourcc, DrmFourcc::Xrgb8888);

        let explicit = DmaBufImport::new(1920, 1080, PixelFormat::BGRx, Some(0x100), vec![plane]);
        assert_eq!(explicit.modifier, Some(0x100));
    }
}

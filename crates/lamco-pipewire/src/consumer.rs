//! Frame consumers
//!
//! A [`FrameConsumer`] turns the retained buffer of each process cycle into
//! its output. Every method has a default body, so a consumer only
//! implements what its mode needs.
//!
//! Two modes ship with the crate:
//!
//! - [`RenderSurfaceConsumer`]: imports or uploads into a surface, composites
//!   crop and cursor at draw time through a [`RenderSink`]
//! - [`RawFrameConsumer`]: pushes flat frames to a [`FrameSink`], ignores the
//!   cursor

use tracing::{debug, warn};

use crate::buffer::{CursorMeta, Plane};
use crate::cursor::CursorState;
use crate::crop::CropRegion;
use crate::format::raw_frame_layout;
use crate::negotiator::NegotiatedFormat;
use crate::surface::{DmaBufImport, DmaBufPlane, FrameSink, RawFrame, RenderSink, SurfaceAllocator, SurfaceSlot};

/// Result of handing a payload to a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Output produced
    Delivered,
    /// GPU import failed for the negotiated modifier
    ImportFailed,
    /// Consumer cannot handle this format or buffer class
    Unsupported,
    /// Payload unusable, frame skipped
    Dropped,
}

/// Receives the output of the buffer exchange loop
pub trait FrameConsumer {
    /// Whether DMA-BUF buffers may be negotiated
    fn accepts_dmabuf(&self) -> bool {
        false
    }

    /// Import a DMA-BUF payload
    fn import_dmabuf(&mut self, _format: &NegotiatedFormat, _planes: &[DmaBufPlane]) -> FrameOutcome {
        FrameOutcome::Unsupported
    }

    /// Consume a memory payload
    fn upload_memory(&mut self, _format: &NegotiatedFormat, _planes: &[Plane<'_>]) -> FrameOutcome {
        FrameOutcome::Unsupported
    }

    /// Cursor meta of the retained buffer, `None` when absent
    fn update_cursor(&mut self, _cursor: Option<&CursorMeta<'_>>) {}

    fn set_cursor_visible(&mut self, _visible: bool) {}

    /// A new format was committed
    fn on_format_changed(&mut self, _format: &NegotiatedFormat) {}

    /// The stream stopped streaming
    fn on_stream_stopped(&mut self) {}
}

/// Render-surface mode
pub struct RenderSurfaceConsumer<A: SurfaceAllocator> {
    allocator: A,
    surface: SurfaceSlot<A::Surface>,
    cursor: CursorState<A::Surface>,
    use_dmabuf: bool,
}

impl<A: SurfaceAllocator> RenderSurfaceConsumer<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            surface: SurfaceSlot::new(),
            cursor: CursorState::new(),
            use_dmabuf: true,
        }
    }

    /// Accept memory buffers only
    #[must_use]
    pub fn without_dmabuf(mut self) -> Self {
        self.use_dmabuf = false;
        self
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// Current frame surface
    pub fn surface(&self) -> Option<&A::Surface> {
        self.surface.get()
    }

    pub fn cursor(&self) -> &CursorState<A::Surface> {
        &self.cursor
    }

    /// Draw the current frame, then the cursor on top
    pub fn render<R>(&self, sink: &mut R, crop: Option<CropRegion>)
    where
        R: RenderSink<A::Surface>,
    {
        let Some(surface) = self.surface.get() else {
            return;
        };

        sink.bind_surface_for_render(surface, crop);

        if let Some((bitmap, x, y)) = self.cursor.drawable() {
            let (width, height) = self.cursor.size();
            sink.draw_cursor(bitmap, x, y, width, height);
        }
    }

    fn finish_surface(&mut self, format: &NegotiatedFormat) {
        if format.pixel_format.is_some_and(|f| f.needs_swap_red_blue()) {
            if let Some(surface) = self.surface.get_mut() {
                self.allocator.swap_red_blue(surface);
            }
        }
    }
}

impl<A: SurfaceAllocator> FrameConsumer for RenderSurfaceConsumer<A> {
    fn accepts_dmabuf(&self) -> bool {
        self.use_dmabuf
    }

    fn import_dmabuf(&mut self, format: &NegotiatedFormat, planes: &[DmaBufPlane]) -> FrameOutcome {
        let Some(pixel_format) = format.pixel_format else {
            return FrameOutcome::Unsupported;
        };

        let import = DmaBufImport::new(format.width, format.height, pixel_format, format.modifier, planes.to_vec());
        debug!(
            "DMA-BUF import {}x{} {} planes={} modifier={:?}",
            import.width,
            import.height,
            pixel_format,
            planes.len(),
            import.modifier
        );

        // Old surface goes first so a failed import leaves nothing behind
        self.surface.clear();
        match self.allocator.create_from_importable(&import) {
            Some(surface) => {
                self.surface.replace(surface);
                self.finish_surface(format);
                FrameOutcome::Delivered
            }
            None => FrameOutcome::ImportFailed,
        }
    }

    fn upload_memory(&mut self, format: &NegotiatedFormat, planes: &[Plane<'_>]) -> FrameOutcome {
        let Some(pixel_format) = format.pixel_format else {
            return FrameOutcome::Unsupported;
        };
        let Some(data) = planes.first().and_then(|p| p.data) else {
            return FrameOutcome::Dropped;
        };

        let stride = match planes[0].stride {
            0 => format.width * pixel_format.bytes_per_pixel(),
            stride => stride,
        };

        match self
            .allocator
            .create_from_bytes(format.width, format.height, pixel_format.surface_format(), stride, data)
        {
            Some(surface) => {
                self.surface.replace(surface);
                self.finish_surface(format);
                FrameOutcome::Delivered
            }
            None => {
                warn!("Failed to create {}x{} surface from memory", format.width, format.height);
                FrameOutcome::Dropped
            }
        }
    }

    fn update_cursor(&mut self, cursor: Option<&CursorMeta<'_>>) {
        self.cursor.update(cursor, &mut self.allocator);
    }

    fn set_cursor_visible(&mut self, visible: bool) {
        self.cursor.set_visible(visible);
    }

    fn on_stream_stopped(&mut self) {
        self.surface.clear();
        self.cursor.reset();
    }
}

/// Raw-frame mode
pub struct RawFrameConsumer<K: FrameSink> {
    sink: K,
    frames: u64,
}

impl<K: FrameSink> RawFrameConsumer<K> {
    pub fn new(sink: K) -> Self {
        Self { sink, frames: 0 }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    /// Frames pushed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl<K: FrameSink> FrameConsumer for RawFrameConsumer<K> {
    fn upload_memory(&mut self, format: &NegotiatedFormat, planes: &[Plane<'_>]) -> FrameOutcome {
        let Some(pixel_format) = format.pixel_format else {
            return FrameOutcome::Unsupported;
        };
        let Some(layout) = raw_frame_layout(pixel_format, format.width) else {
            return FrameOutcome::Unsupported;
        };
        let Some(data) = planes.first().and_then(|p| p.data) else {
            return FrameOutcome::Dropped;
        };

        let frame = RawFrame {
            format: pixel_format,
            width: format.width,
            height: format.height,
            planes: vec![data],
            linesizes: vec![layout.linesize],
            color_matrix: format.color_matrix,
            color_range: format.color_range,
        };

        self.sink.push_frame(&frame);
        self.frames += 1;
        FrameOutcome::Delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DataKind;
    use crate::cursor::tests::FakeAllocator;
    use crate::format::{ColorMatrix, ColorRange, PixelFormat};
    use crate::negotiator::BufferTypes;
    use libspa::param::video::VideoFormat;

    fn negotiated(format: VideoFormat, modifier: Option<u64>) -> NegotiatedFormat {
        NegotiatedFormat {
            spa_format: format.as_raw(),
            pixel_format: PixelFormat::from_spa(format),
            width: 4,
            height: 2,
            framerate: (60, 1),
            color_matrix: ColorMatrix::Bt709,
            color_range: ColorRange::Partial,
            modifier,
            buffer_types: BufferTypes::MEM_PTR,
        }
    }

    fn memory_plane(data: &[u8]) -> Plane<'_> {
        Plane {
            kind: DataKind::MemPtr,
            fd: None,
            offset: 0,
            stride: 16,
            size: data.len() as u32,
            data: Some(data),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(PixelFormat, Vec<u32>, ColorMatrix)>,
        bound: u32,
        cursors: Vec<(i32, i32)>,
    }

    impl FrameSink for RecordingSink {
        fn push_frame(&mut self, frame: &RawFrame<'_>) {
            self.frames.push((frame.format, frame.linesizes.clone(), frame.color_matrix));
        }
    }

    impl RenderSink<crate::cursor::tests::FakeSurface> for RecordingSink {
        fn bind_surface_for_render(&mut self, _surface: &crate::cursor::tests::FakeSurface, _crop: Option<CropRegion>) {
            self.bound += 1;
        }

        fn draw_cursor(&mut self, _bitmap: &crate::cursor::tests::FakeSurface, x: i32, y: i32, _w: u32, _h: u32) {
            self.cursors.push((x, y));
        }
    }

    #[test]
    fn test_raw_frame_push() {
        let mut consumer = RawFrameConsumer::new(RecordingSink::default());
        let data = [0u8; 32];

        let outcome = consumer.upload_memory(&negotiated(VideoFormat::RGBA, None), &[memory_plane(&data)]);

        assert_eq!(outcome, FrameOutcome::Delivered);
        assert_eq!(consumer.sink().frames, vec![(PixelFormat::RGBA, vec![16], ColorMatrix::Bt709)]);
        assert!(!consumer.accepts_dmabuf());
    }

    #[test]
    fn test_raw_frame_unsupported() {
        let mut consumer = RawFrameConsumer::new(RecordingSink::default());
        let data = [0u8; 32];

        let outcome = consumer.upload_memory(&negotiated(VideoFormat::BGRx, None), &[memory_plane(&data)]);
        assert_eq!(outcome, FrameOutcome::Unsupported);
    }

    #[test]
    fn test_raw_frame_null_data() {
        let mut consumer = RawFrameConsumer::new(RecordingSink::default());
        let plane = Plane { data: None, ..memory_plane(&[]) };

        let outcome = consumer.upload_memory(&negotiated(VideoFormat::YUY2, None), &[plane]);
        assert_eq!(outcome, FrameOutcome::Dropped);
        assert_eq!(consumer.frames(), 0);
    }

    #[test]
    fn test_render_upload_swaps_rgbx() {
        let mut consumer = RenderSurfaceConsumer::new(FakeAllocator::default());
        let data = [0u8; 32];

        let outcome = consumer.upload_memory(&negotiated(VideoFormat::RGBx, None), &[memory_plane(&data)]);

        assert_eq!(outcome, FrameOutcome::Delivered);
        assert_eq!(consumer.allocator().swaps, 1);
        assert!(consumer.surface().is_some());
    }

    #[test]
    fn test_render_import_failure_releases_surface() {
        let mut consumer = RenderSurfaceConsumer::new(FakeAllocator::default());
        let planes = [DmaBufPlane { fd: 3, offset: 0, stride: 16 }];
        let format = negotiated(VideoFormat::BGRx, Some(0x100));

        assert_eq!(consumer.import_dmabuf(&format, &planes), FrameOutcome::Delivered);

        consumer.allocator_mut().fail_import = true;
        assert_eq!(consumer.import_dmabuf(&format, &planes), FrameOutcome::ImportFailed);
        assert!(consumer.surface().is_none());
    }

    #[test]
    fn test_render_draws_cursor() {
        let mut consumer = RenderSurfaceConsumer::new(FakeAllocator::default());
        let mut sink = RecordingSink::default();
        let data = [0u8; 32];
        let pixels = [0u8; 16];

        consumer.render(&mut sink, None);
        assert_eq!(sink.bound, 0);

        consumer.upload_memory(&negotiated(VideoFormat::BGRA, None), &[memory_plane(&data)]);
        consumer.update_cursor(Some(&CursorMeta {
            id: 1,
            position: (50, 60),
            hotspot: (2, 3),
            bitmap: Some(crate::buffer::CursorBitmap {
                raw_format: libspa_sys::SPA_VIDEO_FORMAT_BGRA,
                width: 2,
                height: 2,
                stride: 8,
                pixels: &pixels,
            }),
        }));

        consumer.render(&mut sink, None);
        assert_eq!(sink.bound, 1);
        assert_eq!(sink.cursors, vec![(48, 57)]);

        consumer.set_cursor_visible(false);
        consumer.render(&mut sink, None);
        assert_eq!(sink.cursors.len(), 1);
    }
}

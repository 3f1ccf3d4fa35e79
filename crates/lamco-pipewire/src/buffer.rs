//! Buffers on loan from the producer
//!
//! [`BufferQueue`] abstracts the producer's dequeue/enqueue pair. A dequeued
//! handle is moved back into [`BufferQueue::enqueue`], so a buffer can only
//! be returned once. While it is held, [`BufferQueue::describe`] gives a
//! borrowed [`InflightBuffer`] view of its planes and metadata.

use std::os::fd::RawFd;

use crate::crop::CropRegion;
use crate::format::PixelFormat;

/// Memory class of a buffer plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Mapped memory pointer
    MemPtr,
    /// Shared memory fd, mapped by PipeWire
    MemFd,
    /// GPU-importable DMA-BUF
    DmaBuf,
    /// Anything else
    Unknown(u32),
}

impl DataKind {
    /// Map a raw `spa_data_type`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            libspa_sys::SPA_DATA_MemPtr => Self::MemPtr,
            libspa_sys::SPA_DATA_MemFd => Self::MemFd,
            libspa_sys::SPA_DATA_DmaBuf => Self::DmaBuf,
            other => Self::Unknown(other),
        }
    }

    pub fn is_dmabuf(self) -> bool {
        self == Self::DmaBuf
    }
}

/// One plane of an in-flight buffer
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub kind: DataKind,
    /// Backing descriptor, if any
    pub fd: Option<RawFd>,
    pub offset: u32,
    pub stride: u32,
    /// Valid bytes in this plane
    pub size: u32,
    /// Mapped bytes, `None` for unmapped DMA-BUFs
    pub data: Option<&'a [u8]>,
}

/// Cursor bitmap attached to a cursor meta
#[derive(Debug, Clone, Copy)]
pub struct CursorBitmap<'a> {
    /// Raw `spa_video_format` of the bitmap
    pub raw_format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixels: &'a [u8],
}

impl CursorBitmap<'_> {
    /// Format, when it is one a surface can be made from
    pub fn format(&self) -> Option<PixelFormat> {
        PixelFormat::from_spa(libspa::param::video::VideoFormat::from_raw(self.raw_format))
            .filter(|f| f.bytes_per_pixel() == 4)
    }

    pub fn is_usable(&self) -> bool {
        self.width > 0 && self.height > 0 && self.format().is_some()
    }
}

/// Cursor meta attached to a buffer
#[derive(Debug, Clone, Copy)]
pub struct CursorMeta<'a> {
    /// Zero means the producer has no cursor information
    pub id: u32,
    pub position: (i32, i32),
    pub hotspot: (i32, i32),
    pub bitmap: Option<CursorBitmap<'a>>,
}

impl CursorMeta<'_> {
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

/// Borrowed view of one dequeued buffer
#[derive(Debug, Clone, Default)]
pub struct InflightBuffer<'a> {
    pub planes: Vec<Plane<'a>>,
    pub crop: Option<CropRegion>,
    pub cursor: Option<CursorMeta<'a>>,
}

impl InflightBuffer<'_> {
    /// Whether the buffer carries frame data or only metadata
    pub fn has_payload(&self) -> bool {
        self.planes.first().is_some_and(|p| p.size != 0)
    }

    pub fn is_dmabuf(&self) -> bool {
        self.planes.first().is_some_and(|p| p.kind.is_dmabuf())
    }
}

/// The producer's buffer queue
pub trait BufferQueue {
    /// Owned token for one dequeued buffer
    type Handle;

    /// Next ready buffer, `None` when the queue is empty
    fn dequeue(&mut self) -> Option<Self::Handle>;

    /// Give a buffer back to the producer
    fn enqueue(&mut self, handle: Self::Handle);

    /// Read the planes and metadata of a held buffer
    fn describe<'h>(&self, handle: &'h Self::Handle) -> InflightBuffer<'h>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(kind: DataKind, size: u32) -> Plane<'static> {
        Plane { kind, fd: None, offset: 0, stride: 0, size, data: None }
    }

    #[test]
    fn test_payload_detection() {
        let empty = InflightBuffer::default();
        assert!(!empty.has_payload());

        let meta_only = InflightBuffer { planes: vec![plane(DataKind::MemPtr, 0)], ..Default::default() };
        assert!(!meta_only.has_payload());

        let dmabuf = InflightBuffer { planes: vec![plane(DataKind::DmaBuf, 4096)], ..Default::default() };
        assert!(dmabuf.has_payload());
        assert!(dmabuf.is_dmabuf());
    }

    #[test]
    fn test_data_kind() {
        assert_eq!(DataKind::from_raw(libspa_sys::SPA_DATA_DmaBuf), DataKind::DmaBuf);
        assert_eq!(DataKind::from_raw(999), DataKind::Unknown(999));
    }

    #[test]
    fn test_cursor_bitmap_usable() {
        let pixels = [0u8; 16];
        let bitmap = CursorBitmap {
            raw_format: libspa_sys::SPA_VIDEO_FORMAT_RGBA,
            width: 2,
            height: 2,
            stride: 8,
            pixels: &pixels,
        };
        assert!(bitmap.is_usable());

        let yuv = CursorBitmap { raw_format: libspa_sys::SPA_VIDEO_FORMAT_YUY2, ..bitmap };
        assert!(!yuv.is_usable());

        let empty = CursorBitmap { width: 0, ..bitmap };
        assert!(!empty.is_usable());
    }
}

//! Raw buffer access
//!
//! The safe `Buffer` wrapper of the pipewire crate only exposes data planes
//! and returns the buffer on drop. Crop and cursor live in `spa_meta`
//! entries, and the exchange loop needs to hand buffers back explicitly, so
//! this module works on `pw_buffer` pointers directly.

use libspa_sys::{
    spa_buffer, spa_chunk, spa_data, spa_meta, spa_meta_bitmap, spa_meta_cursor, spa_meta_region,
};
use pipewire::stream::StreamRef;
use std::mem::size_of;
use std::os::fd::RawFd;
use std::ptr::{self, NonNull};
use std::slice;

use crate::buffer::{BufferQueue, CursorBitmap, CursorMeta, DataKind, InflightBuffer, Plane};
use crate::crop::CropRegion;

/// A dequeued `pw_buffer`
///
/// Only [`PwBufferQueue::enqueue`] consumes it.
#[derive(Debug)]
pub(crate) struct PwBuffer(NonNull<pipewire::sys::pw_buffer>);

/// The queue of one stream, valid inside its `process` callback
pub(crate) struct PwBufferQueue<'s> {
    stream: &'s StreamRef,
}

impl<'s> PwBufferQueue<'s> {
    pub(crate) fn new(stream: &'s StreamRef) -> Self {
        Self { stream }
    }
}

impl BufferQueue for PwBufferQueue<'_> {
    type Handle = PwBuffer;

    fn dequeue(&mut self) -> Option<PwBuffer> {
        // SAFETY: we are on the loop thread, inside the stream's process callback
        let raw = unsafe { self.stream.dequeue_raw_buffer() };
        NonNull::new(raw).map(PwBuffer)
    }

    fn enqueue(&mut self, handle: PwBuffer) {
        // SAFETY: the pointer came from dequeue_raw_buffer on this stream and
        // the handle is consumed here
        unsafe { self.stream.queue_raw_buffer(handle.0.as_ptr()) };
    }

    fn describe<'h>(&self, handle: &'h PwBuffer) -> InflightBuffer<'h> {
        // SAFETY: a dequeued pw_buffer stays valid until it is queued again
        unsafe {
            let pw = handle.0.as_ref();
            describe_spa_buffer(pw.buffer)
        }
    }
}

/// Read planes, crop and cursor of a `spa_buffer`
///
/// # Safety
///
/// `buffer` must be null or point to a valid `spa_buffer` whose datas and
/// metas outlive `'h`.
pub(crate) unsafe fn describe_spa_buffer<'h>(buffer: *const spa_buffer) -> InflightBuffer<'h> {
    // SAFETY: caller guarantees the pointer is null or valid for 'h
    let Some(buffer) = (unsafe { buffer.as_ref() }) else {
        return InflightBuffer::default();
    };

    // SAFETY: datas and metas hold n_datas and n_metas entries
    let (datas, metas) = unsafe { (raw_slice(buffer.datas, buffer.n_datas), raw_slice(buffer.metas, buffer.n_metas)) };

    let mut inflight = InflightBuffer {
        // SAFETY: each spa_data belongs to the same live buffer
        planes: datas.iter().map(|d| unsafe { read_plane(d) }).collect(),
        crop: None,
        cursor: None,
    };

    for meta in metas {
        match meta.type_ {
            // SAFETY: the meta type tells what its data points to
            libspa_sys::SPA_META_VideoCrop => inflight.crop = unsafe { read_crop(meta) },
            // SAFETY: as above
            libspa_sys::SPA_META_Cursor => inflight.cursor = unsafe { read_cursor(meta) },
            _ => {}
        }
    }

    inflight
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: u32) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: non-null and caller guarantees len valid entries
        unsafe { slice::from_raw_parts(ptr, len as usize) }
    }
}

unsafe fn read_plane<'h>(data: &spa_data) -> Plane<'h> {
    let kind = DataKind::from_raw(data.type_);

    // SAFETY: chunk is null or points into the buffer's chunk array
    let chunk = unsafe { data.chunk.as_ref() }
        .copied()
        .unwrap_or(spa_chunk { offset: 0, size: 0, stride: 0, flags: 0 });

    let fd = match kind {
        DataKind::MemFd | DataKind::DmaBuf if data.fd >= 0 => RawFd::try_from(data.fd).ok(),
        _ => None,
    };

    let mapped = !data.data.is_null() && !kind.is_dmabuf();
    let in_bounds = u64::from(chunk.offset) + u64::from(chunk.size) <= u64::from(data.maxsize);
    let bytes = (mapped && in_bounds).then(|| {
        // SAFETY: the mapping holds maxsize bytes and offset + size fits in it
        unsafe { slice::from_raw_parts(data.data.cast::<u8>().add(chunk.offset as usize), chunk.size as usize) }
    });

    Plane {
        kind,
        fd,
        offset: chunk.offset,
        stride: u32::try_from(chunk.stride).unwrap_or(0),
        size: chunk.size,
        data: bytes,
    }
}

unsafe fn read_crop(meta: &spa_meta) -> Option<CropRegion> {
    if meta.data.is_null() || (meta.size as usize) < size_of::<spa_meta_region>() {
        return None;
    }

    // SAFETY: size checked above
    let region = unsafe { ptr::read_unaligned(meta.data.cast::<spa_meta_region>()) }.region;
    Some(CropRegion::new(
        region.position.x,
        region.position.y,
        region.size.width,
        region.size.height,
    ))
}

unsafe fn read_cursor<'h>(meta: &spa_meta) -> Option<CursorMeta<'h>> {
    if meta.data.is_null() || (meta.size as usize) < size_of::<spa_meta_cursor>() {
        return None;
    }

    let base = meta.data.cast::<u8>();
    // SAFETY: size checked above
    let cursor = unsafe { ptr::read_unaligned(base.cast::<spa_meta_cursor>()) };

    Some(CursorMeta {
        id: cursor.id,
        position: (cursor.position.x, cursor.position.y),
        hotspot: (cursor.hotspot.x, cursor.hotspot.y),
        // SAFETY: base points to meta.size readable bytes
        bitmap: unsafe { read_bitmap(base, meta.size as usize, cursor.bitmap_offset as usize) },
    })
}

/// Bitmap header and pixels, both bounds-checked against the meta size
unsafe fn read_bitmap<'h>(base: *const u8, meta_size: usize, bitmap_offset: usize) -> Option<CursorBitmap<'h>> {
    if bitmap_offset < size_of::<spa_meta_cursor>() || bitmap_offset + size_of::<spa_meta_bitmap>() > meta_size {
        return None;
    }

    // SAFETY: header lies within the meta
    let header = unsafe { ptr::read_unaligned(base.add(bitmap_offset).cast::<spa_meta_bitmap>()) };
    let stride = u32::try_from(header.stride).ok()?;
    let len = stride as usize * header.size.height as usize;
    let start = bitmap_offset + header.offset as usize;
    if (header.offset as usize) < size_of::<spa_meta_bitmap>() || start + len > meta_size {
        return None;
    }

    Some(CursorBitmap {
        raw_format: header.format,
        width: header.size.width,
        height: header.size.height,
        stride,
        // SAFETY: pixels lie within the meta
        pixels: unsafe { slice::from_raw_parts(base.add(start), len) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use libspa_sys::{spa_point, spa_rectangle, spa_region};
    use std::ffi::c_void;

    fn chunk(size: u32, stride: i32) -> spa_chunk {
        spa_chunk { offset: 0, size, stride, flags: 0 }
    }

    fn data(type_: u32, fd: i64, bytes: &mut [u8], chunk: &mut spa_chunk) -> spa_data {
        spa_data {
            type_,
            flags: 0,
            fd,
            mapoffset: 0,
            maxsize: bytes.len() as u32,
            data: bytes.as_mut_ptr().cast::<c_void>(),
            chunk,
        }
    }

    fn meta<T>(type_: u32, value: &mut T, size: usize) -> spa_meta {
        spa_meta { type_, size: size as u32, data: (value as *mut T).cast::<c_void>() }
    }

    #[test]
    fn test_null_buffer() {
        let inflight = unsafe { describe_spa_buffer(ptr::null()) };
        assert!(inflight.planes.is_empty());
        assert!(!inflight.has_payload());
    }

    #[test]
    fn test_memory_plane_and_crop() {
        let mut pixels = vec![7u8; 64];
        let mut chunk = chunk(32, 16);
        let mut datas = [data(libspa_sys::SPA_DATA_MemPtr, -1, &mut pixels, &mut chunk)];

        let mut region = spa_meta_region {
            region: spa_region {
                position: spa_point { x: 4, y: 2 },
                size: spa_rectangle { width: 8, height: 6 },
            },
        };
        let mut metas = [meta(libspa_sys::SPA_META_VideoCrop, &mut region, size_of::<spa_meta_region>())];

        let buffer = spa_buffer { n_metas: 1, n_datas: 1, metas: metas.as_mut_ptr(), datas: datas.as_mut_ptr() };
        let inflight = unsafe { describe_spa_buffer(&buffer) };

        assert_eq!(inflight.planes.len(), 1);
        assert_eq!(inflight.planes[0].kind, DataKind::MemPtr);
        assert_eq!(inflight.planes[0].fd, None);
        assert_eq!(inflight.planes[0].stride, 16);
        assert_eq!(inflight.planes[0].data.map(<[u8]>::len), Some(32));
        assert_eq!(inflight.crop, Some(CropRegion::new(4, 2, 8, 6)));
    }

    #[test]
    fn test_dmabuf_plane_is_unmapped() {
        let mut pixels = vec![0u8; 16];
        let mut chunk = chunk(16, 4);
        let mut datas = [data(libspa_sys::SPA_DATA_DmaBuf, 42, &mut pixels, &mut chunk)];

        let buffer = spa_buffer { n_metas: 0, n_datas: 1, metas: ptr::null_mut(), datas: datas.as_mut_ptr() };
        let inflight = unsafe { describe_spa_buffer(&buffer) };

        assert!(inflight.is_dmabuf());
        assert_eq!(inflight.planes[0].fd, Some(42));
        assert!(inflight.planes[0].data.is_none());
    }

    #[test]
    fn test_chunk_out_of_bounds() {
        let mut pixels = vec![0u8; 8];
        let mut chunk = chunk(64, 4);
        let mut datas = [data(libspa_sys::SPA_DATA_MemPtr, -1, &mut pixels, &mut chunk)];

        let buffer = spa_buffer { n_metas: 0, n_datas: 1, metas: ptr::null_mut(), datas: datas.as_mut_ptr() };
        let inflight = unsafe { describe_spa_buffer(&buffer) };

        assert!(inflight.has_payload());
        assert!(inflight.planes[0].data.is_none());
    }

    #[repr(C)]
    struct CursorBlock {
        cursor: spa_meta_cursor,
        bitmap: spa_meta_bitmap,
        pixels: [u8; 16],
    }

    fn cursor_block(bitmap_offset: u32) -> CursorBlock {
        CursorBlock {
            cursor: spa_meta_cursor {
                id: 1,
                flags: 0,
                position: spa_point { x: 100, y: 50 },
                hotspot: spa_point { x: 1, y: 1 },
                bitmap_offset,
            },
            bitmap: spa_meta_bitmap {
                format: libspa::param::video::VideoFormat::BGRA.as_raw(),
                size: spa_rectangle { width: 2, height: 2 },
                stride: 8,
                offset: size_of::<spa_meta_bitmap>() as u32,
            },
            pixels: [0xff; 16],
        }
    }

    #[test]
    fn test_cursor_with_bitmap() {
        let mut block = cursor_block(size_of::<spa_meta_cursor>() as u32);
        let size = size_of::<CursorBlock>();
        let mut metas = [meta(libspa_sys::SPA_META_Cursor, &mut block, size)];

        let buffer = spa_buffer { n_metas: 1, n_datas: 0, metas: metas.as_mut_ptr(), datas: ptr::null_mut() };
        let inflight = unsafe { describe_spa_buffer(&buffer) };

        let cursor = inflight.cursor.unwrap();
        assert!(cursor.is_valid());
        assert_eq!(cursor.position, (100, 50));
        let bitmap = cursor.bitmap.unwrap();
        assert_eq!((bitmap.width, bitmap.height), (2, 2));
        assert_eq!(bitmap.pixels.len(), 16);
        assert!(bitmap.is_usable());
    }

    #[test]
    fn test_cursor_bitmap_past_meta_is_ignored() {
        let mut block = cursor_block(size_of::<spa_meta_cursor>() as u32);
        // Meta too small to hold the pixels
        let size = size_of::<spa_meta_cursor>() + size_of::<spa_meta_bitmap>();
        let mut metas = [meta(libspa_sys::SPA_META_Cursor, &mut block, size)];

        let buffer = spa_buffer { n_metas: 1, n_datas: 0, metas: metas.as_mut_ptr(), datas: ptr::null_mut() };
        let inflight = unsafe { describe_spa_buffer(&buffer) };

        let cursor = inflight.cursor.unwrap();
        assert!(cursor.is_valid());
        assert!(cursor.bitmap.is_none());
    }

    #[test]
    fn test_cursor_without_bitmap() {
        let mut block = cursor_block(0);
        let mut metas = [meta(libspa_sys::SPA_META_Cursor, &mut block, size_of::<CursorBlock>())];

        let buffer = spa_buffer { n_metas: 1, n_datas: 0, metas: metas.as_mut_ptr(), datas: ptr::null_mut() };
        let inflight = unsafe { describe_spa_buffer(&buffer) };

        assert!(inflight.cursor.unwrap().bitmap.is_none());
    }
}

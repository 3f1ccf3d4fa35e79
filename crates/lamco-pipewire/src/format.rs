//! Pixel formats and their mappings
//!
//! Three vocabularies meet here: SPA video format ids (what PipeWire
//! negotiates), DRM fourcc codes (what GPU import needs) and the surface
//! color formats a [`SurfaceAllocator`](crate::surface::SurfaceAllocator)
//! understands.
//!
//! | SPA  | DRM fourcc | Surface | Notes |
//! |------|-----------|---------|-------|
//! | BGRA | ARGB8888  | Bgra    | |
//! | RGBA | ABGR8888  | Rgba    | |
//! | BGRx | XRGB8888  | Bgrx    | |
//! | RGBx | XBGR8888  | Bgrx    | red/blue swapped after upload |
//! | YUY2 | YUYV      | Bgra    | raw frames only |

use drm_fourcc::DrmFourcc;
use libspa::param::video::VideoFormat;

/// Modifier value meaning "implicit layout, let the importer decide"
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Pixel formats this crate negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum PixelFormat {
    /// 32-bit BGRA
    BGRA,
    /// 32-bit RGBA
    RGBA,
    /// 32-bit BGR, padding byte
    BGRx,
    /// 32-bit RGB, padding byte
    RGBx,
    /// Packed YUV 4:2:2
    YUY2,
}

impl PixelFormat {
    /// Map a negotiated SPA format, `None` for anything else
    pub fn from_spa(format: VideoFormat) -> Option<Self> {
        match format {
            VideoFormat::BGRA => Some(Self::BGRA),
            VideoFormat::RGBA => Some(Self::RGBA),
            VideoFormat::BGRx => Some(Self::BGRx),
            VideoFormat::RGBx => Some(Self::RGBx),
            VideoFormat::YUY2 => Some(Self::YUY2),
            _ => None,
        }
    }

    pub fn to_spa(self) -> VideoFormat {
        match self {
            Self::BGRA => VideoFormat::BGRA,
            Self::RGBA => VideoFormat::RGBA,
            Self::BGRx => VideoFormat::BGRx,
            Self::RGBx => VideoFormat::RGBx,
            Self::YUY2 => VideoFormat::YUY2,
        }
    }

    /// DRM fourcc used when importing a DMA-BUF of this format
    ///
    /// SPA names formats by byte order in memory, DRM by little-endian
    /// word order, hence the reversal.
    pub fn drm_fourcc(self) -> DrmFourcc {
        match self {
            Self::BGRA => DrmFourcc::Argb8888,
            Self::RGBA => DrmFourcc::Abgr8888,
            Self::BGRx => DrmFourcc::Xrgb8888,
            Self::RGBx => DrmFourcc::Xbgr8888,
            Self::YUY2 => DrmFourcc::Yuyv,
        }
    }

    /// Surface format for render-surface mode
    pub fn surface_format(self) -> SurfaceColorFormat {
        match self {
            Self::BGRA | Self::YUY2 => SurfaceColorFormat::Bgra,
            Self::RGBA => SurfaceColorFormat::Rgba,
            Self::BGRx | Self::RGBx => SurfaceColorFormat::Bgrx,
        }
    }

    /// Surfaces created from this format need red and blue swapped
    pub fn needs_swap_red_blue(self) -> bool {
        self == Self::RGBx
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::YUY2 => 2,
            _ => 4,
        }
    }

    /// Planes a buffer of this format carries
    pub fn plane_count(self) -> usize {
        1
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::BGRA | Self::RGBA)
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BGRA => "BGRA",
            Self::RGBA => "RGBA",
            Self::BGRx => "BGRx",
            Self::RGBx => "RGBx",
            Self::YUY2 => "YUY2",
        };
        f.write_str(name)
    }
}

/// Color formats understood by the surface allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceColorFormat {
    Rgba,
    Bgra,
    Bgrx,
}

/// Color matrix for YUV content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorMatrix {
    /// Producer gave RGB or nothing usable
    #[default]
    Default,
    Bt601,
    Bt709,
}

impl ColorMatrix {
    /// Map a raw `spa_video_color_matrix`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            libspa_sys::SPA_VIDEO_COLOR_MATRIX_BT601 => Self::Bt601,
            libspa_sys::SPA_VIDEO_COLOR_MATRIX_BT709 => Self::Bt709,
            _ => Self::Default,
        }
    }
}

/// Quantization range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    #[default]
    Default,
    /// 0-255
    Full,
    /// 16-235
    Partial,
}

impl ColorRange {
    /// Map a raw `spa_video_color_range`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            libspa_sys::SPA_VIDEO_COLOR_RANGE_0_255 => Self::Full,
            libspa_sys::SPA_VIDEO_COLOR_RANGE_16_235 => Self::Partial,
            _ => Self::Default,
        }
    }
}

/// Layout of a raw frame plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLayout {
    /// Bytes per row
    pub linesize: u32,
    /// Plane count
    pub planes: usize,
}

/// Row layout used by raw-frame mode, `None` for formats it cannot carry
pub fn raw_frame_layout(format: PixelFormat, width: u32) -> Option<RawLayout> {
    let linesize = match format {
        PixelFormat::RGBA => round_up_4(width * 4),
        PixelFormat::YUY2 => round_up_4(width * 2),
        _ => return None,
    };

    Some(RawLayout { linesize, planes: 1 })
}

fn round_up_4(value: u32) -> u32 {
    (value + 3) & !3
}

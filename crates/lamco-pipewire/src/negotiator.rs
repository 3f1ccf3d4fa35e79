//! Stream format negotiation
//!
//! A negotiation round goes:
//!
//! 1. [`build_proposal`] turns the catalog into ordered [`FormatOffer`]s,
//!    modifier offers first, then a modifier-less fallback for every format.
//! 2. The producer fixates one and emits a format param. The stream turns it
//!    into a [`FormatEvent`].
//! 3. [`StreamNegotiator::on_format_event`] commits a [`NegotiatedFormat`]
//!    and returns the [`CounterUpdate`] (metas and buffer types) to send back.
//! 4. Once `update_params` succeeds the stream calls
//!    [`StreamNegotiator::acknowledge_counter_update`] and buffers may flow.
//!
//! An import failure prunes the catalog and calls
//! [`StreamNegotiator::request_renegotiation`], which restarts at step 1 on
//! the same stream.

use libspa::param::format::{MediaSubtype, MediaType};
use libspa::param::format_utils;
use libspa::param::video::{VideoFormat, VideoInfoRaw};
use libspa::pod::Pod;
use tracing::{debug, info, warn};

use crate::catalog::ModifierTable;
use crate::crop::CropState;
use crate::format::{ColorMatrix, ColorRange, PixelFormat};

/// Size and framerate bounds for offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    /// Preferred size
    pub target: (u32, u32),
    pub min: (u32, u32),
    pub max: (u32, u32),
    /// Preferred framerate as `(num, denom)`
    pub framerate: (u32, u32),
    pub max_framerate: (u32, u32),
}

impl Default for VideoGeometry {
    fn default() -> Self {
        Self {
            target: (320, 240),
            min: (1, 1),
            max: (8192, 4320),
            framerate: (60, 1),
            max_framerate: (360, 1),
        }
    }
}

/// One entry of a format proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOffer {
    pub format: PixelFormat,
    /// Empty for the modifier-less variant
    pub modifiers: Vec<u64>,
    pub geometry: VideoGeometry,
}

impl FormatOffer {
    pub fn has_modifiers(&self) -> bool {
        !self.modifiers.is_empty()
    }
}

/// Build the ordered offer list for a catalog
pub fn build_proposal(catalog: &ModifierTable, geometry: &VideoGeometry) -> Vec<FormatOffer> {
    let with_modifiers = catalog
        .entries()
        .iter()
        .filter(|e| !e.modifiers.is_empty())
        .map(|e| FormatOffer { format: e.format, modifiers: e.modifiers.clone(), geometry: *geometry });

    let without = catalog
        .entries()
        .iter()
        .map(|e| FormatOffer { format: e.format, modifiers: Vec::new(), geometry: *geometry });

    with_modifiers.chain(without).collect()
}

/// Format param reported by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatEvent {
    pub media_type: MediaType,
    pub media_subtype: MediaSubtype,
    /// Raw `spa_video_format`
    pub spa_format: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: (u32, u32),
    pub color_matrix: ColorMatrix,
    pub color_range: ColorRange,
    /// Present only when the producer fixated a modifier
    pub modifier: Option<u64>,
}

impl FormatEvent {
    /// Raw-video event, used by tests and by [`FormatEvent::from_pod`]
    pub fn raw_video(format: VideoFormat, width: u32, height: u32) -> Self {
        Self {
            media_type: MediaType::Video,
            media_subtype: MediaSubtype::Raw,
            spa_format: format.as_raw(),
            width,
            height,
            framerate: (0, 1),
            color_matrix: ColorMatrix::Default,
            color_range: ColorRange::Default,
            modifier: None,
        }
    }

    #[must_use]
    pub fn with_modifier(mut self, modifier: u64) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Parse a `Format` param pod
    ///
    /// Returns `None` when the pod is not a format object at all. Non-raw
    /// media types are returned as-is so the negotiator can reject them.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let (media_type, media_subtype) = format_utils::parse_format(pod).ok()?;

        if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
            return Some(Self {
                media_type,
                media_subtype,
                ..Self::raw_video(VideoFormat::Unknown, 0, 0)
            });
        }

        let mut info = VideoInfoRaw::new();
        if let Err(e) = info.parse(pod) {
            warn!("Failed to parse raw video format: {:?}", e);
            return None;
        }

        let raw = info.as_raw();
        Some(Self {
            media_type,
            media_subtype,
            spa_format: info.format().as_raw(),
            width: info.size().width,
            height: info.size().height,
            framerate: (info.framerate().num, info.framerate().denom),
            color_matrix: ColorMatrix::from_raw(raw.color_matrix),
            color_range: ColorRange::from_raw(raw.color_range),
            modifier: (raw.flags & libspa_sys::SPA_VIDEO_FLAG_MODIFIER != 0).then(|| info.modifier()),
        })
    }

    pub fn is_raw_video(&self) -> bool {
        self.media_type == MediaType::Video && self.media_subtype == MediaSubtype::Raw
    }
}

/// Buffer data types the consumer accepts, as a `1 << spa_data_type` mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferTypes(u32);

impl BufferTypes {
    pub const MEM_PTR: Self = Self(1 << libspa_sys::SPA_DATA_MemPtr);
    pub const DMA_BUF: Self = Self(1 << libspa_sys::SPA_DATA_DmaBuf);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Committed result of a negotiation round
///
/// Replaced wholesale on every accepted format event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub spa_format: u32,
    /// `None` when the producer fixated a format we cannot map
    pub pixel_format: Option<PixelFormat>,
    pub width: u32,
    pub height: u32,
    pub framerate: (u32, u32),
    pub color_matrix: ColorMatrix,
    pub color_range: ColorRange,
    pub modifier: Option<u64>,
    pub buffer_types: BufferTypes,
}

impl NegotiatedFormat {
    /// Planes a buffer of this format must carry
    pub fn expected_planes(&self) -> usize {
        self.pixel_format.map_or(1, PixelFormat::plane_count)
    }
}

/// Cursor meta size for a bitmap of `width` x `height` 32-bit pixels
pub const fn cursor_meta_size(width: u32, height: u32) -> u32 {
    (std::mem::size_of::<libspa_sys::spa_meta_cursor>()
        + std::mem::size_of::<libspa_sys::spa_meta_bitmap>()) as u32
        + width * height * 4
}

/// Params the consumer sends back after a format event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    /// `spa_meta_region` size for the crop meta
    pub crop_meta_size: u32,
    /// Cursor meta size `(default, min, max)`
    pub cursor_meta_size: (u32, u32, u32),
    /// `spa_meta_header` size
    pub header_meta_size: u32,
    pub buffer_types: BufferTypes,
}

impl CounterUpdate {
    fn for_buffer_types(buffer_types: BufferTypes) -> Self {
        Self {
            crop_meta_size: std::mem::size_of::<libspa_sys::spa_meta_region>() as u32,
            cursor_meta_size: (
                cursor_meta_size(64, 64),
                cursor_meta_size(1, 1),
                cursor_meta_size(1024, 1024),
            ),
            header_meta_size: std::mem::size_of::<libspa_sys::spa_meta_header>() as u32,
            buffer_types,
        }
    }
}

/// Negotiation state for one stream
#[derive(Debug, Clone)]
pub struct StreamNegotiator {
    geometry: VideoGeometry,
    accept_dmabuf: bool,
    format: Option<NegotiatedFormat>,
    negotiated: bool,
    renegotiation_pending: bool,
    rounds: u64,
}

impl StreamNegotiator {
    pub fn new(geometry: VideoGeometry, accept_dmabuf: bool) -> Self {
        Self {
            geometry,
            accept_dmabuf,
            format: None,
            negotiated: false,
            renegotiation_pending: false,
            rounds: 0,
        }
    }

    /// Offers for the initial connect
    pub fn proposal(&self, catalog: &ModifierTable) -> Vec<FormatOffer> {
        build_proposal(catalog, &self.geometry)
    }

    /// Handle a producer format event
    ///
    /// Non raw-video events are ignored and leave every field untouched.
    pub fn on_format_event(&mut self, event: &FormatEvent) -> Option<CounterUpdate> {
        if !event.is_raw_video() {
            debug!(
                "Ignoring format event for {:?}/{:?}",
                event.media_type, event.media_subtype
            );
            return None;
        }

        let pixel_format = PixelFormat::from_spa(VideoFormat::from_raw(event.spa_format));
        let mut buffer_types = BufferTypes::MEM_PTR;
        if self.accept_dmabuf {
            buffer_types = buffer_types.with(BufferTypes::DMA_BUF);
        }

        let format = NegotiatedFormat {
            spa_format: event.spa_format,
            pixel_format,
            width: event.width,
            height: event.height,
            framerate: event.framerate,
            color_matrix: event.color_matrix,
            color_range: event.color_range,
            modifier: event.modifier,
            buffer_types,
        };

        match pixel_format {
            Some(pf) => info!(
                "Negotiated format {} {}x{} @ {}/{} modifier {:?}",
                pf, format.width, format.height, format.framerate.0, format.framerate.1, format.modifier
            ),
            None => warn!(
                "Producer fixated unsupported format {}, frames will be dropped",
                event.spa_format
            ),
        }

        self.format = Some(format);
        self.negotiated = false;
        self.renegotiation_pending = false;
        self.rounds += 1;

        Some(CounterUpdate::for_buffer_types(buffer_types))
    }

    /// The counter update was submitted to the producer
    pub fn acknowledge_counter_update(&mut self) {
        if self.format.is_some() {
            self.negotiated = true;
        }
    }

    /// Rebuild offers from the pruned catalog
    pub fn request_renegotiation(&mut self, catalog: &ModifierTable) -> Vec<FormatOffer> {
        self.renegotiation_pending = true;
        debug!("Renegotiating after round {}", self.rounds);
        build_proposal(catalog, &self.geometry)
    }

    pub fn format(&self) -> Option<&NegotiatedFormat> {
        self.format.as_ref()
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiation_pending
    }

    pub fn accepts_dmabuf(&self) -> bool {
        self.accept_dmabuf
    }

    pub fn geometry(&self) -> &VideoGeometry {
        &self.geometry
    }

    /// Accepted format events so far
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Visible frame size, `(0, 0)` until negotiated
    pub fn frame_size(&self, crop: &CropState) -> (u32, u32) {
        match self.format.filter(|_| self.negotiated) {
            None => (0, 0),
            Some(format) => crop
                .region()
                .map_or((format.width, format.height), |r| (r.width, r.height)),
        }
    }

    /// Forget the negotiated format, for a stream that went away
    pub fn reset(&mut self) {
        self.format = None;
        self.negotiated = false;
        self.renegotiation_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModifierQuery;
    use crate::crop::CropRegion;
    use crate::format::DRM_FORMAT_MOD_INVALID;
    use drm_fourcc::DrmFourcc;

    struct TwoModifiers;

    impl ModifierQuery for TwoModifiers {
        fn query_modifiers(&self, fourcc: DrmFourcc) -> Option<Vec<u64>> {
            (fourcc == DrmFourcc::Xrgb8888).then(|| vec![0xa, 0xb])
        }
    }

    #[test]
    fn test_proposal_ordering() {
        let mut catalog = ModifierTable::for_render_surface(&TwoModifiers);
        catalog.prune(PixelFormat::RGBA, DRM_FORMAT_MOD_INVALID);

        let offers = build_proposal(&catalog, &VideoGeometry::default());

        // Three formats with modifiers, then one fallback per format
        assert_eq!(offers.len(), 7);
        assert!(offers[..3].iter().all(FormatOffer::has_modifiers));
        assert!(offers[3..].iter().all(|o| !o.has_modifiers()));
        assert_eq!(offers[1].format, PixelFormat::BGRx);
        assert_eq!(offers[1].modifiers, vec![0xa, 0xb, DRM_FORMAT_MOD_INVALID]);
        assert_eq!(offers[3].format, PixelFormat::BGRA);
        assert_eq!(offers[4].format, PixelFormat::RGBA);
    }

    #[test]
    fn test_pruned_modifier_never_offered() {
        let mut catalog = ModifierTable::for_render_surface(&TwoModifiers);
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);

        catalog.prune(PixelFormat::BGRx, 0xa);
        for _ in 0..10 {
            let offers = negotiator.request_renegotiation(&catalog);
            assert!(offers
                .iter()
                .filter(|o| o.format == PixelFormat::BGRx)
                .all(|o| !o.modifiers.contains(&0xa)));
        }

        let offers = negotiator.proposal(&catalog);
        assert_eq!(
            offers.iter().find(|o| o.format == PixelFormat::BGRx).map(|o| o.modifiers.clone()),
            Some(vec![0xb, DRM_FORMAT_MOD_INVALID])
        );
    }

    #[test]
    fn test_non_raw_event_ignored() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);
        let event = FormatEvent {
            media_subtype: MediaSubtype::Mjpg,
            ..FormatEvent::raw_video(VideoFormat::BGRx, 1920, 1080)
        };

        assert!(negotiator.on_format_event(&event).is_none());
        assert!(negotiator.format().is_none());
        assert_eq!(negotiator.rounds(), 0);
    }

    #[test]
    fn test_negotiation_gating() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);
        let crop = CropState::default();
        let event = FormatEvent::raw_video(VideoFormat::BGRx, 1920, 1080).with_modifier(0xa);

        let update = negotiator.on_format_event(&event);
        assert!(update.is_some());
        assert!(!negotiator.is_negotiated());
        assert_eq!(negotiator.frame_size(&crop), (0, 0));

        negotiator.acknowledge_counter_update();
        assert!(negotiator.is_negotiated());
        assert_eq!(negotiator.frame_size(&crop), (1920, 1080));
    }

    #[test]
    fn test_acknowledge_without_format() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);
        negotiator.acknowledge_counter_update();
        assert!(!negotiator.is_negotiated());
    }

    #[test]
    fn test_buffer_types() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);

        // Implicit-layout DMA-BUFs stay allowed without a modifier
        let update = negotiator.on_format_event(&FormatEvent::raw_video(VideoFormat::BGRx, 64, 64));
        assert_eq!(
            update.map(|u| u.buffer_types),
            Some(BufferTypes::MEM_PTR.with(BufferTypes::DMA_BUF))
        );

        let update =
            negotiator.on_format_event(&FormatEvent::raw_video(VideoFormat::BGRx, 64, 64).with_modifier(0xa));
        let types = update.map(|u| u.buffer_types).unwrap_or_default();
        assert!(types.contains(BufferTypes::DMA_BUF));
        assert!(types.contains(BufferTypes::MEM_PTR));

        let mut memory_only = StreamNegotiator::new(VideoGeometry::default(), false);
        let update =
            memory_only.on_format_event(&FormatEvent::raw_video(VideoFormat::BGRx, 64, 64).with_modifier(0xa));
        assert_eq!(update.map(|u| u.buffer_types), Some(BufferTypes::MEM_PTR));
    }

    #[test]
    fn test_renegotiation_cleared_by_format_event() {
        let catalog = ModifierTable::for_render_surface(&TwoModifiers);
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);

        negotiator.request_renegotiation(&catalog);
        assert!(negotiator.renegotiation_pending());

        negotiator.on_format_event(&FormatEvent::raw_video(VideoFormat::BGRx, 64, 64));
        assert!(!negotiator.renegotiation_pending());
    }

    #[test]
    fn test_unsupported_format_committed() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);
        negotiator.on_format_event(&FormatEvent::raw_video(VideoFormat::NV12, 64, 64));

        assert_eq!(negotiator.format().map(|f| f.pixel_format), Some(None));
    }

    #[test]
    fn test_frame_size_uses_crop() {
        let mut negotiator = StreamNegotiator::new(VideoGeometry::default(), true);
        negotiator.on_format_event(&FormatEvent::raw_video(VideoFormat::BGRx, 1920, 1080));
        negotiator.acknowledge_counter_update();

        let mut crop = CropState::default();
        crop.apply(Some(CropRegion::new(100, 100, 800, 600)));
        assert_eq!(negotiator.frame_size(&crop), (800, 600));

        negotiator.reset();
        assert_eq!(negotiator.frame_size(&crop), (0, 0));
    }

    #[test]
    fn test_cursor_meta_size() {
        assert_eq!(cursor_meta_size(64, 64), 48 + 64 * 64 * 4);
        assert_eq!(cursor_meta_size(1, 1), 52);
    }
}

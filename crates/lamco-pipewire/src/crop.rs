//! Crop region metadata
//!
//! Producers may attach a `VideoCrop` meta to each buffer naming the part
//! of the frame that holds content. A region is only kept while the latest
//! report is well-formed; anything else clears it.

/// Sub-rectangle of the frame carrying content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Non-empty and not starting at a negative offset
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.x >= 0 && self.y >= 0
    }

    /// Whether cropping to this region changes what is drawn
    #[must_use]
    pub const fn is_effective(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x != 0 || self.y != 0 || self.width < frame_width || self.height < frame_height
    }

    /// Clip region to frame bounds
    #[must_use]
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<Self> {
        if !self.is_well_formed() {
            return None;
        }

        let (x, y) = (self.x as u32, self.y as u32);
        if x >= frame_width || y >= frame_height {
            return None;
        }

        Some(Self {
            x: self.x,
            y: self.y,
            width: self.width.min(frame_width - x),
            height: self.height.min(frame_height - y),
        })
    }
}

/// Crop state carried across frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropState {
    region: Option<CropRegion>,
}

impl CropState {
    /// Apply the meta reported with a buffer
    ///
    /// A missing or malformed report invalidates the stored region.
    pub fn apply(&mut self, report: Option<CropRegion>) {
        self.region = report.filter(CropRegion::is_well_formed);
    }

    pub fn clear(&mut self) {
        self.region = None;
    }

    pub fn is_valid(&self) -> bool {
        self.region.is_some()
    }

    pub fn region(&self) -> Option<CropRegion> {
        self.region
    }

    /// Region worth drawing for a frame of this size
    pub fn effective(&self, frame_width: u32, frame_height: u32) -> Option<CropRegion> {
        self.region
            .filter(|r| r.is_effective(frame_width, frame_height))
            .and_then(|r| r.clip(frame_width, frame_height))
    }
}

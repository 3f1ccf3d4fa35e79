//! PipeWire Configuration
//!
//! Provides configuration options for capture streams with a builder pattern
//! for ergonomic construction.
//!
//! # Examples
//!
//! ```rust
//! use lamco_pipewire::PipeWireConfig;
//! use std::time::Duration;
//!
//! // Using builder pattern
//! let config = PipeWireConfig::builder()
//!     .target_size(1920, 1080)
//!     .use_dmabuf(true)
//!     .sync_timeout(Duration::from_secs(5))
//!     .build();
//!
//! // Using struct literal with defaults
//! let config = PipeWireConfig {
//!     show_cursor: false,
//!     ..Default::default()
//! };
//! ```
//!
//! Settings coming from a surrounding key/value layer can be applied with
//! [`PipeWireConfig::from_settings`].

use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::negotiator::VideoGeometry;

/// Settings key for cursor visibility
pub const SETTING_SHOW_CURSOR: &str = "ShowCursor";

/// Settings key for the camera device selection
pub const SETTING_DEVICE_ID: &str = "device_id";

/// Configuration for PipeWire capture
///
/// Use [`PipeWireConfig::builder()`] for ergonomic construction or struct
/// literal syntax with [`Default::default()`].
#[derive(Debug, Clone)]
pub struct PipeWireConfig {
    /// Stream name announced to PipeWire (default: "lamco-capture")
    ///
    /// The stream id is appended.
    pub stream_name: String,

    /// Draw the cursor from metadata (default: true)
    pub show_cursor: bool,

    /// Camera selection string, a node name (default: None)
    pub device_id: Option<String>,

    /// Whether to negotiate DMA-BUF for zero-copy transfer (default: true)
    ///
    /// Falls back to memory buffers when the consumer or producer cannot.
    pub use_dmabuf: bool,

    /// Preferred size offered to the producer (default: 320x240)
    pub target_size: (u32, u32),

    /// Smallest acceptable size (default: 1x1)
    pub min_size: (u32, u32),

    /// Largest acceptable size (default: 8192x4320)
    pub max_size: (u32, u32),

    /// Preferred framerate as `(num, denom)` (default: 60/1)
    pub framerate: (u32, u32),

    /// Highest acceptable framerate (default: 360/1)
    pub max_framerate: (u32, u32),

    /// Bound for core sync rounds (default: None)
    ///
    /// `None` waits until the core answers or reports an error.
    pub sync_timeout: Option<Duration>,

    /// Maximum number of concurrent streams (default: 8)
    pub max_streams: usize,
}

impl Default for PipeWireConfig {
    fn default() -> Self {
        let geometry = VideoGeometry::default();

        Self {
            stream_name: "lamco-capture".to_string(),
            show_cursor: true,
            device_id: None,
            use_dmabuf: true,
            target_size: geometry.target,
            min_size: geometry.min,
            max_size: geometry.max,
            framerate: geometry.framerate,
            max_framerate: geometry.max_framerate,
            sync_timeout: None,
            max_streams: 8,
        }
    }
}

impl PipeWireConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> PipeWireConfigBuilder {
        PipeWireConfigBuilder::default()
    }

    /// Build from plain key/value settings
    ///
    /// Recognized keys are `ShowCursor` (boolean) and `device_id`. Unknown
    /// keys are ignored.
    ///
    /// ```rust
    /// use lamco_pipewire::PipeWireConfig;
    /// use std::collections::HashMap;
    ///
    /// let settings = HashMap::from([
    ///     ("ShowCursor".to_string(), "false".to_string()),
    ///     ("device_id".to_string(), "v4l2_input.pci-0000_00_14.0-usb-0_1_1.0".to_string()),
    /// ]);
    ///
    /// let config = PipeWireConfig::from_settings(&settings);
    /// assert!(!config.show_cursor);
    /// ```
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        for (key, value) in settings {
            match key.as_str() {
                SETTING_SHOW_CURSOR => match parse_bool(value) {
                    Some(show) => config.show_cursor = show,
                    None => debug!("Ignoring non-boolean {}={}", key, value),
                },
                SETTING_DEVICE_ID => {
                    config.device_id = Some(value.clone()).filter(|v| !v.is_empty());
                }
                _ => debug!("Ignoring unknown setting {}", key),
            }
        }

        config
    }

    /// Size and framerate bounds for format offers
    pub fn geometry(&self) -> VideoGeometry {
        VideoGeometry {
            target: self.target_size,
            min: self.min_size,
            max: self.max_size,
            framerate: self.framerate,
            max_framerate: self.max_framerate,
        }
    }

    /// Validate configuration and return any issues
    ///
    /// Returns `Ok(())` if configuration is valid, or a list of issues.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.stream_name.is_empty() {
            issues.push("stream_name cannot be empty".to_string());
        }

        if self.max_streams == 0 {
            issues.push("max_streams must be at least 1".to_string());
        }

        if self.min_size.0 == 0 || self.min_size.1 == 0 {
            issues.push("min_size must be at least 1x1".to_string());
        }

        if self.min_size.0 > self.max_size.0 || self.min_size.1 > self.max_size.1 {
            issues.push("min_size exceeds max_size".to_string());
        }

        let (w, h) = self.target_size;
        if w < self.min_size.0 || h < self.min_size.1 || w > self.max_size.0 || h > self.max_size.1 {
            issues.push("target_size must lie between min_size and max_size".to_string());
        }

        if self.framerate.1 == 0 || self.max_framerate.1 == 0 {
            issues.push("framerate denominators must be non-zero".to_string());
        } else if u64::from(self.framerate.0) * u64::from(self.max_framerate.1)
            > u64::from(self.max_framerate.0) * u64::from(self.framerate.1)
        {
            issues.push("framerate exceeds max_framerate".to_string());
        }

        if self.sync_timeout.is_some_and(|t| t.is_zero()) {
            issues.push("sync_timeout must be non-zero when set".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder for [`PipeWireConfig`]
#[derive(Debug, Clone, Default)]
pub struct PipeWireConfigBuilder {
    stream_name: Option<String>,
    show_cursor: Option<bool>,
    device_id: Option<String>,
    use_dmabuf: Option<bool>,
    target_size: Option<(u32, u32)>,
    min_size: Option<(u32, u32)>,
    max_size: Option<(u32, u32)>,
    framerate: Option<(u32, u32)>,
    max_framerate: Option<(u32, u32)>,
    sync_timeout: Option<Duration>,
    max_streams: Option<usize>,
}

impl PipeWireConfigBuilder {
    /// Set stream name
    #[must_use]
    pub fn stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = Some(name.into());
        self
    }

    /// Set cursor visibility
    #[must_use]
    pub fn show_cursor(mut self, show: bool) -> Self {
        self.show_cursor = Some(show);
        self
    }

    /// Select a camera by node name
    #[must_use]
    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }

    /// Set whether to use DMA-BUF
    #[must_use]
    pub fn use_dmabuf(mut self, enable: bool) -> Self {
        self.use_dmabuf = Some(enable);
        self
    }

    /// Set preferred size
    #[must_use]
    pub fn target_size(mut self, width: u32, height: u32) -> Self {
        self.target_size = Some((width, height));
        self
    }

    /// Set size bounds
    #[must_use]
    pub fn size_range(mut self, min: (u32, u32), max: (u32, u32)) -> Self {
        self.min_size = Some(min);
        self.max_size = Some(max);
        self
    }

    /// Set preferred framerate
    #[must_use]
    pub fn framerate(mut self, num: u32, denom: u32) -> Self {
        self.framerate = Some((num, denom));
        self
    }

    /// Set highest framerate
    #[must_use]
    pub fn max_framerate(mut self, num: u32, denom: u32) -> Self {
        self.max_framerate = Some((num, denom));
        self
    }

    /// Bound core sync rounds
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = Some(timeout);
        self
    }

    /// Set maximum concurrent streams
    #[must_use]
    pub fn max_streams(mut self, max: usize) -> Self {
        self.max_streams = Some(max);
        self
    }

    /// Build the configuration
    ///
    /// Returns a [`PipeWireConfig`] with builder values overriding defaults.
    #[must_use]
    pub fn build(self) -> PipeWireConfig {
        let defaults = PipeWireConfig::default();

        PipeWireConfig {
            stream_name: self.stream_name.unwrap_or(defaults.stream_name),
            show_cursor: self.show_cursor.unwrap_or(defaults.show_cursor),
            device_id: self.device_id.or(defaults.device_id),
            use_dmabuf: self.use_dmabuf.unwrap_or(defaults.use_dmabuf),
            target_size: self.target_size.unwrap_or(defaults.target_size),
            min_size: self.min_size.unwrap_or(defaults.min_size),
            max_size: self.max_size.unwrap_or(defaults.max_size),
            framerate: self.framerate.unwrap_or(defaults.framerate),
            max_framerate: self.max_framerate.unwrap_or(defaults.max_framerate),
            sync_timeout: self.sync_timeout.or(defaults.sync_timeout),
            max_streams: self.max_streams.unwrap_or(defaults.max_streams),
        }
    }
}

//! Configuration types for Portal operations
//!
//! Provides flexible configuration for capture sessions through both struct
//! literals and builder patterns.

use ashpd::desktop::screencast::{CursorMode, SourceType};
use ashpd::desktop::PersistMode;
use enumflags2::BitFlags;

/// What the session asks the broker for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    /// Screen content (monitors, windows or virtual outputs)
    Screen(BitFlags<SourceType>),

    /// A camera device
    Camera,
}

impl Default for CaptureKind {
    fn default() -> Self {
        Self::Screen(SourceType::Monitor.into())
    }
}

impl CaptureKind {
    /// Monitor capture
    pub fn monitor() -> Self {
        Self::Screen(SourceType::Monitor.into())
    }

    /// Single window capture
    pub fn window() -> Self {
        Self::Screen(SourceType::Window.into())
    }

    /// Whether this is a screen capture of any sort
    pub fn is_screen(&self) -> bool {
        matches!(self, Self::Screen(_))
    }
}

/// Configuration for capture session behavior
///
/// # Examples
///
/// Using defaults:
/// ```no_run
/// # use lamco_portal::PortalConfig;
/// let config = PortalConfig::default();
/// ```
///
/// Using builder:
/// ```no_run
/// # use lamco_portal::{CaptureKind, PortalConfig};
/// # use ashpd::desktop::PersistMode;
/// let config = PortalConfig::builder()
///     .capture_kind(CaptureKind::window())
///     .show_cursor(false)
///     .persist_mode(PersistMode::Application)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// What to capture when no explicit kind is passed to a request
    pub capture_kind: CaptureKind,

    /// Whether the cursor should be visible in the captured content
    ///
    /// Only consulted when the broker cannot deliver cursor metadata. With
    /// metadata available the cursor is always delivered out of band and the
    /// consumer decides whether to draw it.
    pub show_cursor: bool,

    /// Whether to persist session permissions
    pub persist_mode: PersistMode,

    /// Allow selecting multiple sources
    ///
    /// One capture session consumes exactly one stream, so this defaults to
    /// `false`.
    pub allow_multiple: bool,

    /// Restore token from a previous session
    pub restore_token: Option<String>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            capture_kind: CaptureKind::default(),
            show_cursor: true,
            persist_mode: PersistMode::DoNot,
            allow_multiple: false,
            restore_token: None,
        }
    }
}

impl PortalConfig {
    /// Create a new builder for PortalConfig
    pub fn builder() -> PortalConfigBuilder {
        PortalConfigBuilder::default()
    }

    /// Pick the cursor mode to request from what the broker advertises
    ///
    /// Metadata wins whenever it is offered. Otherwise the cursor is embedded
    /// if it should be shown, and hidden as the last resort.
    pub fn cursor_mode_for(&self, available: BitFlags<CursorMode>) -> CursorMode {
        if available.contains(CursorMode::Metadata) {
            CursorMode::Metadata
        } else if available.contains(CursorMode::Embedded) && self.show_cursor {
            CursorMode::Embedded
        } else {
            CursorMode::Hidden
        }
    }

    /// Validate configuration and return any issues
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if let CaptureKind::Screen(types) = self.capture_kind {
            if types.is_empty() {
                issues.push("screen capture needs at least one source type".to_string());
            }
        }

        if self.restore_token.as_deref() == Some("") {
            issues.push("restore_token cannot be empty".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Builder for PortalConfig
///
/// All fields are optional and fall back to [`PortalConfig::default`].
#[derive(Default, Debug)]
pub struct PortalConfigBuilder {
    capture_kind: Option<CaptureKind>,
    show_cursor: Option<bool>,
    persist_mode: Option<PersistMode>,
    allow_multiple: Option<bool>,
    restore_token: Option<String>,
}

impl PortalConfigBuilder {
    /// Set what to capture
    ///
    /// Default: monitors
    #[must_use]
    pub fn capture_kind(mut self, kind: CaptureKind) -> Self {
        self.capture_kind = Some(kind);
        self
    }

    /// Set whether the cursor should be shown
    ///
    /// Default: `true`
    #[must_use]
    pub fn show_cursor(mut self, show: bool) -> Self {
        self.show_cursor = Some(show);
        self
    }

    /// Set session persistence mode
    ///
    /// Default: `PersistMode::DoNot`
    #[must_use]
    pub fn persist_mode(mut self, mode: PersistMode) -> Self {
        self.persist_mode = Some(mode);
        self
    }

    /// Set whether multiple sources can be selected
    ///
    /// Default: `false`
    #[must_use]
    pub fn allow_multiple(mut self, allow: bool) -> Self {
        self.allow_multiple = Some(allow);
        self
    }

    /// Set restore token from previous session
    #[must_use]
    pub fn restore_token(mut self, token: impl Into<String>) -> Self {
        self.restore_token = Some(token.into());
        self
    }

    /// Build the PortalConfig
    pub fn build(self) -> PortalConfig {
        let defaults = PortalConfig::default();
        PortalConfig {
            capture_kind: self.capture_kind.unwrap_or(defaults.capture_kind),
            show_cursor: self.show_cursor.unwrap_or(defaults.show_cursor),
            persist_mode: self.persist_mode.unwrap_or(defaults.persist_mode),
            allow_multiple: self.allow_multiple.unwrap_or(defaults.allow_multiple),
            restore_token: self.restore_token.or(defaults.restore_token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PortalConfig::default();
        assert_eq!(config.capture_kind, CaptureKind::monitor());
        assert!(config.show_cursor);
        assert!(matches!(config.persist_mode, PersistMode::DoNot));
        assert!(!config.allow_multiple);
        assert!(config.restore_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_with_custom_values() {
        let config = PortalConfig::builder()
            .capture_kind(CaptureKind::Camera)
            .show_cursor(false)
            .persist_mode(PersistMode::Application)
            .restore_token("test-token")
            .build();

        assert_eq!(config.capture_kind, CaptureKind::Camera);
        assert!(!config.show_cursor);
        assert!(matches!(config.persist_mode, PersistMode::Application));
        assert_eq!(config.restore_token, Some("test-token".to_string()));
    }

    #[test]
    fn test_cursor_mode_prefers_metadata() {
        let config = PortalConfig::default();
        let all = CursorMode::Hidden | CursorMode::Embedded | CursorMode::Metadata;
        assert!(matches!(config.cursor_mode_for(all), CursorMode::Metadata));

        let hidden_cfg = PortalConfig::builder().show_cursor(false).build();
        assert!(matches!(hidden_cfg.cursor_mode_for(all), CursorMode::Metadata));
    }

    #[test]
    fn test_cursor_mode_embedded_only_when_shown() {
        let available = CursorMode::Hidden | CursorMode::Embedded;

        let shown = PortalConfig::default();
        assert!(matches!(shown.cursor_mode_for(available), CursorMode::Embedded));

        let hidden = PortalConfig::builder().show_cursor(false).build();
        assert!(matches!(hidden.cursor_mode_for(available), CursorMode::Hidden));
    }

    #[test]
    fn test_cursor_mode_nothing_advertised() {
        let config = PortalConfig::default();
        assert!(matches!(config.cursor_mode_for(BitFlags::empty()), CursorMode::Hidden));
    }

    #[test]
    fn test_validation_rejects_empty_sources() {
        let config = PortalConfig {
            capture_kind: CaptureKind::Screen(BitFlags::empty()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

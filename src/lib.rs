//! # lamco-capture
//!
//! Portal capability sessions and zero-copy PipeWire capture for Wayland
//! screens and cameras.
//!
//! This crate provides a unified interface to the lamco capture libraries:
//!
//! - **[`portal`]** - Capability sessions with the desktop portal (screencast, camera)
//! - **[`pipewire`]** - Format negotiation and DMA-BUF buffer exchange
//!
//! # Features
//!
//! All features are enabled by default. You can selectively enable only what you need:
//!
//! ```toml
//! # Use everything (default)
//! lamco-capture = "0.1"
//!
//! # Portal only
//! lamco-capture = { version = "0.1", default-features = false, features = ["portal"] }
//!
//! # All features including sub-crate features
//! lamco-capture = { version = "0.1", features = ["full"] }
//! ```
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `portal` | Yes | XDG Desktop Portal capability sessions |
//! | `pipewire` | Yes | PipeWire capture streams |
//! | `full` | No | All features from all sub-crates |
//!
//! # Quick Start
//!
//! ## Screen Capture: Portal → PipeWire
//!
//! ```rust,ignore
//! use std::os::fd::AsFd;
//! use lamco_capture::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Ask the portal for a monitor
//!     let portal = PortalManager::with_default().await?;
//!     let session = portal.session();
//!     let grant = session.request_access(CaptureKind::monitor()).await?;
//!     let node_id = grant.node_id().ok_or("no stream granted")?;
//!
//!     // 2. Connect PipeWire over the granted descriptor
//!     let config = PipeWireConfig::builder()
//!         .show_cursor(grant.cursor_as_metadata())
//!         .build();
//!     let mut pw = PipeWireManager::new(config)?;
//!     pw.connect(Some(grant.into_fd().as_fd())).await?;
//!     session.mark_connected().await?;
//!
//!     // 3. Receive frames in raw mode
//!     let handle = pw
//!         .create_stream(node_id, RawFrameConsumer::new(MySink::default()), ModifierTable::for_raw_frames())
//!         .await?;
//!
//!     // ... frames arrive in MySink::on_frame
//!     pw.remove_stream(handle.id()).await?;
//!     pw.shutdown().await?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        lamco-capture                            │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │        lamco-portal          │         lamco-pipewire           │
//! │                              │                                  │
//! │  PortalManager               │  PipeWireManager / StreamHandle  │
//! │  CapabilitySession           │  StreamNegotiator / ModifierTable│
//! │  CapabilityGrant (fd)  ────────▶ LoopThread / BufferExchange    │
//! └──────────────┬───────────────┴────────────────┬─────────────────┘
//!                │                                │
//!                ▼                                ▼
//!       XDG Desktop Portal                   PipeWire API
//! ```
//!
//! # Platform Support
//!
//! - **Linux only** - Requires Wayland compositor
//! - **PipeWire** - Required for lamco-pipewire
//! - **XDG Desktop Portal** - Required for lamco-portal
//!
//! # Related Crates
//!
//! You can also use the individual crates directly:
//!
//! - [`lamco-portal`](https://crates.io/crates/lamco-portal) - Portal only
//! - [`lamco-pipewire`](https://crates.io/crates/lamco-pipewire) - PipeWire only

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// RE-EXPORTS
// =============================================================================

/// XDG Desktop Portal capability sessions.
///
/// This module drives the portal handshake for:
/// - Screen casting (monitors and windows)
/// - Camera access
///
/// See [`lamco_portal`] documentation for details.
#[cfg(feature = "portal")]
#[cfg_attr(docsrs, doc(cfg(feature = "portal")))]
pub use lamco_portal as portal;

/// PipeWire capture with DMA-BUF support.
///
/// This module provides access to PipeWire capture streams:
/// - Modifier-aware format negotiation
/// - Zero-copy DMA-BUF import with memory fallback
/// - Crop and cursor metadata
///
/// See [`lamco_pipewire`] documentation for details.
#[cfg(feature = "pipewire")]
#[cfg_attr(docsrs, doc(cfg(feature = "pipewire")))]
pub use lamco_pipewire as pipewire;

// =============================================================================
// PRELUDE - Common types for convenience
// =============================================================================

/// Prelude module with commonly used types.
///
/// ```rust
/// use lamco_capture::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "portal")]
    pub use lamco_portal::{CapabilityGrant, CapabilitySession, CaptureKind, PortalConfig, PortalError, PortalManager};

    #[cfg(feature = "pipewire")]
    pub use lamco_pipewire::{
        FrameConsumer, ModifierTable, PipeWireConfig, PipeWireError, PipeWireManager, RawFrameConsumer,
        RenderSurfaceConsumer, StreamHandle,
    };
}

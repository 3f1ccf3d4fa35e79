//! ScreenCast portal integration
//!
//! Wraps the xdg-desktop-portal ScreenCast interface behind the request
//! methods [`DesktopBroker`](crate::DesktopBroker) exposes. ashpd attaches a
//! fresh `handle_token` and `session_handle_token` to every call.

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType as PortalSourceType};
use ashpd::desktop::Session;
use enumflags2::BitFlags;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, info};

use crate::broker::{from_ashpd, BrokerResponse, SourceSelection, StartedStreams};
use crate::error::Result;
use crate::session::{SourceType, StreamInfo};

/// ashpd session handle for screen capture
pub type ScreenCastSession = Session<'static, Screencast<'static>>;

/// ScreenCast portal manager
#[derive(Debug, Default)]
pub struct ScreenCastManager;

impl ScreenCastManager {
    pub fn new() -> Self {
        Self
    }

    /// Cursor modes the backend supports
    pub async fn available_cursor_modes(&self) -> Result<BitFlags<CursorMode>> {
        let proxy = Screencast::new().await?;
        let modes = proxy.available_cursor_modes().await?;
        debug!("Available cursor modes: {:?}", modes);
        Ok(modes)
    }

    /// Create a screencast session
    pub async fn create_session(&self) -> Result<BrokerResponse<ScreenCastSession>> {
        info!("Creating ScreenCast session");

        let proxy = Screencast::new().await?;
        let response = from_ashpd(proxy.create_session().await)?;

        if response.is_success() {
            debug!("ScreenCast session created");
        }
        Ok(response)
    }

    /// Select what to capture
    pub async fn select_sources(
        &self,
        session: &ScreenCastSession,
        selection: &SourceSelection,
    ) -> Result<BrokerResponse<()>> {
        info!(
            "Selecting sources {:?} with cursor mode {:?}",
            selection.types, selection.cursor_mode
        );

        let proxy = Screencast::new().await?;
        let request = proxy
            .select_sources(
                session,
                selection.cursor_mode,
                selection.types,
                selection.multiple,
                selection.restore_token.as_deref(),
                selection.persist_mode,
            )
            .await;

        match request {
            Ok(request) => from_ashpd(request.response()),
            Err(e) => from_ashpd(Err(e)),
        }
    }

    /// Start the screencast; this is where the permission dialog appears
    pub async fn start(&self, session: &ScreenCastSession) -> Result<BrokerResponse<StartedStreams>> {
        info!("Starting screencast session");

        let proxy = Screencast::new().await?;

        // None for headless/no parent window
        let streams = match proxy.start(session, None).await {
            Ok(request) => from_ashpd(request.response())?,
            Err(e) => from_ashpd(Err(e))?,
        };

        Ok(streams.map(|streams| {
            info!("Screencast started with {} streams", streams.streams().len());

            StartedStreams {
                streams: streams.streams().iter().map(stream_info).collect(),
                restore_token: streams.restore_token().map(str::to_string),
            }
        }))
    }

    /// Open the PipeWire remote scoped to this session
    pub async fn open_remote(&self, session: &ScreenCastSession) -> Result<OwnedFd> {
        let proxy = Screencast::new().await?;
        let fd = proxy.open_pipe_wire_remote(session).await?;

        info!("PipeWire FD obtained: {}", fd.as_raw_fd());
        Ok(fd)
    }
}

fn stream_info(stream: &ashpd::desktop::screencast::Stream) -> StreamInfo {
    let size = stream.size().unwrap_or((0, 0));
    StreamInfo {
        node_id: stream.pipe_wire_node_id(),
        position: stream.position().unwrap_or((0, 0)),
        size: (
            size.0.max(0).try_into().unwrap_or(0),
            size.1.max(0).try_into().unwrap_or(0),
        ),
        source_type: stream.source_type().map_or(SourceType::Monitor, source_type),
    }
}

fn source_type(portal: PortalSourceType) -> SourceType {
    match portal {
        PortalSourceType::Monitor => SourceType::Monitor,
        PortalSourceType::Window => SourceType::Window,
        PortalSourceType::Virtual => SourceType::Virtual,
    }
}

//! xdg-desktop-portal backed broker client

use ashpd::desktop::screencast::CursorMode;
use enumflags2::BitFlags;
use std::os::fd::OwnedFd;
use tracing::{debug, info};

use crate::broker::{BrokerClient, BrokerResponse, SourceSelection, StartedStreams};
use crate::camera::CameraManager;
use crate::error::{PortalError, Result};
use crate::screencast::{ScreenCastManager, ScreenCastSession};

/// Broker client for the desktop portal
///
/// Create one per process with [`DesktopBroker::connect`] and share it
/// between sessions.
pub struct DesktopBroker {
    connection: zbus::Connection,
    screencast: ScreenCastManager,
    camera: CameraManager,
}

impl DesktopBroker {
    /// Connect to the session bus
    pub async fn connect() -> Result<Self> {
        let connection = zbus::Connection::session().await?;

        match connection.unique_name() {
            Some(name) => info!("Connected to D-Bus session bus as {}", name),
            None => debug!("Connected to D-Bus session bus"),
        }

        Ok(Self {
            connection,
            screencast: ScreenCastManager::new(),
            camera: CameraManager::new(),
        })
    }

    /// Our unique name on the bus, as seen by the broker
    pub fn sender_name(&self) -> Option<String> {
        self.connection.unique_name().map(ToString::to_string)
    }

    pub fn screencast(&self) -> &ScreenCastManager {
        &self.screencast
    }

    pub fn camera(&self) -> &CameraManager {
        &self.camera
    }
}

impl BrokerClient for DesktopBroker {
    type Session = ScreenCastSession;

    async fn available_cursor_modes(&self) -> Result<BitFlags<CursorMode>> {
        self.screencast.available_cursor_modes().await
    }

    async fn is_camera_present(&self) -> Result<bool> {
        self.camera.is_present().await
    }

    async fn create_session(&self) -> Result<BrokerResponse<Self::Session>> {
        self.screencast.create_session().await
    }

    async fn select_sources(&self, session: &Self::Session, selection: &SourceSelection) -> Result<BrokerResponse<()>> {
        self.screencast.select_sources(session, selection).await
    }

    async fn start(&self, session: &Self::Session) -> Result<BrokerResponse<StartedStreams>> {
        self.screencast.start(session).await
    }

    async fn access_camera(&self) -> Result<BrokerResponse<()>> {
        self.camera.access().await
    }

    async fn open_remote(&self, session: Option<&Self::Session>) -> Result<OwnedFd> {
        match session {
            Some(session) => self.screencast.open_remote(session).await,
            None => self.camera.open_remote().await,
        }
        .map_err(|e| PortalError::pipewire_failed(e.to_string()))
    }

    async fn close_session(&self, session: &Self::Session) -> Result<()> {
        session.close().await?;
        Ok(())
    }
}

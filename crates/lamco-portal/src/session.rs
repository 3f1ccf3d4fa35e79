//! Capability session
//!
//! Runs the broker handshake that ends in a capability-scoped PipeWire file
//! descriptor and tracks the session through its lifecycle:
//!
//! ```text
//! Idle -> Requesting -> Granted -> Connected -> Closed
//!                    \-> Denied ------------------^
//!                    \-> Cancelled ---------------^
//! ```
//!
//! Each broker request registers a fresh [`RequestId`] before it is sent. A
//! response only advances the flow if its id is still pending, so once
//! [`CapabilitySession::cancel`] has run nothing from the old flow can move
//! the session forward.

use ashpd::desktop::screencast::{CursorMode, SourceType as PortalSourceType};
use enumflags2::BitFlags;
use std::fmt;
use std::future::Future;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerResponse, SourceSelection};
use crate::config::{CaptureKind, PortalConfig};
use crate::error::{PortalError, Result};
use crate::request::{PendingRequests, RequestId};

/// Information about a PipeWire stream from the portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// PipeWire node ID
    pub node_id: u32,

    /// Stream position (for multi-monitor)
    pub position: (i32, i32),

    /// Stream size
    pub size: (u32, u32),

    /// Source type (monitor, window, etc.)
    pub source_type: SourceType,
}

/// Source type for streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Monitor,
    Window,
    Virtual,
}

/// Lifecycle state of a [`CapabilitySession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing requested yet
    Idle,
    /// Handshake in progress
    Requesting,
    /// Descriptor acquired, not yet handed to PipeWire
    Granted,
    /// The broker refused or the request failed
    Denied,
    /// Cancelled while requesting
    Cancelled,
    /// The descriptor backs a live PipeWire connection
    Connected,
    /// Released
    Closed,
}

impl SessionState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{Cancelled, Closed, Connected, Denied, Granted, Idle, Requesting};

        matches!(
            (self, next),
            (Idle, Requesting)
                | (Requesting, Granted | Denied | Cancelled)
                | (Granted, Connected | Closed)
                | (Connected | Denied | Cancelled, Closed)
        )
    }

    /// Whether the session can no longer produce a capability
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Cancelled | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A successfully acquired capture capability
///
/// Owns the PipeWire descriptor. Dropping the grant closes it.
pub struct CapabilityGrant {
    kind: CaptureKind,
    fd: OwnedFd,
    node_id: Option<u32>,
    streams: Vec<StreamInfo>,
    cursor_mode: Option<CursorMode>,
    restore_token: Option<String>,
}

impl CapabilityGrant {
    /// What was granted
    pub fn kind(&self) -> CaptureKind {
        self.kind
    }

    /// PipeWire descriptor as raw fd; still owned by the grant
    pub fn pipewire_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Give up ownership of the descriptor
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Node to connect to
    ///
    /// `None` for camera grants, whose nodes are discovered through the
    /// PipeWire registry.
    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    /// Every stream the broker returned
    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    /// Cursor mode the sources were selected with
    pub fn cursor_mode(&self) -> Option<CursorMode> {
        self.cursor_mode
    }

    /// Whether the cursor travels as stream metadata
    pub fn cursor_as_metadata(&self) -> bool {
        matches!(self.cursor_mode, Some(CursorMode::Metadata))
    }

    /// Token for restoring a persisted session
    pub fn restore_token(&self) -> Option<&str> {
        self.restore_token.as_deref()
    }
}

impl fmt::Debug for CapabilityGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityGrant")
            .field("kind", &self.kind)
            .field("fd", &self.fd.as_raw_fd())
            .field("node_id", &self.node_id)
            .field("streams", &self.streams.len())
            .field("cursor_mode", &self.cursor_mode)
            .finish_non_exhaustive()
    }
}

/// Broker handshake for one capture capability
///
/// Sessions are single use: once a session reaches a terminal state, create a
/// new one from the [`PortalManager`](crate::PortalManager).
pub struct CapabilitySession<B: BrokerClient> {
    broker: Arc<B>,
    config: PortalConfig,
    state: RwLock<SessionState>,
    pending: PendingRequests,
    cancel_tx: watch::Sender<bool>,
    broker_session: Mutex<Option<Arc<B::Session>>>,
}

impl<B: BrokerClient> CapabilitySession<B> {
    pub fn new(broker: Arc<B>, config: PortalConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);

        Self {
            broker,
            config,
            state: RwLock::new(SessionState::Idle),
            pending: PendingRequests::new(),
            cancel_tx,
            broker_session: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Run the handshake for `kind`
    ///
    /// Screen capture goes CreateSession, SelectSources, Start and
    /// OpenPipeWireRemote. Camera capture first checks that a camera exists,
    /// then goes AccessCamera and OpenPipeWireRemote. Any non-zero response
    /// ends the flow.
    pub async fn request_access(&self, kind: CaptureKind) -> Result<CapabilityGrant> {
        if kind == CaptureKind::Camera && !self.broker.is_camera_present().await? {
            info!("No camera present, not requesting access");
            return Err(PortalError::ResourceAbsent);
        }

        self.transition(SessionState::Requesting).await?;

        let result = match kind {
            CaptureKind::Screen(types) => self.screen_flow(kind, types).await,
            CaptureKind::Camera => self.camera_flow().await,
        };

        match result {
            Ok(grant) => {
                if self.transition(SessionState::Granted).await.is_err() {
                    // cancelled after the last response arrived
                    return Err(PortalError::Cancelled);
                }
                info!("Capture capability granted: {:?}", grant);
                Ok(grant)
            }
            Err(PortalError::Cancelled) => {
                let _ = self.transition(SessionState::Cancelled).await;
                self.release_broker_session().await;
                Err(PortalError::Cancelled)
            }
            Err(e) => {
                debug!("Capability request failed: {}", e);
                let _ = self.transition(SessionState::Denied).await;
                self.release_broker_session().await;
                Err(e)
            }
        }
    }

    /// Abandon the handshake
    ///
    /// Pending responses are invalidated, the in-flight request returns
    /// [`PortalError::Cancelled`] and any broker session is closed.
    pub async fn cancel(&self) {
        self.cancel_tx.send_replace(true);

        let dropped = self.pending.cancel_all().await;
        debug!("Cancelled {} pending portal requests", dropped);

        {
            let mut state = self.state.write().await;
            if state.can_transition_to(SessionState::Cancelled) {
                *state = SessionState::Cancelled;
            }
        }

        self.release_broker_session().await;
    }

    /// Record that the granted descriptor now backs a PipeWire connection
    pub async fn mark_connected(&self) -> Result<()> {
        self.transition(SessionState::Connected).await
    }

    /// Connect with `connect` and mark the session connected if it succeeds
    ///
    /// On failure the session stays granted and the error is returned as
    /// [`PortalError::PipeWireFailed`].
    pub async fn connect_with<T, E, F>(&self, connect: F) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: fmt::Display,
    {
        let current = self.state().await;
        if !current.can_transition_to(SessionState::Connected) {
            return Err(PortalError::InvalidState {
                from: current,
                to: SessionState::Connected,
            });
        }

        let connection = connect().map_err(|e| PortalError::pipewire_failed(e.to_string()))?;
        self.mark_connected().await?;
        Ok(connection)
    }

    /// Release the session
    ///
    /// The broker session is closed on a best-effort basis.
    pub async fn close(&self) -> Result<()> {
        self.transition(SessionState::Closed).await?;
        self.release_broker_session().await;
        info!("Capability session closed");
        Ok(())
    }

    async fn screen_flow(&self, kind: CaptureKind, types: BitFlags<PortalSourceType>) -> Result<CapabilityGrant> {
        let available = self.broker.available_cursor_modes().await?;
        let cursor_mode = self.config.cursor_mode_for(available);

        let session = self.call("CreateSession", self.broker.create_session()).await?;
        let session = Arc::new(session);
        *self.broker_session.lock().await = Some(Arc::clone(&session));

        let selection = SourceSelection {
            types,
            cursor_mode,
            multiple: self.config.allow_multiple,
            restore_token: self.config.restore_token.clone(),
            persist_mode: self.config.persist_mode,
        };
        self.call("SelectSources", self.broker.select_sources(&session, &selection))
            .await?;
        info!("Sources selected");

        let started = self.call("Start", self.broker.start(&session)).await?;

        let node_id = match started.streams.as_slice() {
            [] => return Err(PortalError::NoStreamsAvailable),
            [only] => only.node_id,
            [.., last] => {
                if !self.config.allow_multiple {
                    warn!(
                        "Received {} streams when one was requested, using the last one",
                        started.streams.len()
                    );
                }
                last.node_id
            }
        };

        let fd = self.broker.open_remote(Some(&session)).await?;
        self.ensure_not_cancelled()?;

        Ok(CapabilityGrant {
            kind,
            fd,
            node_id: Some(node_id),
            streams: started.streams,
            cursor_mode: Some(cursor_mode),
            restore_token: started.restore_token,
        })
    }

    async fn camera_flow(&self) -> Result<CapabilityGrant> {
        self.call("AccessCamera", self.broker.access_camera()).await?;

        let fd = self.broker.open_remote(None).await?;
        self.ensure_not_cancelled()?;

        Ok(CapabilityGrant {
            kind: CaptureKind::Camera,
            fd,
            node_id: None,
            streams: Vec::new(),
            cursor_mode: None,
            restore_token: None,
        })
    }

    /// Issue one correlated broker request
    async fn call<T, F>(&self, step: &str, request: F) -> Result<T>
    where
        F: Future<Output = Result<BrokerResponse<T>>>,
    {
        let id = RequestId::next();
        let mut cancelled = self.cancel_tx.subscribe();
        self.pending.register(id).await;
        debug!("{} request {} sent", step, id);

        let response = tokio::select! {
            biased;
            _ = cancelled.wait_for(|cancelled| *cancelled) => return Err(PortalError::Cancelled),
            response = request => response,
        };

        if !self.pending.complete(id).await {
            return Err(PortalError::Cancelled);
        }

        match response? {
            BrokerResponse::Success(value) => Ok(value),
            BrokerResponse::Denied(code) => {
                warn!("{} denied or cancelled by user (response code {})", step, code);
                Err(PortalError::from_response_code(code))
            }
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if *self.cancel_tx.borrow() {
            Err(PortalError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn transition(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(next) {
            return Err(PortalError::InvalidState { from: *state, to: next });
        }

        debug!("Capability session {} -> {}", *state, next);
        *state = next;
        Ok(())
    }

    async fn release_broker_session(&self) {
        let session = self.broker_session.lock().await.take();
        if let Some(session) = session {
            if let Err(e) = self.broker.close_session(&session).await {
                warn!("Failed to close portal session: {}", e);
            }
        }
    }
}

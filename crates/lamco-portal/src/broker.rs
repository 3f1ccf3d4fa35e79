//! Permission broker abstraction
//!
//! The capability session talks to the desktop permission broker only through
//! [`BrokerClient`]. [`DesktopBroker`](crate::DesktopBroker) implements it on
//! top of xdg-desktop-portal; tests drive the session with a scripted broker.

use ashpd::desktop::screencast::{CursorMode, SourceType};
use ashpd::desktop::{PersistMode, ResponseError};
use enumflags2::BitFlags;
use std::os::fd::OwnedFd;

use crate::error::Result;
use crate::session::StreamInfo;

/// Outcome of one broker request
///
/// The broker answers every request with a numeric response code. Zero
/// carries the results; anything else ends the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerResponse<T> {
    /// Response code 0 with its results
    Success(T),

    /// Non-zero response code (1 means the user dismissed the dialog)
    Denied(u32),
}

impl<T> BrokerResponse<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Map the success payload
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> BrokerResponse<U> {
        match self {
            Self::Success(value) => BrokerResponse::Success(f(value)),
            Self::Denied(code) => BrokerResponse::Denied(code),
        }
    }
}

/// Fold an ashpd request outcome into a broker response
///
/// ashpd reports non-zero response codes as errors; they are answers, not
/// failures, so they come back as [`BrokerResponse::Denied`].
pub(crate) fn from_ashpd<T>(result: ashpd::Result<T>) -> Result<BrokerResponse<T>> {
    match result {
        Ok(value) => Ok(BrokerResponse::Success(value)),
        Err(ashpd::Error::Response(ResponseError::Cancelled)) => Ok(BrokerResponse::Denied(1)),
        Err(ashpd::Error::Response(ResponseError::Other)) => Ok(BrokerResponse::Denied(2)),
        Err(e) => Err(e.into()),
    }
}

/// Arguments of a SelectSources request
#[derive(Debug, Clone)]
pub struct SourceSelection {
    pub types: BitFlags<SourceType>,
    pub cursor_mode: CursorMode,
    pub multiple: bool,
    pub restore_token: Option<String>,
    pub persist_mode: PersistMode,
}

/// Results of a successful Start request
#[derive(Debug, Clone, Default)]
pub struct StartedStreams {
    pub streams: Vec<StreamInfo>,
    pub restore_token: Option<String>,
}

/// Client side of the desktop permission broker
///
/// Request methods return the broker's response. The session correlates
/// them with its own pending table. Transport failures come back as `Err`.
#[allow(async_fn_in_trait)]
pub trait BrokerClient {
    /// Broker-side session handle
    type Session;

    /// Cursor modes the screen-cast interface supports
    async fn available_cursor_modes(&self) -> Result<BitFlags<CursorMode>>;

    /// Whether any camera is attached
    async fn is_camera_present(&self) -> Result<bool>;

    /// CreateSession
    async fn create_session(&self) -> Result<BrokerResponse<Self::Session>>;

    /// SelectSources
    async fn select_sources(&self, session: &Self::Session, selection: &SourceSelection) -> Result<BrokerResponse<()>>;

    /// Start; shows the permission dialog
    async fn start(&self, session: &Self::Session) -> Result<BrokerResponse<StartedStreams>>;

    /// AccessCamera
    async fn access_camera(&self) -> Result<BrokerResponse<()>>;

    /// OpenPipeWireRemote
    ///
    /// Screen capture passes its session; camera access has none.
    async fn open_remote(&self, session: Option<&Self::Session>) -> Result<OwnedFd>;

    /// Session.Close
    async fn close_session(&self, session: &Self::Session) -> Result<()>;
}

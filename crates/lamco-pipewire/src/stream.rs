//! Capture stream wiring
//!
//! Connects one PipeWire stream to the negotiator, catalog and exchange loop
//! of a session. The per-stream state sits behind a `parking_lot::Mutex`
//! shared between the loop thread (callbacks) and the application (stream
//! handle queries and rendering).

use libspa::param::ParamType;
use libspa::pod::Pod;
use libspa::utils::Direction;
use parking_lot::Mutex;
use pipewire::core::Core;
use pipewire::properties::properties;
use pipewire::stream::{Stream, StreamFlags, StreamListener, StreamRef};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::ModifierTable;
use crate::consumer::FrameConsumer;
use crate::error::{PipeWireError, Result};
use crate::exchange::{BufferExchange, ProcessOutcome};
use crate::ffi::PwBufferQueue;
use crate::negotiator::{FormatEvent, StreamNegotiator};
use crate::pod::{counter_params, proposal_params};
use crate::pw_thread::{LiveStream, StreamBuilder};

/// What the stream captures, announced as `media.role`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaRole {
    Screen,
    Camera,
}

impl MediaRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screen => "Screen",
            Self::Camera => "Camera",
        }
    }
}

/// Stream state as reported by the producer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    Error(String),
}

impl From<&pipewire::stream::StreamState> for StreamState {
    fn from(state: &pipewire::stream::StreamState) -> Self {
        use pipewire::stream::StreamState as Pw;
        match state {
            Pw::Unconnected => Self::Unconnected,
            Pw::Connecting => Self::Connecting,
            Pw::Paused => Self::Paused,
            Pw::Streaming => Self::Streaming,
            Pw::Error(message) => Self::Error(message.clone()),
        }
    }
}

/// Per-stream state
pub(crate) struct StreamShared<C> {
    pub(crate) consumer: C,
    pub(crate) negotiator: StreamNegotiator,
    pub(crate) catalog: ModifierTable,
    pub(crate) exchange: BufferExchange,
    pub(crate) state: StreamState,
    /// Whether the stream should be running, restored after each format
    pub(crate) active: bool,
}

pub(crate) type SharedStream<C> = Arc<Mutex<StreamShared<C>>>;

impl<C: FrameConsumer> StreamShared<C> {
    pub(crate) fn new(consumer: C, negotiator: StreamNegotiator, catalog: ModifierTable) -> Self {
        Self {
            consumer,
            negotiator,
            catalog,
            exchange: BufferExchange::new(),
            state: StreamState::default(),
            active: true,
        }
    }

    /// Commit a producer format and answer with buffer params
    ///
    /// Returns the activity to restore once the lock is released.
    fn on_format(&mut self, stream: &StreamRef, event: &FormatEvent) -> Option<bool> {
        let update = self.negotiator.on_format_event(event)?;

        self.exchange.on_format_changed();
        if let Some(format) = self.negotiator.format() {
            self.consumer.on_format_changed(format);
        }

        let params = match counter_params(&update) {
            Ok(params) => params,
            Err(e) => {
                error!("Failed to build buffer params: {}", e);
                return None;
            }
        };

        let mut pods = params.pods();
        if let Err(e) = stream.update_params(&mut pods) {
            error!("update_params failed: {}", e);
            return None;
        }
        self.negotiator.acknowledge_counter_update();

        Some(self.active)
    }

    fn on_process(&mut self, stream: &StreamRef) {
        let Self { consumer, negotiator, catalog, exchange, .. } = self;
        let mut queue = PwBufferQueue::new(stream);

        if let ProcessOutcome::Renegotiate(offers) = exchange.process(&mut queue, consumer, negotiator, catalog) {
            match proposal_params(&offers) {
                Ok(params) => {
                    let mut pods = params.pods();
                    if let Err(e) = stream.update_params(&mut pods) {
                        error!("Failed to submit renegotiation: {}", e);
                    }
                }
                Err(e) => error!("Failed to build renegotiation params: {}", e),
            }
        }
    }

    fn on_state(&mut self, old: &pipewire::stream::StreamState, new: &pipewire::stream::StreamState) {
        debug!("Stream state {:?} -> {:?}", old, new);
        self.state = StreamState::from(new);

        match new {
            pipewire::stream::StreamState::Streaming => info!("Stream is streaming"),
            pipewire::stream::StreamState::Error(message) => {
                error!("Stream error: {}", message);
                self.consumer.on_stream_stopped();
            }
            pipewire::stream::StreamState::Unconnected => {
                self.negotiator.reset();
                self.exchange.on_format_changed();
                self.consumer.on_stream_stopped();
            }
            _ => {}
        }
    }
}

/// Stream creation parameters
#[derive(Debug, Clone)]
pub(crate) struct StreamOptions {
    pub(crate) name: String,
    pub(crate) node_id: u32,
    pub(crate) role: MediaRole,
}

/// A connected stream, owned by the loop thread
struct PwCaptureStream<C: 'static> {
    // Listener before stream: callbacks go away first
    _listener: StreamListener<SharedStream<C>>,
    stream: Stream,
}

impl<C: 'static> LiveStream for PwCaptureStream<C> {
    fn set_active(&self, active: bool) -> Result<()> {
        self.stream.set_active(active).map_err(PipeWireError::from)
    }

    fn disconnect(&self) -> Result<()> {
        self.stream.disconnect().map_err(PipeWireError::from)
    }
}

/// Build a stream on the loop thread and connect it to `options.node_id`
pub(crate) fn stream_builder<C>(options: StreamOptions, shared: SharedStream<C>) -> StreamBuilder
where
    C: FrameConsumer + Send + 'static,
{
    Box::new(move |core: &Core| -> Result<Box<dyn LiveStream>> {
        let stream = Stream::new(
            core,
            &options.name,
            properties! {
                *pipewire::keys::MEDIA_TYPE => "Video",
                *pipewire::keys::MEDIA_CATEGORY => "Capture",
                *pipewire::keys::MEDIA_ROLE => options.role.as_str(),
            },
        )
        .map_err(|e| PipeWireError::StreamCreationFailed(format!("Failed to create stream: {e}")))?;

        let listener = stream
            .add_local_listener_with_user_data(Arc::clone(&shared))
            .state_changed(|_, shared, old, new| shared.lock().on_state(&old, &new))
            .param_changed(|stream, shared, id, pod| {
                if id != ParamType::Format.as_raw() {
                    return;
                }
                let Some(event) = pod.and_then(FormatEvent::from_pod) else {
                    debug!("Format cleared or unreadable");
                    return;
                };
                let restore = shared.lock().on_format(stream, &event);
                if let Some(active) = restore {
                    if let Err(e) = stream.set_active(active) {
                        warn!("set_active({}) failed: {}", active, e);
                    }
                }
            })
            .process(|stream, shared| shared.lock().on_process(stream))
            .register()
            .map_err(|e| PipeWireError::StreamCreationFailed(format!("Failed to register listener: {e}")))?;

        let params = {
            let shared = shared.lock();
            proposal_params(&shared.negotiator.proposal(&shared.catalog))?
        };
        let mut pods: Vec<&Pod> = params.pods();

        stream
            .connect(
                Direction::Input,
                Some(options.node_id),
                StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
                &mut pods,
            )
            .map_err(|e| PipeWireError::StreamCreationFailed(format!("Failed to connect stream: {e}")))?;

        info!(
            "Stream {} connected to node {} with {} offers",
            options.name,
            options.node_id,
            pods.len()
        );

        Ok(Box::new(PwCaptureStream { _listener: listener, stream }))
    })
}

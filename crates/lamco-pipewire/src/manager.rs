//! Unified PipeWire Manager
//!
//! Provides a single entry point for a capture session that hides the
//! loop thread architecture.
//!
//! # Architecture
//!
//! The manager coordinates:
//! - Thread management (PipeWire objects live on a dedicated loop thread)
//! - Stream lifecycle (creation, activation, destruction)
//! - Camera enumeration and selection
//!
//! Frames are not sent over channels. Each stream hands them to its
//! [`FrameConsumer`] on the loop thread, and the application reaches the
//! consumer through [`StreamHandle::with_consumer`].
//!
//! # Examples
//!
//! ```rust,ignore
//! use lamco_pipewire::{ModifierTable, PipeWireManager, RawFrameConsumer};
//!
//! # async fn example(fd: std::os::fd::BorrowedFd<'_>, node_id: u32) -> Result<(), Box<dyn std::error::Error>> {
//! let mut manager = PipeWireManager::with_default()?;
//!
//! // Connect using the descriptor from lamco-portal
//! manager.connect(Some(fd)).await?;
//!
//! let consumer = RawFrameConsumer::new(MySink::default());
//! let handle = manager
//!     .create_stream(node_id, consumer, ModifierTable::for_raw_frames())
//!     .await?;
//!
//! println!("{}x{}", handle.width(), handle.height());
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::camera::{select_device, CameraDevice, DeviceRegistry, DeviceSelection};
use crate::catalog::ModifierTable;
use crate::config::PipeWireConfig;
use crate::consumer::{FrameConsumer, RenderSurfaceConsumer};
use crate::error::{PipeWireError, Result};
use crate::exchange::ExchangeStats;
use crate::negotiator::{NegotiatedFormat, StreamNegotiator};
use crate::pw_thread::{LoopSender, LoopThread};
use crate::stream::{stream_builder, MediaRole, SharedStream, StreamOptions, StreamShared, StreamState};
use crate::surface::{RenderSink, SurfaceAllocator};

/// Handle to an active stream
///
/// Cheap to clone. All clones see the same stream state.
pub struct StreamHandle<C> {
    id: u32,
    node_id: u32,
    role: MediaRole,
    shared: SharedStream<C>,
    loop_sender: LoopSender,
}

impl<C> Clone for StreamHandle<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node_id: self.node_id,
            role: self.role,
            shared: Arc::clone(&self.shared),
            loop_sender: self.loop_sender.clone(),
        }
    }
}

impl<C> std::fmt::Debug for StreamHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl<C: FrameConsumer> StreamHandle<C> {
    /// Unique stream identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Producer node the stream is connected to
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn role(&self) -> MediaRole {
        self.role
    }

    /// Visible width, 0 until negotiated
    pub fn width(&self) -> u32 {
        self.size().0
    }

    /// Visible height, 0 until negotiated
    pub fn height(&self) -> u32 {
        self.size().1
    }

    /// Crop size while a crop is valid, otherwise the format size
    pub fn size(&self) -> (u32, u32) {
        let shared = self.shared.lock();
        shared.negotiator.frame_size(shared.exchange.crop())
    }

    pub fn is_negotiated(&self) -> bool {
        self.shared.lock().negotiator.is_negotiated()
    }

    /// Last committed format
    pub fn format(&self) -> Option<NegotiatedFormat> {
        self.shared.lock().negotiator.format().copied()
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state.clone()
    }

    pub fn stats(&self) -> ExchangeStats {
        self.shared.lock().exchange.stats().clone()
    }

    /// Toggle cursor drawing
    pub fn set_show_cursor(&self, show: bool) {
        self.shared.lock().consumer.set_cursor_visible(show);
    }

    /// Run `f` with the consumer while the loop thread is kept out
    pub fn with_consumer<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.shared.lock().consumer)
    }

    /// Resume the stream
    pub async fn show(&self) -> Result<()> {
        self.set_active(true).await
    }

    /// Pause the stream without disconnecting
    pub async fn hide(&self) -> Result<()> {
        self.set_active(false).await
    }

    async fn set_active(&self, active: bool) -> Result<()> {
        self.shared.lock().active = active;
        debug!("Stream {} active: {}", self.id, active);
        self.loop_sender.set_active(self.id, active).await
    }
}

impl<A: SurfaceAllocator> StreamHandle<RenderSurfaceConsumer<A>> {
    /// Draw the latest surface and cursor into `sink`
    ///
    /// The crop is only passed on when it actually shrinks the frame.
    pub fn render<R: RenderSink<A::Surface>>(&self, sink: &mut R) {
        let shared = self.shared.lock();
        let crop = shared
            .negotiator
            .format()
            .and_then(|f| shared.exchange.crop().effective(f.width, f.height));
        shared.consumer.render(sink, crop);
    }
}

/// Manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Manager created but not connected
    Disconnected,
    /// Connecting to PipeWire
    Connecting,
    /// Connected and ready
    Connected,
    /// Error state
    Error,
    /// Shutting down
    ShuttingDown,
}

/// Bookkeeping for a stream the manager created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveStream {
    pub id: u32,
    pub node_id: u32,
    pub role: MediaRole,
}

/// Unified PipeWire manager
///
/// This is the primary entry point for a capture session.
/// It manages the loop thread, streams and camera devices.
pub struct PipeWireManager {
    /// Configuration
    config: PipeWireConfig,

    /// Manager state
    state: Arc<RwLock<ManagerState>>,

    /// Loop thread (owns PipeWire's non-Send objects)
    thread: Option<LoopThread>,

    /// Active streams
    streams: Arc<Mutex<HashMap<u32, ActiveStream>>>,

    /// Next stream ID
    next_stream_id: Arc<Mutex<u32>>,

    /// Node globals, fed by the loop thread
    devices: Arc<SyncMutex<DeviceRegistry>>,

    /// Stream currently bound to a selected camera
    camera_stream: Option<ActiveStream>,
}

impl PipeWireManager {
    /// Create manager with default configuration
    pub fn with_default() -> Result<Self> {
        Self::new(PipeWireConfig::default())
    }

    /// Create manager with custom configuration
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use lamco_pipewire::{PipeWireManager, PipeWireConfig};
    ///
    /// let config = PipeWireConfig::builder()
    ///     .target_size(1920, 1080)
    ///     .use_dmabuf(true)
    ///     .build();
    ///
    /// let manager = PipeWireManager::new(config)?;
    /// ```
    pub fn new(config: PipeWireConfig) -> Result<Self> {
        // Validate configuration
        if let Err(issues) = config.validate() {
            return Err(PipeWireError::InvalidParameter(issues.join(", ")));
        }

        info!("Creating PipeWireManager with config: {:?}", config);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ManagerState::Disconnected)),
            thread: None,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_stream_id: Arc::new(Mutex::new(0)),
            devices: Arc::new(SyncMutex::new(DeviceRegistry::new())),
            camera_stream: None,
        })
    }

    /// Connect to PipeWire
    ///
    /// With a descriptor (from `lamco-portal`) the core connects over a
    /// duplicate of it. Without one it connects to the default daemon, which
    /// is what camera enumeration outside the portal uses.
    ///
    /// An initial sync round makes sure the connection is usable before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Already connected
    /// - The loop thread or connection cannot be set up
    /// - The sync round fails or times out
    pub async fn connect(&mut self, fd: Option<BorrowedFd<'_>>) -> Result<()> {
        let current_state = *self.state.read().await;
        if current_state == ManagerState::Connected {
            return Err(PipeWireError::InvalidState("Already connected".to_string()));
        }

        *self.state.write().await = ManagerState::Connecting;
        info!("Connecting to PipeWire (portal fd: {})", fd.is_some());

        let mut thread = LoopThread::create(format!("{}-loop", self.config.stream_name))
            .with_sync_timeout(self.config.sync_timeout);

        let result = async {
            thread.start()?;
            thread.connect(fd).await?;
            thread.sync().await
        }
        .await;

        if let Err(e) = result {
            *self.state.write().await = ManagerState::Error;
            return Err(e);
        }

        self.thread = Some(thread);
        *self.state.write().await = ManagerState::Connected;
        info!("PipeWire connected successfully");

        Ok(())
    }

    /// Create a screen capture stream for a portal node
    pub async fn create_stream<C>(&mut self, node_id: u32, consumer: C, catalog: ModifierTable) -> Result<StreamHandle<C>>
    where
        C: FrameConsumer + Send + 'static,
    {
        self.create_stream_with_role(node_id, MediaRole::Screen, consumer, catalog)
            .await
    }

    /// Create a stream for a node
    ///
    /// The stream offers the formats of `catalog`. DMA-BUF is negotiated only
    /// when both the configuration and the consumer allow it.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Not connected
    /// - Maximum streams exceeded
    /// - Stream creation fails
    pub async fn create_stream_with_role<C>(
        &mut self,
        node_id: u32,
        role: MediaRole,
        mut consumer: C,
        catalog: ModifierTable,
    ) -> Result<StreamHandle<C>>
    where
        C: FrameConsumer + Send + 'static,
    {
        if *self.state.read().await != ManagerState::Connected {
            return Err(PipeWireError::InvalidState("Not connected".to_string()));
        }
        let thread = self.thread()?;

        // Check stream limit
        let stream_count = self.streams.lock().await.len();
        if stream_count >= self.config.max_streams {
            return Err(PipeWireError::TooManyStreams(self.config.max_streams));
        }

        // Generate stream ID
        let stream_id = {
            let mut id = self.next_stream_id.lock().await;
            let sid = *id;
            *id += 1;
            sid
        };

        info!("Creating {:?} stream {} for node {}", role, stream_id, node_id);

        let accept_dmabuf = self.config.use_dmabuf && cfg!(feature = "dmabuf") && consumer.accepts_dmabuf();
        consumer.set_cursor_visible(self.config.show_cursor);

        let negotiator = StreamNegotiator::new(self.config.geometry(), accept_dmabuf);
        let shared = Arc::new(SyncMutex::new(StreamShared::new(consumer, negotiator, catalog)));

        let options = StreamOptions {
            name: format!("{}-{}", self.config.stream_name, stream_id),
            node_id,
            role,
        };

        thread
            .create_stream(stream_id, stream_builder(options, Arc::clone(&shared)))
            .await
            .map_err(|e| match e {
                PipeWireError::StreamCreationFailed(_) => e,
                other => PipeWireError::StreamCreationFailed(format!("Stream creation failed: {other}")),
            })?;

        let active = ActiveStream { id: stream_id, node_id, role };
        self.streams.lock().await.insert(stream_id, active);

        info!("Stream {} created successfully", stream_id);
        Ok(StreamHandle {
            id: stream_id,
            node_id,
            role,
            shared,
            loop_sender: thread.sender()?.clone(),
        })
    }

    /// Remove a stream
    ///
    /// Disconnects the stream on the loop thread and drops it there.
    pub async fn remove_stream(&mut self, stream_id: u32) -> Result<()> {
        info!("Removing stream {}", stream_id);

        if self.streams.lock().await.remove(&stream_id).is_none() {
            return Err(PipeWireError::StreamNotFound(stream_id));
        }

        if self.camera_stream.is_some_and(|s| s.id == stream_id) {
            self.camera_stream = None;
        }

        if let Some(ref thread) = self.thread {
            thread.destroy_stream(stream_id).await?;
        }

        info!("Stream {} removed", stream_id);
        Ok(())
    }

    /// Start tracking node globals
    ///
    /// A sync round follows, so every node that already exists is known when
    /// this returns.
    pub async fn watch_devices(&self) -> Result<()> {
        let thread = self.thread()?;
        thread.watch_devices(Arc::clone(&self.devices)).await?;
        thread.sync().await?;

        info!("Device enumeration complete: {} cameras", self.devices.lock().cameras().len());
        Ok(())
    }

    /// Known camera nodes
    pub fn cameras(&self) -> Vec<CameraDevice> {
        self.devices.lock().cameras()
    }

    /// Stream from the camera whose `node.name` is `name`
    ///
    /// Selecting the camera that is already streaming returns `Ok(None)` and
    /// leaves the stream alone. Selecting another camera tears down the old
    /// stream before the new one is created.
    pub async fn select_device<C>(
        &mut self,
        name: &str,
        consumer: C,
        catalog: ModifierTable,
    ) -> Result<Option<StreamHandle<C>>>
    where
        C: FrameConsumer + Send + 'static,
    {
        let current = self.camera_stream.map(|s| s.node_id);
        let selection = select_device(&self.devices.lock(), name, current);

        match selection {
            DeviceSelection::Unchanged => {
                debug!("Device {} already selected", name);
                Ok(None)
            }
            DeviceSelection::NotFound => Err(PipeWireError::InvalidParameter(format!("Unknown device: {name}"))),
            DeviceSelection::Switch(node_id) => {
                if let Some(old) = self.camera_stream.take() {
                    info!("Switching camera from node {} to {}", old.node_id, node_id);
                    self.remove_stream(old.id).await?;
                }

                let handle = self
                    .create_stream_with_role(node_id, MediaRole::Camera, consumer, catalog)
                    .await?;
                self.camera_stream = Some(ActiveStream { id: handle.id(), node_id, role: MediaRole::Camera });
                Ok(Some(handle))
            }
        }
    }

    /// Stream from the camera named by `config.device_id`
    ///
    /// Without a configured device the first known camera is used.
    pub async fn select_configured_device<C>(
        &mut self,
        consumer: C,
        catalog: ModifierTable,
    ) -> Result<Option<StreamHandle<C>>>
    where
        C: FrameConsumer + Send + 'static,
    {
        let name = match self.config.device_id.clone() {
            Some(name) => name,
            None => self
                .cameras()
                .into_iter()
                .next()
                .map(|camera| camera.name)
                .ok_or_else(|| PipeWireError::InvalidState("No camera available".to_string()))?,
        };

        self.select_device(&name, consumer, catalog).await
    }

    /// Get all active streams
    pub async fn streams(&self) -> Vec<ActiveStream> {
        self.streams.lock().await.values().copied().collect()
    }

    /// Get stream by ID
    pub async fn stream(&self, stream_id: u32) -> Option<ActiveStream> {
        self.streams.lock().await.get(&stream_id).copied()
    }

    /// Get current manager state
    pub async fn state(&self) -> ManagerState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ManagerState::Connected
    }

    /// Get configuration
    pub fn config(&self) -> &PipeWireConfig {
        &self.config
    }

    /// Shutdown the manager
    ///
    /// Stops all streams, waits for a pending sync round, then stops the
    /// loop thread.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down PipeWireManager");
        *self.state.write().await = ManagerState::ShuttingDown;

        // Remove all streams
        let stream_ids: Vec<u32> = self.streams.lock().await.keys().copied().collect();
        for id in stream_ids {
            if let Err(e) = self.remove_stream(id).await {
                warn!("Error removing stream {} during shutdown: {}", id, e);
            }
        }

        if let Some(thread) = self.thread.take() {
            // Waits for a pending sync round, then joins
            tokio::task::spawn_blocking(move || thread.destroy())
                .await
                .map_err(|e| PipeWireError::ThreadCommunicationFailed(format!("loop thread stop: {e}")))??;
        }

        self.devices.lock().clear();
        *self.state.write().await = ManagerState::Disconnected;

        info!("PipeWireManager shutdown complete");
        Ok(())
    }

    fn thread(&self) -> Result<&LoopThread> {
        self.thread
            .as_ref()
            .ok_or_else(|| PipeWireError::InvalidState("Not connected".to_string()))
    }
}

impl Drop for PipeWireManager {
    fn drop(&mut self) {
        debug!("Dropping PipeWireManager");
        // LoopThread stops itself in Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::RawFrameConsumer;
    use crate::cursor::tests::FakeAllocator;
    use crate::negotiator::FormatEvent;
    use crate::surface::{FrameSink, RawFrame};
    use libspa::param::video::VideoFormat;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct NullSink;

    impl FrameSink for NullSink {
        fn push_frame(&mut self, _frame: &RawFrame<'_>) {}
    }

    fn make_handle<C: FrameConsumer>(consumer: C, rx_alive: bool) -> (StreamHandle<C>, Option<mpsc::Receiver<crate::pw_thread::LoopCommand>>) {
        let (tx, rx) = mpsc::channel();
        let negotiator = StreamNegotiator::new(crate::negotiator::VideoGeometry::default(), false);
        let shared = Arc::new(SyncMutex::new(StreamShared::new(consumer, negotiator, ModifierTable::for_raw_frames())));

        let handle = StreamHandle {
            id: 3,
            node_id: 42,
            role: MediaRole::Screen,
            shared,
            loop_sender: LoopSender::new(tx),
        };
        (handle, rx_alive.then_some(rx))
    }

    #[test]
    fn test_manager_creation() {
        let manager = PipeWireManager::with_default();
        assert!(manager.is_ok());
    }

    #[test]
    fn test_manager_with_config() {
        let config = PipeWireConfig::builder().stream_name("cam").max_streams(4).build();

        let manager = PipeWireManager::new(config);
        assert!(manager.is_ok());

        let mgr = manager.expect("manager should be created");
        assert_eq!(mgr.config().stream_name, "cam");
        assert_eq!(mgr.config().max_streams, 4);
    }

    #[test]
    fn test_invalid_config() {
        let config = PipeWireConfig {
            max_streams: 0, // Invalid
            ..Default::default()
        };

        let manager = PipeWireManager::new(config);
        assert!(manager.is_err());
    }

    #[tokio::test]
    async fn test_manager_state() {
        let manager = PipeWireManager::with_default().expect("manager");
        assert_eq!(manager.state().await, ManagerState::Disconnected);
        assert!(!manager.is_connected().await);
        assert!(manager.cameras().is_empty());
    }

    #[tokio::test]
    async fn test_create_stream_requires_connection() {
        let mut manager = PipeWireManager::with_default().expect("manager");
        let result = manager
            .create_stream(42, RawFrameConsumer::new(NullSink), ModifierTable::for_raw_frames())
            .await;

        assert!(matches!(result, Err(PipeWireError::InvalidState(_))));
        assert!(matches!(manager.watch_devices().await, Err(PipeWireError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_configured_device_without_cameras() {
        let mut manager = PipeWireManager::with_default().expect("manager");
        let result = manager
            .select_configured_device(RawFrameConsumer::new(NullSink), ModifierTable::for_raw_frames())
            .await;
        assert!(matches!(result, Err(PipeWireError::InvalidState(_))));

        let config = PipeWireConfig::builder().device_id("v4l2_input.usb-cam").build();
        let mut manager = PipeWireManager::new(config).expect("manager");
        let result = manager
            .select_configured_device(RawFrameConsumer::new(NullSink), ModifierTable::for_raw_frames())
            .await;
        assert!(matches!(result, Err(PipeWireError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_remove_unknown_stream() {
        let mut manager = PipeWireManager::with_default().expect("manager");
        assert!(matches!(manager.remove_stream(7).await, Err(PipeWireError::StreamNotFound(7))));
    }

    #[test]
    fn test_stream_handle_size_follows_negotiation() {
        let (handle, _rx) = make_handle(RawFrameConsumer::new(NullSink), true);
        assert_eq!((handle.width(), handle.height()), (0, 0));

        {
            let mut shared = handle.shared.lock();
            shared.negotiator.on_format_event(&FormatEvent::raw_video(VideoFormat::RGBA, 1280, 720));
        }
        // Format known, counter update not submitted yet
        assert_eq!(handle.width(), 0);
        assert!(!handle.is_negotiated());

        handle.shared.lock().negotiator.acknowledge_counter_update();
        assert_eq!((handle.width(), handle.height()), (1280, 720));
        assert_eq!(handle.format().map(|f| f.width), Some(1280));
    }

    #[test]
    fn test_render_handle_cursor_toggle() {
        let consumer = RenderSurfaceConsumer::new(FakeAllocator::default());
        let (handle, _rx) = make_handle(consumer, true);

        handle.set_show_cursor(false);
        assert!(!handle.with_consumer(|c| c.cursor().is_visible()));

        handle.set_show_cursor(true);
        assert!(handle.with_consumer(|c| c.cursor().is_visible()));
    }

    #[test]
    fn test_stream_handle_clone_shares_state() {
        let (handle, _rx) = make_handle(RawFrameConsumer::new(NullSink), true);
        let clone = handle.clone();

        handle.with_consumer(|_| ());
        assert_eq!(clone.id(), 3);
        assert_eq!(clone.node_id(), 42);
        assert!(Arc::ptr_eq(&handle.shared, &clone.shared));
    }

    #[tokio::test]
    async fn test_hide_without_loop_thread() {
        let (handle, _) = make_handle(RawFrameConsumer::new(NullSink), false);

        let err = tokio_test::assert_err!(handle.hide().await);
        assert!(matches!(err, PipeWireError::ThreadCommunicationFailed(_)));
        assert!(!handle.shared.lock().active);
    }

    #[tokio::test]
    async fn test_shutdown_without_connection() {
        let mut manager = PipeWireManager::with_default().expect("manager");
        tokio_test::assert_ok!(manager.shutdown().await);
        assert_eq!(manager.state().await, ManagerState::Disconnected);
    }

    #[tokio::test]
    #[ignore] // Requires PipeWire daemon
    async fn test_live_shutdown_on_current_thread_runtime() {
        let mut manager = PipeWireManager::with_default().expect("manager");
        manager.connect(None).await.expect("connect");

        let ticker = tokio::spawn(async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        });

        let result = tokio::time::timeout(Duration::from_secs(5), manager.shutdown()).await;
        assert!(matches!(result, Ok(Ok(()))));
        tokio_test::assert_ok!(ticker.await);
        assert_eq!(manager.state().await, ManagerState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires PipeWire daemon
    async fn test_live_device_enumeration() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut manager = PipeWireManager::with_default().expect("manager");
        manager.connect(None).await.expect("connect");
        manager.watch_devices().await.expect("watch devices");

        for camera in manager.cameras() {
            println!("{}: {} ({})", camera.id, camera.description, camera.name);
        }

        manager.shutdown().await.expect("shutdown");
    }
}

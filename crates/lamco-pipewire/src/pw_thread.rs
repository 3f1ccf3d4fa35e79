//! PipeWire loop thread
//!
//! PipeWire objects are not `Send`. A dedicated thread owns the main loop,
//! context, core, registry and every stream, and the rest of the crate talks
//! to it through [`LoopCommand`]s. The thread iterates the loop, then drains
//! pending commands, so every producer-facing call happens on it.
//!
//! # Sync rounds
//!
//! [`LoopThread::sync`] asks the core for a round trip and blocks (on a
//! blocking task) until the core reports `done` for exactly that sequence
//! number, reports an error, or the configured timeout passes.

use futures::channel::oneshot;
use libspa::utils::dict::DictRef;
use nix::fcntl::{fcntl, FcntlArg};
use parking_lot::{Condvar, Mutex};
use pipewire::context::Context;
use pipewire::core::{Core, PW_ID_CORE};
use pipewire::main_loop::MainLoop;
use pipewire::registry::Registry;
use pipewire::types::ObjectType;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::camera::DeviceRegistry;
use crate::error::{PipeWireError, Result};

/// How long one loop iteration may block before commands are drained
const ITERATE_TIMEOUT: Duration = Duration::from_millis(10);

/// Lowest descriptor number handed out for duplicates
const MIN_DUP_FD: i32 = 3;

/// A stream living on the loop thread
pub(crate) trait LiveStream {
    fn set_active(&self, active: bool) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
}

/// Builds a stream on the loop thread
pub(crate) type StreamBuilder = Box<dyn FnOnce(&Core) -> Result<Box<dyn LiveStream>> + Send>;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands for the loop thread
pub(crate) enum LoopCommand {
    Connect { fd: Option<OwnedFd>, reply: Reply<()> },
    Disconnect { reply: Reply<()> },
    CreateStream { stream_id: u32, builder: StreamBuilder, reply: Reply<()> },
    SetActive { stream_id: u32, active: bool, reply: Reply<()> },
    DestroyStream { stream_id: u32, reply: Reply<()> },
    WatchDevices { registry: Arc<Mutex<DeviceRegistry>>, reply: Reply<()> },
    Sync { reply: Reply<i32> },
    Shutdown,
}

#[derive(Debug, Default)]
struct SyncState {
    pending: Option<i32>,
    completed: Option<i32>,
    error: Option<String>,
}

/// Core round-trip tracking shared with the loop thread
#[derive(Debug, Default)]
pub(crate) struct SyncPoint {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl SyncPoint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A sync with `seq` was issued
    pub(crate) fn begin(&self, seq: i32) {
        let mut state = self.state.lock();
        state.pending = Some(seq);
        state.error = None;
    }

    /// Core reported `done`, only the pending seq counts
    pub(crate) fn complete(&self, seq: i32) -> bool {
        let mut state = self.state.lock();
        if state.pending != Some(seq) {
            debug!("Ignoring stale sync seq {} (pending {:?})", seq, state.pending);
            return false;
        }

        state.pending = None;
        state.completed = Some(seq);
        self.cond.notify_all();
        true
    }

    /// Core reported an error, wakes every waiter
    pub(crate) fn fail(&self, message: &str) {
        let mut state = self.state.lock();
        state.error = Some(message.to_string());
        state.pending = None;
        self.cond.notify_all();
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Block until `seq` completes
    pub(crate) fn wait(&self, seq: i32, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.completed == Some(seq) {
                return Ok(());
            }
            if let Some(ref message) = state.error {
                return Err(PipeWireError::SyncFailed(message.clone()));
            }
            if state.pending != Some(seq) {
                return Err(PipeWireError::SyncFailed(format!("sync {seq} was superseded")));
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() && state.completed != Some(seq) {
                        return Err(PipeWireError::Timeout);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Block until no sync is pending
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        while state.pending.is_some() {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() && state.pending.is_some() {
                        return Err(PipeWireError::Timeout);
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        Ok(())
    }
}

/// Cloneable command path into the loop thread
#[derive(Clone)]
pub(crate) struct LoopSender {
    commands: mpsc::Sender<LoopCommand>,
}

impl LoopSender {
    pub(crate) fn new(commands: mpsc::Sender<LoopCommand>) -> Self {
        Self { commands }
    }

    async fn request<T>(&self, what: &str, command: impl FnOnce(Reply<T>) -> LoopCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PipeWireError::thread_gone(what))?;
        response.await.map_err(|_| PipeWireError::thread_gone(what))?
    }

    pub(crate) async fn set_active(&self, stream_id: u32, active: bool) -> Result<()> {
        self.request("set active", |reply| LoopCommand::SetActive { stream_id, active, reply })
            .await
    }

    fn shutdown(&self) {
        let _ = self.commands.send(LoopCommand::Shutdown);
    }
}

/// Handle to the loop thread
///
/// # Lifecycle
///
/// [`create`](Self::create) → [`start`](Self::start) →
/// [`connect`](Self::connect) → … → [`stop`](Self::stop) or
/// [`destroy`](Self::destroy). Dropping a running thread stops it.
pub struct LoopThread {
    name: String,
    commands: Option<LoopSender>,
    handle: Option<JoinHandle<()>>,
    sync: Arc<SyncPoint>,
    sync_timeout: Option<Duration>,
}

impl LoopThread {
    /// Create a stopped loop thread
    pub fn create(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: None,
            handle: None,
            sync: Arc::new(SyncPoint::new()),
            sync_timeout: None,
        }
    }

    /// Bound sync rounds, `None` waits forever
    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Spawn the thread and create the main loop and context
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(PipeWireError::InvalidState(format!("{} already started", self.name)));
        }

        let (commands_tx, commands_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let sync = Arc::clone(&self.sync);

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_loop(commands_rx, sync, ready_tx))
            .map_err(|e| PipeWireError::InitializationFailed(format!("Failed to spawn loop thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PipeWireError::thread_gone("start"));
            }
        }

        self.commands = Some(LoopSender::new(commands_tx));
        self.handle = Some(handle);
        info!("Loop thread {} started", self.name);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Connect the core
    ///
    /// With a descriptor the core connects over a close-on-exec duplicate,
    /// so the caller keeps ownership of its own.
    pub async fn connect(&self, fd: Option<BorrowedFd<'_>>) -> Result<()> {
        let fd = fd.map(duplicate_fd).transpose()?;
        self.request("connect", |reply| LoopCommand::Connect { fd, reply }).await
    }

    /// Disconnect the core, dropping all streams
    pub async fn disconnect(&self) -> Result<()> {
        self.request("disconnect", |reply| LoopCommand::Disconnect { reply }).await
    }

    /// Round trip to the core
    pub async fn sync(&self) -> Result<()> {
        let seq = self.request("sync", |reply| LoopCommand::Sync { reply }).await?;
        debug!("Waiting for sync seq {}", seq);

        let sync = Arc::clone(&self.sync);
        let timeout = self.sync_timeout;
        tokio::task::spawn_blocking(move || sync.wait(seq, timeout))
            .await
            .map_err(|e| PipeWireError::ThreadCommunicationFailed(format!("sync wait: {e}")))?
    }

    pub(crate) async fn create_stream(&self, stream_id: u32, builder: StreamBuilder) -> Result<()> {
        self.request("create stream", |reply| LoopCommand::CreateStream { stream_id, builder, reply })
            .await
    }

    pub(crate) async fn set_active(&self, stream_id: u32, active: bool) -> Result<()> {
        self.sender()?.set_active(stream_id, active).await
    }

    pub(crate) async fn destroy_stream(&self, stream_id: u32) -> Result<()> {
        self.request("destroy stream", |reply| LoopCommand::DestroyStream { stream_id, reply })
            .await
    }

    /// Start feeding node globals into `registry`
    pub async fn watch_devices(&self, registry: Arc<Mutex<DeviceRegistry>>) -> Result<()> {
        self.request("watch devices", |reply| LoopCommand::WatchDevices { registry, reply })
            .await
    }

    /// Stop the thread
    ///
    /// Waits for a pending sync round first, then tears everything down on
    /// the loop thread and joins it.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        if let Err(e) = self.sync.wait_idle(self.sync_timeout) {
            warn!("Stopping {} with a sync round still pending: {}", self.name, e);
        }

        if let Some(commands) = self.commands.take() {
            commands.shutdown();
        }

        handle
            .join()
            .map_err(|_| PipeWireError::ThreadCommunicationFailed(format!("{} panicked", self.name)))?;

        info!("Loop thread {} stopped", self.name);
        Ok(())
    }

    /// Stop and release the thread
    pub fn destroy(mut self) -> Result<()> {
        self.stop()
    }

    /// Command path for stream handles
    pub(crate) fn sender(&self) -> Result<&LoopSender> {
        self.commands
            .as_ref()
            .ok_or_else(|| PipeWireError::InvalidState(format!("{} is not running", self.name)))
    }

    async fn request<T>(&self, what: &str, command: impl FnOnce(Reply<T>) -> LoopCommand) -> Result<T> {
        self.sender()?.request(what, command).await
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping loop thread: {}", e);
        }
    }
}

fn duplicate_fd(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(MIN_DUP_FD))
        .map_err(|e| PipeWireError::ConnectionFailed(format!("Failed to duplicate fd: {e}")))?;
    // SAFETY: fcntl returned a fresh descriptor that nothing else owns
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

// ============================================================================
// LOOP THREAD SIDE
// ============================================================================

struct RegistryWatch {
    _listener: pipewire::registry::Listener,
    _registry: Registry,
}

/// Everything that lives while the core is connected
///
/// Field order is drop order.
struct Connection {
    streams: HashMap<u32, Box<dyn LiveStream>>,
    registry: Option<RegistryWatch>,
    _core_listener: pipewire::core::Listener,
    core: Core,
}

impl Connection {
    fn close(mut self, sync: &SyncPoint) {
        for (id, stream) in self.streams.drain() {
            if let Err(e) = stream.disconnect() {
                warn!("Failed to disconnect stream {}: {}", id, e);
            }
        }

        if sync.is_pending() {
            sync.fail("core disconnected");
        }

        debug!("Core connection closed");
    }

    fn stream(&self, stream_id: u32) -> Result<&dyn LiveStream> {
        self.streams
            .get(&stream_id)
            .map(AsRef::as_ref)
            .ok_or(PipeWireError::StreamNotFound(stream_id))
    }
}

fn run_loop(commands: mpsc::Receiver<LoopCommand>, sync: Arc<SyncPoint>, ready: mpsc::SyncSender<Result<()>>) {
    crate::init();

    let (mainloop, context) = match create_loop() {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(e) => {
            error!("Failed to create PipeWire loop: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut connection: Option<Connection> = None;

    'run: loop {
        mainloop.loop_().iterate(ITERATE_TIMEOUT);

        loop {
            match commands.try_recv() {
                Ok(LoopCommand::Shutdown) | Err(TryRecvError::Disconnected) => break 'run,
                Ok(command) => handle_command(command, &context, &mut connection, &sync),
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    if let Some(connection) = connection.take() {
        connection.close(&sync);
    }
    drop(context);
    drop(mainloop);

    debug!("Loop thread exiting");
}

fn create_loop() -> Result<(MainLoop, Context)> {
    let mainloop = MainLoop::new(None)
        .map_err(|e| PipeWireError::InitializationFailed(format!("Failed to create main loop: {e}")))?;
    let context = Context::new(&mainloop)
        .map_err(|e| PipeWireError::InitializationFailed(format!("Failed to create context: {e}")))?;
    Ok((mainloop, context))
}

fn handle_command(command: LoopCommand, context: &Context, connection: &mut Option<Connection>, sync: &Arc<SyncPoint>) {
    match command {
        LoopCommand::Connect { fd, reply } => {
            let result = if connection.is_some() {
                Err(PipeWireError::InvalidState("Already connected".to_string()))
            } else {
                connect_core(context, fd, sync).map(|c| *connection = Some(c))
            };
            let _ = reply.send(result);
        }
        LoopCommand::Disconnect { reply } => {
            if let Some(connection) = connection.take() {
                connection.close(sync);
            }
            let _ = reply.send(Ok(()));
        }
        LoopCommand::CreateStream { stream_id, builder, reply } => {
            let result = connected(connection).and_then(|conn| {
                if conn.streams.contains_key(&stream_id) {
                    return Err(PipeWireError::InvalidParameter(format!("Stream {stream_id} already exists")));
                }
                let stream = builder(&conn.core)?;
                conn.streams.insert(stream_id, stream);
                Ok(())
            });
            let _ = reply.send(result);
        }
        LoopCommand::SetActive { stream_id, active, reply } => {
            let result = connected(connection).and_then(|conn| conn.stream(stream_id)?.set_active(active));
            let _ = reply.send(result);
        }
        LoopCommand::DestroyStream { stream_id, reply } => {
            let result = connected(connection).and_then(|conn| {
                let stream = conn.streams.remove(&stream_id).ok_or(PipeWireError::StreamNotFound(stream_id))?;
                stream.disconnect()
            });
            let _ = reply.send(result);
        }
        LoopCommand::WatchDevices { registry, reply } => {
            let result = connected(connection).and_then(|conn| {
                if conn.registry.is_none() {
                    conn.registry = Some(watch_registry(&conn.core, registry)?);
                }
                Ok(())
            });
            let _ = reply.send(result);
        }
        LoopCommand::Sync { reply } => {
            let result = connected(connection).and_then(|conn| {
                let seq = conn
                    .core
                    .sync(0)
                    .map_err(|e| PipeWireError::SyncFailed(format!("core sync failed: {e}")))?
                    .seq();
                sync.begin(seq);
                Ok(seq)
            });
            let _ = reply.send(result);
        }
        LoopCommand::Shutdown => {}
    }
}

fn connected(connection: &mut Option<Connection>) -> Result<&mut Connection> {
    connection
        .as_mut()
        .ok_or_else(|| PipeWireError::InvalidState("Not connected".to_string()))
}

fn connect_core(context: &Context, fd: Option<OwnedFd>, sync: &Arc<SyncPoint>) -> Result<Connection> {
    let core = match fd {
        Some(fd) => context.connect_fd(fd, None),
        None => context.connect(None),
    }
    .map_err(|e| PipeWireError::ConnectionFailed(format!("Failed to connect core: {e}")))?;

    let done_sync = Arc::clone(sync);
    let error_sync = Arc::clone(sync);

    let listener = core
        .add_listener_local()
        .done(move |id, seq| {
            if id == PW_ID_CORE {
                done_sync.complete(seq.seq());
            }
        })
        .error(move |id, seq, res, message| {
            if res == -libc::EPIPE {
                error!("PipeWire connection lost: {}", message);
            } else {
                error!("PipeWire error on object {} (seq {}, res {}): {}", id, seq, res, message);
            }
            if id == PW_ID_CORE {
                error_sync.fail(message);
            }
        })
        .register();

    info!("PipeWire core connected");

    Ok(Connection {
        streams: HashMap::new(),
        registry: None,
        _core_listener: listener,
        core,
    })
}

fn watch_registry(core: &Core, devices: Arc<Mutex<DeviceRegistry>>) -> Result<RegistryWatch> {
    let registry = core
        .get_registry()
        .map_err(|e| PipeWireError::ConnectionFailed(format!("Failed to get registry: {e}")))?;

    let removed = Arc::clone(&devices);
    let listener = registry
        .add_listener_local()
        .global(move |global| {
            if global.type_ != ObjectType::Node {
                return;
            }
            let props = global.props;
            devices.lock().add(
                global.id,
                prop(props, "node.name"),
                prop(props, "node.description"),
                prop(props, "media.class"),
            );
        })
        .global_remove(move |id| {
            removed.lock().remove(id);
        })
        .register();

    debug!("Watching registry for nodes");

    Ok(RegistryWatch { _listener: listener, _registry: registry })
}

fn prop<'a>(props: Option<&'a DictRef>, key: &str) -> Option<&'a str> {
    props.and_then(|p| p.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_completes_exact_seq() {
        let sync = SyncPoint::new();
        sync.begin(5);

        assert!(!sync.complete(4));
        assert!(sync.is_pending());
        assert!(sync.complete(5));
        assert!(!sync.is_pending());
        assert!(sync.wait(5, Some(Duration::from_millis(10))).is_ok());
    }

    #[test]
    fn test_sync_timeout() {
        let sync = SyncPoint::new();
        sync.begin(1);

        let err = sync.wait(1, Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, PipeWireError::Timeout));
    }

    #[test]
    fn test_sync_error_wakes_waiter() {
        let sync = Arc::new(SyncPoint::new());
        sync.begin(9);

        let waiter = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || sync.wait(9, None))
        };

        std::thread::sleep(Duration::from_millis(20));
        sync.fail("broken pipe");

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PipeWireError::SyncFailed(ref m)) if m == "broken pipe"));
    }

    #[test]
    fn test_sync_completion_from_other_thread() {
        let sync = Arc::new(SyncPoint::new());
        sync.begin(3);

        let completer = {
            let sync = Arc::clone(&sync);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                sync.complete(2);
                sync.complete(3);
            })
        };

        assert!(sync.wait(3, None).is_ok());
        completer.join().unwrap();
    }

    #[test]
    fn test_sync_superseded() {
        let sync = SyncPoint::new();
        sync.begin(1);
        sync.begin(2);

        assert!(matches!(sync.wait(1, None), Err(PipeWireError::SyncFailed(_))));
    }

    #[test]
    fn test_wait_idle() {
        let sync = SyncPoint::new();
        assert!(sync.wait_idle(None).is_ok());

        sync.begin(1);
        assert!(matches!(sync.wait_idle(Some(Duration::from_millis(10))), Err(PipeWireError::Timeout)));

        sync.complete(1);
        assert!(sync.wait_idle(None).is_ok());
    }

    #[tokio::test]
    async fn test_requests_need_running_thread() {
        let thread = LoopThread::create("test-loop");
        assert!(!thread.is_running());

        let err = thread.sync().await.unwrap_err();
        assert!(matches!(err, PipeWireError::InvalidState(_)));
    }

    #[test]
    fn test_stop_without_start() {
        let mut thread = LoopThread::create("test-loop");
        assert!(thread.stop().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires PipeWire daemon
    async fn test_live_connect_and_sync() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut thread = LoopThread::create("test-loop").with_sync_timeout(Some(Duration::from_secs(5)));
        thread.start().expect("start");
        thread.connect(None).await.expect("connect");
        thread.sync().await.expect("sync");

        let devices = Arc::new(Mutex::new(DeviceRegistry::new()));
        thread.watch_devices(Arc::clone(&devices)).await.expect("watch");
        thread.sync().await.expect("sync");
        println!("{} nodes", devices.lock().len());

        thread.stop().expect("stop");
    }
}

/*!
 * Session management for a single HelvarNet router connection.
 *
 * A [`SessionManager`] owns one long-lived transport and three tasks per
 * connection:
 *
 * - a reader that frames inbound bytes into lines, parses them and hands
 *   each decoded [`Command`] to a [`MessageHandler`];
 * - a sender that drains the unbounded FIFO [`SendQueue`];
 * - a keepalive ticker that queues a router-time query and arms a short
 *   watchdog, cancelled by any inbound line.
 *
 * Write failures requeue the in-flight command at the head of the queue and
 * trigger a reconnect. Connect failures are retried after a delay, except
 * for configuration errors and cancelled attempts.
 *
 * Every successful connect starts a new generation. Reconnect requests are
 * tagged with the generation that observed the failure, so when the reader,
 * sender and watchdog all notice the same dead link only one reconnect runs.
 */
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use helvar_core::config::{HelvarConfig, RouterConfig, SessionConfig};
use helvar_core::logging::component_span;
use helvar_core::utils::{box_future, spawn_and_log, with_timeout, BoxFuture};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::command::{Command, CommandType};
use crate::error::{HelvarError, Result};
use crate::framing::LineFramer;
use crate::parser;

/// Read half of a transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line terminator appended to every outbound command
const LINE_ENDING: &[u8] = b"\r\n";

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport
    Disconnected,
    /// A connect attempt is in progress
    Connecting,
    /// Transport open and tasks running
    Connected,
    /// Tearing down a failed transport before connecting again
    Reconnecting,
}

/// Connectivity status reported to the outside world
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Connected to the router
    Online,
    /// Disconnected, or about to reconnect
    Offline,
    /// The session cannot start until it is reconfigured
    ConfigurationError(String),
    /// A connect attempt was cancelled; no retry is scheduled
    ConnectingError(String),
    /// Transport failure; a reconnect is scheduled
    CommunicationError(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Online => f.write_str("online"),
            SessionStatus::Offline => f.write_str("offline"),
            SessionStatus::ConfigurationError(msg) => write!(f, "configuration error: {}", msg),
            SessionStatus::ConnectingError(msg) => write!(f, "connecting error: {}", msg),
            SessionStatus::CommunicationError(msg) => write!(f, "communication error: {}", msg),
        }
    }
}

/// Receives connectivity status transitions
pub trait StatusSink: Send + Sync {
    /// Called on every status transition
    fn status_changed(&self, status: SessionStatus);
}

impl StatusSink for tokio::sync::mpsc::UnboundedSender<SessionStatus> {
    fn status_changed(&self, status: SessionStatus) {
        if self.send(status).is_err() {
            debug!("Status receiver dropped");
        }
    }
}

/// Receives every decoded inbound message, on the reader task
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message
    fn handle_message(&self, command: Command);
}

/// Opens transports to the router
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and return its two halves
    async fn connect(&self, host: &str, port: u16) -> Result<(BoxedReader, BoxedWriter)>;
}

/// Plain TCP transport
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<(BoxedReader, BoxedWriter)> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            HelvarError::communication(format!("Failed to connect to {}:{}: {}", host, port, e))
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Unbounded FIFO of outbound commands
#[derive(Debug, Default)]
pub struct SendQueue {
    items: Mutex<VecDeque<Command>>,
    notify: Notify,
}

impl SendQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<Command>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command
    pub fn push_back(&self, command: Command) {
        self.items().push_back(command);
        self.notify.notify_one();
    }

    /// Put a command back at the head of the queue
    pub fn push_front(&self, command: Command) {
        self.items().push_front(command);
        self.notify.notify_one();
    }

    /// Pop the head of the queue without waiting
    pub fn try_pop(&self) -> Option<Command> {
        self.items().pop_front()
    }

    /// Wait for the next command. Cancel safe: a dropped call never loses a command.
    pub async fn take(&self) -> Command {
        loop {
            if let Some(command) = self.try_pop() {
                return command;
            }
            self.notify.notified().await;
        }
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Copy of the queued commands, head first
    pub fn snapshot(&self) -> Vec<Command> {
        self.items().iter().cloned().collect()
    }
}

/// Cloneable handle for queueing commands
///
/// Stamps the configured protocol version on every command it queues.
#[derive(Debug, Clone)]
pub struct CommandSender {
    queue: Arc<SendQueue>,
    version: Arc<str>,
}

impl CommandSender {
    /// Create a sender over a queue
    pub fn new(queue: Arc<SendQueue>, version: impl Into<Arc<str>>) -> Self {
        Self {
            queue,
            version: version.into(),
        }
    }

    /// Queue a command; it waits in the queue while the session is down
    pub fn send(&self, command: Command) {
        let command = command.with_version(self.version.as_ref());
        trace!("Queueing {}", command);
        self.queue.push_back(command);
    }

    /// The underlying queue
    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.queue
    }
}

/// Timing knobs of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Keepalive period; zero disables keepalive
    pub keepalive_interval: Duration,
    /// Liveness window after each keepalive
    pub keepalive_timeout: Duration,
    /// Delay before retrying a failed connect
    pub reconnect_delay: Duration,
    /// Upper bound for a connect attempt
    pub connect_timeout: Duration,
    /// Pause between writes
    pub send_delay: Option<Duration>,
    /// How long teardown waits for an in-flight write
    pub shutdown_grace: Duration,
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval(),
            keepalive_timeout: config.keepalive_timeout(),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            send_delay: config.send_delay(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

#[derive(Default)]
struct Lifecycle {
    generation: u64,
    shutdown: Option<watch::Sender<bool>>,
    reader: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct SessionInner {
    router: RouterConfig,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    queue: Arc<SendQueue>,
    sender: CommandSender,
    handler: Arc<dyn MessageHandler>,
    status: Arc<dyn StatusSink>,
    state: watch::Sender<SessionState>,
    lifecycle: AsyncMutex<Lifecycle>,
    generation: AtomicU64,
    reconnect_requested: AtomicU64,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    // command taken by the sender and not yet fully written
    in_flight: Mutex<Option<Command>>,
    cancel_connect: Notify,
}

/// Manages the connection to one router
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("host", &self.inner.router.host)
            .field("port", &self.inner.router.port)
            .field("state", &self.state())
            .field("queued", &self.inner.queue.len())
            .finish()
    }
}

impl SessionManager {
    /// Create a session from configuration
    pub fn new(
        config: &HelvarConfig,
        queue: Arc<SendQueue>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MessageHandler>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self::with_options(
            config.router.clone(),
            SessionOptions::from(&config.session),
            queue,
            connector,
            handler,
            status,
        )
    }

    /// Create a session with explicit timing options
    pub fn with_options(
        router: RouterConfig,
        options: SessionOptions,
        queue: Arc<SendQueue>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MessageHandler>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let sender = CommandSender::new(queue.clone(), router.protocol_version.as_str());
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                router,
                options,
                connector,
                queue,
                sender,
                handler,
                status,
                state,
                lifecycle: AsyncMutex::new(Lifecycle::default()),
                generation: AtomicU64::new(0),
                reconnect_requested: AtomicU64::new(0),
                watchdog: Mutex::new(None),
                in_flight: Mutex::new(None),
                cancel_connect: Notify::new(),
            }),
        }
    }

    /// Open the connection. A no-op when already connected.
    pub fn connect(&self) -> BoxFuture<Result<()>> {
        SessionInner::connect(self.inner.clone())
    }

    /// Close the connection, cancel timers and stop all tasks.
    /// An in-progress connect attempt is cancelled.
    pub fn disconnect(&self) -> BoxFuture<()> {
        SessionInner::disconnect(self.inner.clone())
    }

    /// Queue a command for transmission
    pub fn send_command(&self, command: Command) {
        self.inner.sender.send(command);
    }

    /// Handle for queueing commands
    pub fn sender(&self) -> CommandSender {
        self.inner.sender.clone()
    }

    /// The outbound queue
    pub fn queue(&self) -> &Arc<SendQueue> {
        &self.inner.queue
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    fn report(&self, status: SessionStatus) {
        info!("Router {} is {}", self.describe(), status);
        self.status.status_changed(status);
    }

    fn describe(&self) -> String {
        format!(
            "{}:{}",
            self.router.host.as_deref().unwrap_or("<unset>"),
            self.router.port
        )
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn connect(self: Arc<Self>) -> BoxFuture<Result<()>> {
        box_future(async move {
            let mut lifecycle = self.lifecycle.lock().await;
            if self.state() == SessionState::Connected {
                debug!("Already connected to {}", self.describe());
                return Ok(());
            }
            self.teardown(&mut lifecycle).await;
            self.establish(&mut lifecycle).await
        })
    }

    fn retry_connect(self: Arc<Self>, generation: u64) -> BoxFuture<Result<()>> {
        box_future(async move {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.generation != generation || self.state() == SessionState::Connected {
                debug!("Dropping stale connect retry");
                return Ok(());
            }
            self.establish(&mut lifecycle).await
        })
    }

    fn reconnect(self: Arc<Self>, generation: u64) -> BoxFuture<Result<()>> {
        box_future(async move {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.generation != generation {
                debug!("Ignoring reconnect request from stale connection");
                return Ok(());
            }
            info!("Reconnecting to {}", self.describe());
            self.set_state(SessionState::Reconnecting);
            self.report(SessionStatus::Offline);
            self.teardown(&mut lifecycle).await;
            self.establish(&mut lifecycle).await
        })
    }

    fn disconnect(self: Arc<Self>) -> BoxFuture<()> {
        box_future(async move {
            self.cancel_connect.notify_waiters();
            let mut lifecycle = self.lifecycle.lock().await;
            let was_connected = self.state() == SessionState::Connected;
            self.teardown(&mut lifecycle).await;
            self.set_state(SessionState::Disconnected);
            if was_connected {
                self.report(SessionStatus::Offline);
            }
            info!("Disconnected from {}", self.describe());
        })
    }

    /// Ask for a reconnect from a detached task, so the caller can be aborted
    /// by the teardown that the reconnect performs.
    fn request_reconnect(self: &Arc<Self>, generation: u64, reason: String) {
        if !self.is_current(generation) {
            debug!("Ignoring failure of stale connection: {}", reason);
            return;
        }
        if self.reconnect_requested.swap(generation, Ordering::SeqCst) == generation {
            debug!("Reconnect already requested, ignoring: {}", reason);
            return;
        }
        self.set_state(SessionState::Reconnecting);
        self.report(SessionStatus::CommunicationError(reason));
        spawn_and_log("helvar reconnect", self.clone().reconnect(generation));
    }

    async fn establish(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> Result<()> {
        let host = match self.router.require_host() {
            Ok(host) => host.to_string(),
            Err(e) => {
                error!("Cannot connect: {}", e);
                self.set_state(SessionState::Disconnected);
                self.report(SessionStatus::ConfigurationError(e.to_string()));
                return Err(HelvarError::configuration(e.to_string()));
            }
        };
        let port = self.router.port;

        self.set_state(SessionState::Connecting);
        info!("Connecting to Helvar router at {}:{}", host, port);

        let cancelled = self.cancel_connect.notified();
        let attempt = with_timeout(self.options.connect_timeout, async {
            Ok(self.connector.connect(&host, port).await)
        });
        let outcome = tokio::select! {
            outcome = attempt => outcome.map_err(HelvarError::from).and_then(|r| r),
            _ = cancelled => {
                warn!("Connect attempt to {}:{} was cancelled", host, port);
                self.set_state(SessionState::Disconnected);
                self.report(SessionStatus::ConnectingError("connect attempt cancelled".to_string()));
                return Err(HelvarError::communication("connect attempt cancelled"));
            }
        };

        let (reader, writer) = match outcome {
            Ok(halves) => halves,
            Err(e) => {
                warn!("Failed to connect to {}:{}: {}", host, port, e);
                self.set_state(SessionState::Disconnected);
                if e.is_retryable() {
                    self.report(SessionStatus::CommunicationError(e.to_string()));
                    self.schedule_retry(lifecycle);
                } else {
                    self.report(SessionStatus::ConnectingError(e.to_string()));
                }
                return Err(e);
            }
        };

        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        self.generation.store(generation, Ordering::SeqCst);

        self.set_state(SessionState::Connected);
        self.report(SessionStatus::Online);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = component_span("helvar-session", Some(&host));

        lifecycle.reader = Some(tokio::spawn(
            run_reader(self.clone(), generation, reader, shutdown_rx.clone()).instrument(span.clone()),
        ));
        lifecycle.sender = Some(tokio::spawn(
            run_sender(self.clone(), generation, writer, shutdown_rx.clone()).instrument(span.clone()),
        ));
        if !self.options.keepalive_interval.is_zero() {
            lifecycle.keepalive = Some(tokio::spawn(
                run_keepalive(self.clone(), generation, shutdown_rx).instrument(span),
            ));
        }
        lifecycle.shutdown = Some(shutdown_tx);

        // first round trip doubles as a liveness check
        self.sender.send(Command::new(CommandType::QueryRouterTime));
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
        if let Some(retry) = lifecycle.retry.take() {
            retry.abort();
        }
        let generation = lifecycle.generation;
        let delay = self.options.reconnect_delay;
        let inner = self.clone();
        info!("Retrying connection to {} in {:?}", self.describe(), delay);
        lifecycle.retry = Some(tokio::spawn(async move {
            sleep(delay).await;
            spawn_and_log("helvar connect retry", inner.retry_connect(generation));
        }));
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle) {
        lifecycle.generation += 1;
        self.generation.store(lifecycle.generation, Ordering::SeqCst);

        if let Some(retry) = lifecycle.retry.take() {
            retry.abort();
        }
        self.cancel_watchdog();
        if let Some(keepalive) = lifecycle.keepalive.take() {
            keepalive.abort();
        }
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(reader) = lifecycle.reader.take() {
            reader.abort();
        }
        if let Some(mut sender) = lifecycle.sender.take() {
            if timeout(self.options.shutdown_grace, &mut sender).await.is_err() {
                warn!("Sender did not stop within {:?}, aborting", self.options.shutdown_grace);
                sender.abort();
                let _ = sender.await;
            }
        }
        self.requeue_in_flight();
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, Option<Command>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put an interrupted write back at the head of the queue
    fn requeue_in_flight(&self) {
        let command = self.in_flight().take();
        if let Some(command) = command {
            debug!("Requeueing interrupted {}", command);
            self.queue.push_front(command);
        }
    }

    fn arm_watchdog(self: &Arc<Self>, generation: u64) {
        let mut watchdog = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
        if watchdog.as_ref().map_or(false, |task| !task.is_finished()) {
            trace!("Keepalive watchdog already armed");
            return;
        }
        let inner = self.clone();
        let window = self.options.keepalive_timeout;
        *watchdog = Some(tokio::spawn(async move {
            sleep(window).await;
            warn!("No response from router within {:?} of keepalive", window);
            inner.request_reconnect(generation, "keepalive timed out".to_string());
        }));
    }

    fn cancel_watchdog(&self) {
        let task = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn on_line(&self, line: &str) {
        self.cancel_watchdog();
        trace!("Received: {}", line);
        match parser::parse(line) {
            Ok(command) => self.handler.handle_message(command),
            Err(e) => debug!("Skipping line: {}", e),
        }
    }
}

async fn run_reader(
    inner: Arc<SessionInner>,
    generation: u64,
    mut reader: BoxedReader,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framer = LineFramer::new();
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => return,
            read = reader.read_buf(framer.buffer_mut()) => read,
        };
        match read {
            Ok(0) => {
                if let Some(line) = framer.finish() {
                    inner.on_line(&line);
                }
                warn!("Connection closed by router");
                inner.request_reconnect(generation, "connection closed by router".to_string());
                return;
            }
            Ok(_) => {
                while let Some(line) = framer.next_frame() {
                    inner.on_line(&line);
                }
            }
            Err(e) => {
                warn!("Read failed: {}", e);
                inner.request_reconnect(generation, format!("read failed: {}", e));
                return;
            }
        }
    }
}

async fn write_line(writer: &mut BoxedWriter, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(LINE_ENDING).await?;
    writer.flush().await
}

async fn run_sender(
    inner: Arc<SessionInner>,
    generation: u64,
    mut writer: BoxedWriter,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = inner.queue.take() => command,
        };

        let line = command.to_wire();
        if line.is_empty() {
            warn!("Dropping {} which cannot be transmitted", command);
            continue;
        }

        debug!("Sending: {}", line);
        *inner.in_flight() = Some(command);
        if let Err(e) = write_line(&mut writer, &line).await {
            warn!("Write failed: {}", e);
            inner.requeue_in_flight();
            inner.request_reconnect(generation, format!("write failed: {}", e));
            return;
        }
        inner.in_flight().take();

        if let Some(delay) = inner.options.send_delay {
            sleep(delay).await;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Error closing connection: {}", e);
    }
}

async fn run_keepalive(inner: Arc<SessionInner>, generation: u64, mut shutdown: watch::Receiver<bool>) {
    let period = inner.options.keepalive_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        trace!("Sending keepalive");
        inner.arm_watchdog(generation);
        inner.sender.send(Command::new(CommandType::QueryRouterTime));
    }
}

//! Gateway session state machine
//!
//! A [`Shard`] owns one gateway session across any number of sockets. It
//! identifies or resumes on Hello, heartbeats on the server's interval,
//! classifies close codes into reconnect or teardown, and funnels every
//! outbound frame except identify through a FIFO queue and a fixed send
//! window.

use crate::config::ClientConfig;
use crate::connection::{
    self, command_channel, gateway_url, spawn_writer, Connection, ConnectionCommand, WsSource,
};
use crate::error::{Error, ErrorKind};
use crate::heartbeat::{jitter, HeartbeatMonitor};
use crate::inflate::{Inflater, COMPRESSION_AVAILABLE};
use crate::metrics::Metrics;
use crate::protocol::{
    CloseCode, CloseDisposition, DispatchEvent, GatewayPayload, Hello, Identify,
    IdentifyProperties, OpCode, Ready, Resume, NORMAL_CLOSE_CODE, RESUMABLE_CLOSE_CODE,
};
use crate::queue::Queue;
use crate::Result;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

/// Close code reported when the stream ends without a close frame
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Readiness of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Disconnected,
    Connecting,
    Ready,
    Disconnecting,
}

/// How [`Shard::disconnect`] treats the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectMode {
    /// Forget the session; the next connect identifies. Closes with 1000.
    #[default]
    Reset,
    /// Keep the session; the next connect resumes. Closes with 4000.
    Resumable,
}

/// Events published by a shard
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// Lifecycle diagnostics
    Debug(String),
    /// Every inbound payload, before interpretation
    Raw(GatewayPayload),
    /// A dispatch event
    Dispatch(DispatchEvent),
    /// READY received
    Ready,
    /// RESUMED received
    Resumed,
    /// The socket was dropped and a new one is being opened
    Reconnecting,
    /// The shard has no socket and will not open one on its own
    Disconnected,
    /// Something went wrong
    Error {
        kind: ErrorKind,
        message: String,
        fatal: bool,
    },
}

#[derive(Debug, Default)]
struct Session {
    sequence: Option<u64>,
    session_id: Option<String>,
    resume_url: Option<String>,
    heartbeat: HeartbeatMonitor,
    last_identify: Option<Instant>,
}

impl Session {
    fn resumable(&self) -> bool {
        self.session_id.is_some()
    }

    fn forget(&mut self) {
        self.sequence = None;
        self.session_id = None;
        self.resume_url = None;
    }
}

/// Outbound frame budget: `limit` frames per `period`.
#[derive(Debug)]
struct SendWindow {
    limit: u32,
    period: Duration,
    remaining: u32,
    /// `None` until the first frame of a window is sent
    reset_at: Option<Instant>,
}

impl SendWindow {
    fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            remaining: limit,
            reset_at: None,
        }
    }

    /// Take one frame from the window, or report how long until it refills.
    fn reserve(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        match self.reset_at {
            Some(reset_at) if reset_at > now => {}
            _ => {
                self.remaining = self.limit;
                self.reset_at = Some(now + self.period);
            }
        }

        if self.remaining == 0 {
            let reset_at = self.reset_at.unwrap_or(now);
            return Err(reset_at.saturating_duration_since(now));
        }

        self.remaining -= 1;
        Ok(())
    }

    /// Empty the window for a full period
    fn exhaust(&mut self, now: Instant) {
        self.remaining = 0;
        self.reset_at = Some(now + self.period);
    }

    fn reset(&mut self) {
        self.remaining = self.limit;
        self.reset_at = None;
    }

    /// When an empty window refills, if it is empty at `now`
    fn throttled_until(&self, now: Instant) -> Option<Instant> {
        self.reset_at
            .filter(|reset_at| self.remaining == 0 && *reset_at > now)
    }
}

struct ShardInner {
    id: u32,
    /// `[id, count]` sent on identify when sharding is enabled
    shard_info: Option<[u32; 2]>,
    gateway_url: String,
    config: Arc<ClientConfig>,
    metrics: Arc<Metrics>,
    state: RwLock<ShardState>,
    session: Mutex<Session>,
    window: Mutex<SendWindow>,
    identify_lock: tokio::sync::Mutex<()>,
    queue: Queue<GatewayPayload>,
    connection: Mutex<Option<Connection>>,
    next_connection_id: AtomicU64,
    events: broadcast::Sender<ShardEvent>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ShardEvent>>>,
}

/// One gateway session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Shard {
    /// Create a disconnected shard.
    ///
    /// `shard_info` is `Some([id, count])` when the client is sharded.
    pub fn new(
        id: u32,
        shard_info: Option<[u32; 2]>,
        gateway_url: impl Into<String>,
        config: Arc<ClientConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.connection.event_buffer);
        let window = SendWindow::new(config.connection.send_limit, config.connection.send_window);

        Self {
            inner: Arc::new(ShardInner {
                id,
                shard_info,
                gateway_url: gateway_url.into(),
                metrics,
                state: RwLock::new(ShardState::Disconnected),
                session: Mutex::new(Session::default()),
                window: Mutex::new(window),
                identify_lock: tokio::sync::Mutex::new(()),
                queue: Queue::new(),
                connection: Mutex::new(None),
                next_connection_id: AtomicU64::new(0),
                events,
                listeners: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn state(&self) -> ShardState {
        *self.inner.state.read()
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.inner.session.lock().heartbeat.latency()
    }

    /// Last sequence number received
    pub fn sequence(&self) -> Option<u64> {
        self.inner.session.lock().sequence
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.lock().session_id.clone()
    }

    /// Subscribe to this shard's events. Dropping the receiver unsubscribes.
    ///
    /// The channel holds `event_buffer` events; a receiver that falls
    /// further behind skips the oldest ones. Use [`listen`](Self::listen)
    /// when every event must be seen.
    pub fn subscribe(&self) -> broadcast::Receiver<ShardEvent> {
        self.inner.events.subscribe()
    }

    /// Receive every event from now on, in order, however far the receiver
    /// falls behind. Dropping the receiver unsubscribes.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<ShardEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(tx);
        rx
    }

    /// Open a socket and start a session.
    ///
    /// Resolves once the socket is open; readiness is reported through
    /// [`ShardEvent::Ready`] or [`ShardEvent::Resumed`].
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            if matches!(*state, ShardState::Connecting | ShardState::Ready) {
                return Err(Error::AlreadyConnecting(self.inner.id));
            }
            *state = ShardState::Connecting;
        }

        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connect_failed();
                Err(e)
            }
        }
    }

    /// Send a frame through the send queue and window.
    ///
    /// Identify frames skip the queue and are spaced by the identify delay
    /// instead. Fails with [`Error::NotConnected`] at once when there is no
    /// socket, and with [`Error::Cancelled`] if the session is reset before
    /// the frame is written.
    pub async fn send(&self, payload: GatewayPayload) -> Result<()> {
        if self.inner.connection.lock().is_none() {
            return Err(Error::NotConnected(self.inner.id));
        }
        if payload.opcode() == Some(OpCode::Identify) {
            return self.write_identify(None, payload).await;
        }

        let mut entry = self.inner.queue.add(payload);
        entry.wait().await?;

        loop {
            let reserved = self.inner.window.lock().reserve(Instant::now());
            match reserved {
                Ok(()) => break,
                Err(wait) => {
                    self.inner.metrics.record_send_throttle();
                    self.debug(format!("Send window exhausted, retrying in {:?}", wait));
                    tokio::time::sleep(wait).await;
                    if !entry.is_current() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        let text = serde_json::to_string(entry.value())?;
        let commands = {
            let slot = self.inner.connection.lock();
            if !entry.is_current() {
                return Err(Error::Cancelled);
            }
            slot.as_ref()
                .map(Connection::commands)
                .ok_or(Error::NotConnected(self.inner.id))?
        };

        trace!("[SHARD-{}] Sending op {}", self.inner.id, entry.value().op);
        commands
            .send(ConnectionCommand::Send(Message::Text(text)))
            .await
            .map_err(|_| Error::NotConnected(self.inner.id))?;

        entry.release();
        Ok(())
    }

    /// Ask the gateway for guild members matching `query`
    pub async fn request_guild_members(&self, guild_id: u64, query: &str, limit: u32) -> Result<()> {
        self.send(GatewayPayload::request_guild_members(guild_id, query, limit))
            .await
    }

    /// Close the socket and cancel every queued frame.
    pub fn disconnect(&self, mode: DisconnectMode) {
        let inner = &self.inner;
        let connection = {
            let mut slot = inner.connection.lock();
            inner.queue.clear();
            slot.take()
        };

        let previous = std::mem::replace(&mut *inner.state.write(), ShardState::Disconnecting);

        let resumable = {
            let mut session = inner.session.lock();
            session.heartbeat.reset();
            session.last_identify = None;
            if mode == DisconnectMode::Reset {
                session.forget();
            }
            session.resumable()
        };
        inner.window.lock().reset();

        let had_connection = connection.is_some();
        if let Some(connection) = connection {
            connection.close(if resumable {
                RESUMABLE_CLOSE_CODE
            } else {
                NORMAL_CLOSE_CODE
            });
        }

        *inner.state.write() = ShardState::Disconnected;
        inner.metrics.update_shard(inner.id, |s| s.mark_down());

        if had_connection || previous != ShardState::Disconnected {
            self.debug(format!("Disconnected ({:?})", mode));
            self.emit(ShardEvent::Disconnected);
        }
    }

    /// Open a socket and attach its tasks. Boxed: recovery reopens from
    /// inside the tasks this spawns.
    fn open(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let inner = &self.inner;

            let resume_url = {
                let session = inner.session.lock();
                if session.resumable() {
                    session.resume_url.clone()
                } else {
                    None
                }
            };
            let base = resume_url.unwrap_or_else(|| inner.gateway_url.clone());

            let compress = inner.config.gateway.compress && COMPRESSION_AVAILABLE;
            let url = gateway_url(&base, inner.config.gateway.version, compress)?;
            let stream =
                connection::open(inner.id, &url, inner.config.connection.connect_timeout).await?;

            let (sink, source) = stream.split();
            let (commands, rx) = command_channel();
            let connection_id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
            let writer = spawn_writer(inner.id, sink, rx, Arc::clone(&inner.metrics));
            let mut connection = Connection::new(connection_id, commands, writer);

            {
                let mut slot = inner.connection.lock();
                if *inner.state.read() != ShardState::Connecting {
                    // Disconnected while the socket was opening
                    connection.close(NORMAL_CLOSE_CODE);
                    return Err(Error::Cancelled);
                }

                connection.attach(tokio::spawn(
                    self.clone().read_loop(connection_id, source, compress),
                ));
                connection.arm_timeout(tokio::spawn(self.clone().connect_timeout(connection_id)));

                if let Some(stale) = slot.replace(connection) {
                    stale.close(NORMAL_CLOSE_CODE);
                }
            }

            inner.metrics.record_connection();
            self.debug(format!("Connected to {}", url));
            Ok(())
        }
        .boxed()
    }

    fn connect_failed(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != ShardState::Connecting {
                return;
            }
            *state = ShardState::Disconnected;
        }
        self.inner.metrics.update_shard(self.inner.id, |s| {
            s.mark_down();
            s.connect_attempt += 1;
        });
        self.emit(ShardEvent::Disconnected);
    }

    async fn read_loop(self, connection_id: u64, mut source: WsSource, compress: bool) {
        let mut inflater = compress.then(Inflater::new);

        let code = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(connection_id, text.as_bytes()),
                Some(Ok(Message::Binary(data))) => match inflater.as_mut() {
                    Some(inflater) => match inflater.push(&data) {
                        Ok(Some(frame)) => self.handle_frame(connection_id, &frame),
                        Ok(None) => {}
                        Err(e) => self.report(&e),
                    },
                    None => self.handle_frame(connection_id, &data),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or(ABNORMAL_CLOSE_CODE, |frame| u16::from(frame.code));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[SHARD-{}] WebSocket error: {}", self.inner.id, e);
                    break ABNORMAL_CLOSE_CODE;
                }
                None => break ABNORMAL_CLOSE_CODE,
            }
        };

        // Recovery replaces this connection, which aborts this task
        tokio::spawn(self.handle_close(connection_id, code));
    }

    fn handle_frame(&self, connection_id: u64, bytes: &[u8]) {
        let payload: GatewayPayload = match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                self.report(&Error::Decode(e));
                return;
            }
        };

        self.inner.metrics.record_message_received();
        self.inner
            .metrics
            .update_shard(self.inner.id, |s| s.last_message_at = Some(std::time::Instant::now()));
        trace!("[SHARD-{}] Received op {}", self.inner.id, payload.op);

        self.emit(ShardEvent::Raw(payload.clone()));
        self.handle_payload(connection_id, payload);
    }

    fn handle_payload(&self, connection_id: u64, payload: GatewayPayload) {
        match payload.opcode() {
            Some(OpCode::Hello) => {
                let interval = match serde_json::from_value::<Hello>(payload.d)
                    .and_then(|hello| hello.interval())
                {
                    Ok(interval) => interval,
                    Err(e) => {
                        self.report(&Error::Decode(e));
                        return;
                    }
                };
                self.debug(format!("Hello received, heartbeat interval {:?}", interval));
                let task = tokio::spawn(self.clone().run_session(connection_id, interval));
                self.attach_to(connection_id, task);
            }
            Some(OpCode::HeartbeatAck) => {
                let latency = {
                    let mut session = self.inner.session.lock();
                    session.heartbeat.record_ack(Instant::now());
                    session.heartbeat.latency()
                };
                self.inner.metrics.record_heartbeat_ack();
                self.inner
                    .metrics
                    .update_shard(self.inner.id, |s| s.latency = latency);
                trace!("[SHARD-{}] Heartbeat acknowledged ({:?})", self.inner.id, latency);
            }
            Some(OpCode::Heartbeat) => {
                self.debug("Heartbeat requested by gateway".to_string());
                let shard = self.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = shard.heartbeat(Instant::now()).await {
                        shard.report_unless_cancelled(&e);
                    }
                });
                self.attach_to(connection_id, task);
            }
            Some(OpCode::InvalidSession) => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                self.debug(format!("Invalid session (resumable: {})", resumable));
                let task = tokio::spawn(self.clone().handle_invalid_session(connection_id, resumable));
                self.attach_to(connection_id, task);
            }
            Some(OpCode::Reconnect) => {
                self.debug("Reconnect requested by gateway".to_string());
                tokio::spawn(self.clone().recover(connection_id));
            }
            Some(OpCode::Dispatch) => self.handle_dispatch(connection_id, payload),
            _ => {
                trace!("[SHARD-{}] Ignoring op {}", self.inner.id, payload.op);
            }
        }
    }

    fn handle_dispatch(&self, connection_id: u64, payload: GatewayPayload) {
        if let Some(sequence) = payload.s {
            self.inner.session.lock().sequence = Some(sequence);
        }

        let name = payload.t.unwrap_or_default();
        let ready = match name.as_str() {
            "READY" => match serde_json::from_value::<Ready>(payload.d.clone()) {
                Ok(ready) => {
                    let mut session = self.inner.session.lock();
                    session.session_id = Some(ready.session_id);
                    session.resume_url = ready.resume_gateway_url;
                    Some(false)
                }
                Err(e) => {
                    self.report(&Error::Decode(e));
                    None
                }
            },
            "RESUMED" => Some(true),
            _ => None,
        };

        // The READY payload reaches listeners before the readiness change
        self.emit(ShardEvent::Dispatch(DispatchEvent {
            name,
            sequence: payload.s,
            data: payload.d,
        }));
        if let Some(resumed) = ready {
            self.mark_ready(connection_id, resumed);
        }
    }

    fn mark_ready(&self, connection_id: u64, resumed: bool) {
        {
            let mut slot = self.inner.connection.lock();
            match slot.as_mut() {
                Some(connection) if connection.id() == connection_id => connection.disarm_timeout(),
                _ => return,
            }
            *self.inner.state.write() = ShardState::Ready;
        }

        self.inner.metrics.update_shard(self.inner.id, |s| s.mark_ready());
        if resumed {
            self.debug("Session resumed".to_string());
            self.emit(ShardEvent::Resumed);
        } else {
            self.debug("Session ready".to_string());
            self.emit(ShardEvent::Ready);
        }
    }

    /// Identify or resume, then heartbeat until the connection goes away.
    async fn run_session(self, connection_id: u64, interval: Duration) {
        if let Err(e) = self.identify_or_resume(connection_id).await {
            self.report_unless_cancelled(&e);
            return;
        }

        if let Err(e) = self.heartbeat(Instant::now()).await {
            self.report_unless_cancelled(&e);
            return;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + jitter(interval), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let tick = ticker.tick().await;

            let zombie = self.inner.session.lock().heartbeat.is_zombie(tick, interval);
            if zombie {
                warn!(
                    "[SHARD-{}] No heartbeat ACK within {:?}, reconnecting",
                    self.inner.id, interval
                );
                self.inner.metrics.record_zombie();
                tokio::spawn(self.clone().recover(connection_id));
                return;
            }

            if let Err(e) = self.heartbeat(tick).await {
                self.report_unless_cancelled(&e);
                return;
            }
        }
    }

    async fn heartbeat(&self, at: Instant) -> Result<()> {
        let sequence = {
            let mut session = self.inner.session.lock();
            session.heartbeat.record_sent(at);
            session.sequence
        };
        self.send(GatewayPayload::heartbeat(sequence)).await?;
        self.inner.metrics.record_heartbeat();
        Ok(())
    }

    async fn handle_invalid_session(self, connection_id: u64, resumable: bool) {
        {
            let mut session = self.inner.session.lock();
            if !(resumable && session.resumable()) {
                session.forget();
            }
        }
        if let Err(e) = self.identify_or_resume(connection_id).await {
            self.report_unless_cancelled(&e);
        }
    }

    async fn identify_or_resume(&self, connection_id: u64) -> Result<()> {
        let resume = {
            let session = self.inner.session.lock();
            session.session_id.clone().map(|session_id| Resume {
                token: self.inner.config.token.clone(),
                session_id,
                seq: session.sequence,
            })
        };

        match resume {
            Some(resume) => {
                self.debug(format!(
                    "Resuming session {} at sequence {:?}",
                    resume.session_id, resume.seq
                ));
                self.send(GatewayPayload::resume(&resume)?).await?;
                self.inner.metrics.record_resume();
                Ok(())
            }
            None => {
                let identify = Identify {
                    token: self.inner.config.token.clone(),
                    intents: self.inner.config.intents,
                    properties: IdentifyProperties::default(),
                    // Per-payload compression is not supported
                    compress: false,
                    shard: self.inner.shard_info,
                };
                self.write_identify(Some(connection_id), GatewayPayload::identify(&identify)?)
                    .await
            }
        }
    }

    /// Write an identify frame directly, at least `identify_spacing` after
    /// the previous one. `connection_id` pins the frame to one socket.
    async fn write_identify(&self, connection_id: Option<u64>, payload: GatewayPayload) -> Result<()> {
        let _guard = self.inner.identify_lock.lock().await;

        let spacing = self.inner.config.connection.identify_spacing;
        let wait = self
            .inner
            .session
            .lock()
            .last_identify
            .map(|at| (at + spacing).saturating_duration_since(Instant::now()));
        if let Some(wait) = wait.filter(|wait| !wait.is_zero()) {
            self.debug(format!("Waiting {:?} before identifying", wait));
            tokio::time::sleep(wait).await;
        }

        let text = serde_json::to_string(&payload)?;
        let commands = {
            let slot = self.inner.connection.lock();
            match slot.as_ref() {
                Some(connection) if connection_id.map_or(true, |id| id == connection.id()) => {
                    connection.commands()
                }
                Some(_) => return Err(Error::Cancelled),
                None => return Err(Error::NotConnected(self.inner.id)),
            }
        };

        commands
            .send(ConnectionCommand::Send(Message::Text(text)))
            .await
            .map_err(|_| Error::NotConnected(self.inner.id))?;

        self.inner.session.lock().last_identify = Some(Instant::now());
        self.inner.metrics.record_identify();
        self.debug("Identified".to_string());
        Ok(())
    }

    async fn handle_close(self, connection_id: u64, code: u16) {
        if !self.is_current(connection_id) {
            return;
        }

        let disposition = CloseDisposition::for_code(code);
        self.debug(format!("Connection closed with code {} ({:?})", code, disposition));

        match disposition {
            CloseDisposition::Fatal => {
                let error = match CloseCode::from_u16(code) {
                    Some(code) => Error::Fatal { code },
                    None => Error::GatewayClosed { code },
                };
                self.disconnect(DisconnectMode::Reset);
                self.report(&error);
                return;
            }
            CloseDisposition::ReconnectWithoutSequence => {
                self.inner.session.lock().sequence = None;
            }
            CloseDisposition::ReconnectFresh => {
                self.inner.session.lock().forget();
            }
            CloseDisposition::ReconnectThrottled => {
                self.inner.window.lock().exhaust(Instant::now());
            }
            CloseDisposition::Reconnect => {}
        }

        self.recover(connection_id).await;
    }

    /// Replace the connection with a fresh one, keeping the session.
    async fn recover(self, connection_id: u64) {
        let resumable = {
            let mut slot = self.inner.connection.lock();
            match slot.as_ref() {
                Some(connection) if connection.id() == connection_id => {}
                _ => return,
            }
            let connection = slot.take();
            self.inner.queue.clear();

            let resumable = {
                let mut session = self.inner.session.lock();
                session.heartbeat.reset();
                session.resumable()
            };
            if let Some(connection) = connection {
                connection.close(if resumable {
                    RESUMABLE_CLOSE_CODE
                } else {
                    NORMAL_CLOSE_CODE
                });
            }
            *self.inner.state.write() = ShardState::Connecting;
            resumable
        };

        self.inner.metrics.record_reconnection();
        self.inner.metrics.update_shard(self.inner.id, |s| s.mark_down());
        self.debug(format!("Reconnecting (resume: {})", resumable));
        self.emit(ShardEvent::Reconnecting);

        if let Err(e) = self.open().await {
            self.connect_failed();
            self.report(&e);
        }
    }

    async fn connect_timeout(self, connection_id: u64) {
        let timeout = self.inner.config.connection.connect_timeout;
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::time::sleep_until(deadline).await;
            // Waiting for an empty send window to refill does not count
            let throttled = self.inner.window.lock().throttled_until(Instant::now());
            match throttled {
                Some(refill) => deadline = refill + timeout,
                None => break,
            }
        }

        let resumable = {
            let mut slot = self.inner.connection.lock();
            match slot.as_ref() {
                Some(connection) if connection.id() == connection_id => {}
                _ => return,
            }
            if *self.inner.state.read() == ShardState::Ready {
                return;
            }
            self.inner.queue.clear();
            let resumable = self.inner.session.lock().resumable();
            // Dropping the connection aborts this task at its next await
            if let Some(connection) = slot.take() {
                connection.close(if resumable {
                    RESUMABLE_CLOSE_CODE
                } else {
                    NORMAL_CLOSE_CODE
                });
            }
            *self.inner.state.write() = ShardState::Connecting;
            resumable
        };

        warn!(
            "[SHARD-{}] Not ready within {:?} (resumable: {})",
            self.inner.id, timeout, resumable
        );
        self.connect_failed();
        self.report(&Error::ConnectTimeout {
            shard_id: self.inner.id,
            timeout,
        });
    }

    fn is_current(&self, connection_id: u64) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.id() == connection_id)
    }

    /// Tie `task` to a connection, or abort it if that connection is gone
    fn attach_to(&self, connection_id: u64, task: tokio::task::JoinHandle<()>) {
        let mut slot = self.inner.connection.lock();
        match slot.as_mut() {
            Some(connection) if connection.id() == connection_id => connection.attach(task),
            _ => task.abort(),
        }
    }

    fn emit(&self, event: ShardEvent) {
        self.inner
            .listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn debug(&self, message: String) {
        debug!("[SHARD-{}] {}", self.inner.id, message);
        self.emit(ShardEvent::Debug(message));
    }

    fn report(&self, error: &Error) {
        self.inner.metrics.record_error();
        if error.is_fatal() {
            error!("[SHARD-{}] {}", self.inner.id, error);
        } else {
            warn!("[SHARD-{}] {}", self.inner.id, error);
        }
        self.emit(ShardEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    fn report_unless_cancelled(&self, error: &Error) {
        if matches!(error, Error::Cancelled) {
            trace!("[SHARD-{}] Pending work cancelled", self.inner.id);
        } else {
            self.report(error);
        }
    }

    /// Install a fake connection whose frames land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn attach_test_connection(&self) -> tokio::sync::mpsc::Receiver<ConnectionCommand> {
        let (commands, rx) = command_channel();
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let writer = tokio::spawn(async {});
        *self.inner.connection.lock() = Some(Connection::new(id, commands, writer));
        *self.inner.state.write() = ShardState::Ready;
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::test_support::{collect_until, next_event, MockGateway, MockOptions};

    fn config(connection: ConnectionConfig) -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder()
                .token("abc.def.ghi")
                .intents(513)
                .connection(connection)
                .build()
                .unwrap(),
        )
    }

    fn fast_config() -> Arc<ClientConfig> {
        config(ConnectionConfig {
            identify_spacing: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    fn shard(config: Arc<ClientConfig>, url: &str) -> Shard {
        Shard::new(0, None, url, config, Arc::new(Metrics::new()))
    }

    fn sent_payload(command: ConnectionCommand) -> GatewayPayload {
        match command {
            ConnectionCommand::Send(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_send_window() {
        let mut window = SendWindow::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert!(window.reserve(start).is_ok());
        assert!(window.reserve(start).is_ok());
        assert_eq!(window.reserve(start + Duration::from_secs(10)), Err(Duration::from_secs(50)));
        assert!(window.reserve(start + Duration::from_secs(60)).is_ok());

        window.exhaust(start + Duration::from_secs(61));
        assert_eq!(
            window.reserve(start + Duration::from_secs(61)),
            Err(Duration::from_secs(60))
        );

        window.reset();
        assert!(window.reserve(start + Duration::from_secs(62)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify_spacing() {
        let shard = shard(config(ConnectionConfig::default()), "ws://unused");
        let mut rx = shard.attach_test_connection();

        let identify = GatewayPayload::new(OpCode::Identify, serde_json::json!({}));
        let start = Instant::now();
        shard.send(identify.clone()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(1)).await;
        shard.send(identify).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5_500));

        assert_eq!(sent_payload(rx.recv().await.unwrap()).op, 2);
        assert_eq!(sent_payload(rx.recv().await.unwrap()).op, 2);
        // Identify does not consume the send window
        assert_eq!(shard.inner.window.lock().remaining, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_window_throttles() {
        let shard = shard(
            config(ConnectionConfig {
                send_limit: 2,
                ..Default::default()
            }),
            "ws://unused",
        );
        let mut rx = shard.attach_test_connection();

        let start = Instant::now();
        for _ in 0..2 {
            shard.send(GatewayPayload::heartbeat(None)).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        shard.send(GatewayPayload::heartbeat(Some(1))).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(shard.inner.metrics.send_throttles(), 1);

        for _ in 0..3 {
            assert_eq!(sent_payload(rx.recv().await.unwrap()).op, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_queued_sends() {
        let shard = shard(
            config(ConnectionConfig {
                send_limit: 1,
                ..Default::default()
            }),
            "ws://unused",
        );
        let mut rx = shard.attach_test_connection();
        shard.send(GatewayPayload::heartbeat(None)).await.unwrap();

        // One throttled on the window, one waiting in the queue
        let throttled = tokio::spawn({
            let shard = shard.clone();
            async move { shard.send(GatewayPayload::heartbeat(Some(1))).await }
        });
        let queued = tokio::spawn({
            let shard = shard.clone();
            async move { shard.send(GatewayPayload::heartbeat(Some(2))).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut events = shard.subscribe();
        shard.disconnect(DisconnectMode::Reset);

        assert!(matches!(throttled.await.unwrap(), Err(Error::Cancelled)));
        assert!(matches!(queued.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(shard.state(), ShardState::Disconnected);
        assert!(matches!(
            next_event(&mut events, |e| matches!(e, ShardEvent::Disconnected)).await,
            ShardEvent::Disconnected
        ));

        assert_eq!(sent_payload(rx.recv().await.unwrap()).d, serde_json::Value::Null);
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionCommand::Close(NORMAL_CLOSE_CODE))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_connection_fails_fast() {
        let shard = shard(config(ConnectionConfig::default()), "ws://unused");

        let start = Instant::now();
        assert!(matches!(
            shard.send(GatewayPayload::heartbeat(None)).await,
            Err(Error::NotConnected(0))
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(shard.inner.window.lock().remaining, 110);

        // An empty window does not delay the error either
        shard.inner.window.lock().exhaust(Instant::now());
        assert!(matches!(
            shard.send(GatewayPayload::heartbeat(None)).await,
            Err(Error::NotConnected(0))
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(shard.inner.metrics.send_throttles(), 0);
    }

    #[tokio::test]
    async fn test_listen_keeps_every_event() {
        let shard = shard(
            config(ConnectionConfig {
                event_buffer: 4,
                ..Default::default()
            }),
            "ws://unused",
        );
        let mut listener = shard.listen();
        let mut lossy = shard.subscribe();

        for i in 0..50 {
            shard.debug(format!("event {i}"));
        }

        for i in 0..50 {
            match listener.recv().await {
                Some(ShardEvent::Debug(message)) => assert_eq!(message, format!("event {i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(matches!(
            lossy.recv().await,
            Err(broadcast::error::RecvError::Lagged(46))
        ));

        drop(listener);
        shard.debug("after drop".to_string());
        assert!(shard.inner.listeners.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let shard = shard(fast_config(), "ws://unused");
        let _rx = shard.attach_test_connection();
        assert!(matches!(
            shard.connect().await,
            Err(Error::AlreadyConnecting(0))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_disconnected() {
        let shard = shard(fast_config(), "ws://127.0.0.1:1");
        let mut events = shard.subscribe();
        assert!(shard.connect().await.is_err());
        assert_eq!(shard.state(), ShardState::Disconnected);
        next_event(&mut events, |e| matches!(e, ShardEvent::Disconnected)).await;
    }

    #[tokio::test]
    async fn test_ready_and_heartbeat() {
        let mut gateway = MockGateway::start(MockOptions::default()).await;
        let shard = shard(fast_config(), &gateway.url);
        let mut events = shard.subscribe();

        shard.connect().await.unwrap();
        let (connection, identify) = gateway.next_op(OpCode::Identify).await;
        assert_eq!(connection, 0);
        assert_eq!(identify.d["token"], "abc.def.ghi");
        assert_eq!(identify.d["intents"], 513);
        assert!(identify.d.get("shard").is_none());

        next_event(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
        assert_eq!(shard.state(), ShardState::Ready);
        assert_eq!(shard.session_id().as_deref(), Some("session-0"));
        assert_eq!(shard.sequence(), Some(1));

        // First heartbeat follows identify without waiting for the interval
        gateway.next_op(OpCode::Heartbeat).await;

        shard.disconnect(DisconnectMode::Reset);
        assert_eq!(shard.state(), ShardState::Disconnected);
        assert!(shard.session_id().is_none());
    }

    #[tokio::test]
    async fn test_ready_dispatch_precedes_ready() {
        let gateway = MockGateway::start(MockOptions::default()).await;
        let shard = shard(fast_config(), &gateway.url);
        let mut events = shard.listen();
        shard.connect().await.unwrap();

        let seen = collect_until(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, ShardEvent::Dispatch(dispatch) if dispatch.name == "READY")));
    }

    #[tokio::test]
    async fn test_connect_timeout_without_ready() {
        let gateway = MockGateway::start(MockOptions {
            withhold_ready: true,
            ..Default::default()
        })
        .await;
        let shard = shard(
            config(ConnectionConfig {
                identify_spacing: Duration::from_millis(50),
                connect_timeout: Duration::from_millis(300),
                ..Default::default()
            }),
            &gateway.url,
        );
        let mut events = shard.listen();
        shard.connect().await.unwrap();

        let seen = collect_until(&mut events, |e| matches!(e, ShardEvent::Error { .. })).await;
        match seen.last() {
            Some(ShardEvent::Error { kind, fatal, .. }) => {
                assert_eq!(*kind, ErrorKind::Timeout);
                assert!(!fatal);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(seen.iter().any(|e| matches!(e, ShardEvent::Disconnected)));
        assert_eq!(shard.state(), ShardState::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_heartbeat_interval_is_rejected() {
        let gateway = MockGateway::start(MockOptions {
            heartbeat_interval: 0,
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        let mut events = shard.listen();
        shard.connect().await.unwrap();

        let seen = collect_until(&mut events, |e| matches!(e, ShardEvent::Error { .. })).await;
        assert!(matches!(
            seen.last(),
            Some(ShardEvent::Error {
                kind: ErrorKind::Decode,
                ..
            })
        ));
        assert_eq!(shard.state(), ShardState::Connecting);
    }

    #[tokio::test]
    async fn test_server_heartbeat_request() {
        let mut gateway = MockGateway::start(MockOptions {
            request_heartbeat_after_ready: true,
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        shard.connect().await.unwrap();

        gateway.next_op(OpCode::Identify).await;
        // One after Hello, one on request; the 45s interval has not elapsed
        let (first, _) = gateway.next_op(OpCode::Heartbeat).await;
        let (second, _) = gateway.next_op(OpCode::Heartbeat).await;
        assert_eq!((first, second), (0, 0));
    }

    #[tokio::test]
    async fn test_resumable_invalid_session_resumes() {
        let mut gateway = MockGateway::start(MockOptions {
            invalidate_after_ready: Some(true),
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        shard.connect().await.unwrap();

        gateway.next_op(OpCode::Identify).await;
        let (connection, resume) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 0);
        assert_eq!(resume.d["session_id"], "session-0");
        assert_eq!(gateway.connections(), 1);
    }

    #[tokio::test]
    async fn test_invalid_session_reidentifies() {
        let mut gateway = MockGateway::start(MockOptions {
            invalidate_after_ready: Some(false),
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        let mut events = shard.listen();
        shard.connect().await.unwrap();

        let (first, _) = gateway.next_op(OpCode::Identify).await;
        let (second, _) = gateway.next_op(OpCode::Identify).await;
        assert_eq!((first, second), (0, 0));
        assert_eq!(gateway.connections(), 1);

        // READY for the first identify, then READY again for the second
        collect_until(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
        collect_until(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
        assert_eq!(shard.state(), ShardState::Ready);
    }

    #[tokio::test]
    async fn test_resumable_close_resumes() {
        let mut gateway = MockGateway::start(MockOptions {
            close_after_ready: Some(4000),
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        let mut events = shard.subscribe();
        shard.connect().await.unwrap();

        gateway.next_op(OpCode::Identify).await;
        let (connection, resume) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 1);
        assert_eq!(resume.d["session_id"], "session-0");
        assert_eq!(resume.d["seq"], 1);

        next_event(&mut events, |e| matches!(e, ShardEvent::Resumed)).await;
        assert_eq!(shard.state(), ShardState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_sequence_resumes_without_sequence() {
        let mut gateway = MockGateway::start(MockOptions {
            close_after_ready: Some(4007),
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        shard.connect().await.unwrap();

        let (connection, resume) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 1);
        assert_eq!(resume.d["session_id"], "session-0");
        assert!(resume.d["seq"].is_null());
    }

    #[tokio::test]
    async fn test_rate_limited_close_empties_window() {
        let window = Duration::from_millis(300);
        let mut gateway = MockGateway::start(MockOptions {
            close_after_ready: Some(4008),
            ..Default::default()
        })
        .await;
        let shard = shard(
            config(ConnectionConfig {
                identify_spacing: Duration::from_millis(50),
                send_window: window,
                ..Default::default()
            }),
            &gateway.url,
        );
        let start = Instant::now();
        shard.connect().await.unwrap();

        // Without the emptied window the resume follows the close at once
        let (connection, _) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 1);
        assert!(start.elapsed() >= window);
        assert!(shard.inner.metrics.send_throttles() >= 1);
    }

    #[tokio::test]
    async fn test_rate_limited_close_outlasts_connect_timeout() {
        // Same ratio as the defaults: the window outlasts the connect timeout
        let mut gateway = MockGateway::start(MockOptions {
            close_after_ready: Some(4008),
            ..Default::default()
        })
        .await;
        let shard = shard(
            config(ConnectionConfig {
                identify_spacing: Duration::from_millis(50),
                connect_timeout: Duration::from_millis(500),
                send_window: Duration::from_millis(1000),
                ..Default::default()
            }),
            &gateway.url,
        );
        let mut events = shard.listen();
        shard.connect().await.unwrap();

        let seen = collect_until(&mut events, |e| matches!(e, ShardEvent::Resumed)).await;
        assert!(!seen.iter().any(|e| matches!(e, ShardEvent::Error { .. })));
        assert_eq!(shard.state(), ShardState::Ready);

        let (connection, _) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 1);
    }

    #[tokio::test]
    async fn test_session_timeout_reidentifies() {
        let mut gateway = MockGateway::start(MockOptions {
            close_after_ready: Some(4009),
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        shard.connect().await.unwrap();

        let (first, _) = gateway.next_op(OpCode::Identify).await;
        let (second, _) = gateway.next_op(OpCode::Identify).await;
        assert_eq!((first, second), (0, 1));
    }

    #[tokio::test]
    async fn test_fatal_close_stops() {
        let mut gateway = MockGateway::start(MockOptions {
            close_after_ready: Some(4004),
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        let mut events = shard.subscribe();
        shard.connect().await.unwrap();

        match next_event(&mut events, |e| matches!(e, ShardEvent::Error { .. })).await {
            ShardEvent::Error { kind, fatal, .. } => {
                assert_eq!(kind, ErrorKind::Fatal);
                assert!(fatal);
            }
            _ => unreachable!(),
        }
        assert_eq!(shard.state(), ShardState::Disconnected);
        assert!(shard.session_id().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gateway.connections(), 1);
    }

    #[tokio::test]
    async fn test_zombie_connection_resumes() {
        let mut gateway = MockGateway::start(MockOptions {
            heartbeat_interval: 100,
            ack_heartbeats: false,
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        shard.connect().await.unwrap();

        gateway.next_op(OpCode::Identify).await;
        let (connection, _) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 1);
        assert!(shard.inner.metrics.zombie_connections() >= 1);
    }

    #[tokio::test]
    async fn test_reconnect_opcode_resumes() {
        let mut gateway = MockGateway::start(MockOptions {
            reconnect_after_ready: true,
            ..Default::default()
        })
        .await;
        let shard = shard(fast_config(), &gateway.url);
        shard.connect().await.unwrap();

        gateway.next_op(OpCode::Identify).await;
        let (connection, _) = gateway.next_op(OpCode::Resume).await;
        assert_eq!(connection, 1);
    }

    #[cfg(feature = "zlib")]
    #[tokio::test]
    async fn test_compressed_session() {
        let mut gateway = MockGateway::start(MockOptions {
            compress: true,
            ..Default::default()
        })
        .await;
        let config = Arc::new(
            ClientConfig::builder()
                .token("abc.def.ghi")
                .gateway(crate::config::GatewayConfig {
                    compress: true,
                    ..Default::default()
                })
                .connection(ConnectionConfig {
                    identify_spacing: Duration::from_millis(50),
                    ..Default::default()
                })
                .build()
                .unwrap(),
        );
        let shard = shard(config, &gateway.url);
        let mut events = shard.subscribe();
        shard.connect().await.unwrap();

        gateway.next_op(OpCode::Identify).await;
        next_event(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
    }
}

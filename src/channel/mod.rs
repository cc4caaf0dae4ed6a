//! Reverse-dial WebSocket command channel.
//!
//! A [`CommandChannel`] dials out to a remote controller and then serves
//! request/response commands initiated by that controller, inverting the
//! usual connect/listen polarity. The channel owns the whole connection
//! lifecycle: dialing (directly or through an HTTP CONNECT proxy),
//! heartbeating with pings, reconnecting after failures and closes, applying
//! runtime reconfiguration, and shutting down gracefully.
//!
//! Every inbound text or binary frame is one command, delivered to the
//! injected [`MessageHandler`]. The handler replies by sending zero or more
//! frames through the [`ConnectionRef`] it was given. Returning `true` marks
//! the reply complete immediately; returning `false` leaves the channel in
//! the replying state — with reading paused — until the handler calls
//! [`ChannelHandle::done_replying`]. The peer is required to read each reply
//! before sending the next request: the write side applies no backpressure
//! and queues frames unbounded.
//!
//! All state lives on a single event-loop task driven by
//! [`CommandChannel::run`]. [`ChannelHandle`] operations may be called from
//! any thread; they post work onto the loop and observe state through a
//! mutex-guarded mirror.

pub mod state;

use std::fmt;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message, Utf8Bytes};
use tracing::{debug, error, info, warn};

use crate::config::{errors_to_string, ConfigError, ConfigStore, ConfigType};
use crate::transport::{self, DialSettings, ProxySettings, TransportError, WsStream};
use self::state::ChannelState;

/// Default proxy handshake timeout in seconds.
const DEFAULT_PROXY_TIMEOUT_SECS: f64 = 30.0;
/// Default timeout for the whole dial (TCP, proxy, WebSocket handshake).
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 30.0;
/// Default interval between heartbeat pings in seconds.
const DEFAULT_PING_INTERVAL_SECS: f64 = 30.0;
/// Default time to wait for a pong before closing, in seconds.
const DEFAULT_PING_TIMEOUT_SECS: f64 = 30.0;
/// Default time to wait for the close handshake, in seconds.
const DEFAULT_CLOSE_TIMEOUT_SECS: f64 = 50.0;
/// Default delay before re-dialing after a close or failure, in seconds.
const DEFAULT_RECONNECT_TIMEOUT_SECS: f64 = 5.0;

/// Handles one inbound command frame on the event-loop task; must not block.
///
/// Returns `true` when the reply is already complete, `false` when the reply
/// finishes later with [`ChannelHandle::done_replying`] (do not also call
/// `done_replying` after returning `true`).
pub type MessageHandler = Box<dyn FnMut(&ChannelHandle, &ConnectionRef, Message) -> bool + Send>;

/// Receives the update preview and any validation findings of a
/// [`ChannelHandle::configure`] or [`ChannelHandle::inspect_config`] call.
pub type ConfigCallback = Box<dyn FnOnce(Value, Vec<ConfigError>) + Send>;

/// Receives a state inspection document.
pub type StateCallback = Box<dyn FnOnce(Value) + Send>;

/// Invoked once after the event loop has drained and returned.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Errors surfaced by [`CommandChannel::new`].
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid configuration: {}", errors_to_string(.0))]
    InvalidConfig(Vec<ConfigError>),
}

/// Weak reference to one connection owned by the channel.
///
/// Callbacks and handlers hold these instead of the connection itself. Each
/// connection gets a fresh id, so a reference left over from a superseded
/// connection no longer matches the channel's current one: operations made
/// through it are silently ignored and [`send`](Self::send) reports failure.
#[derive(Clone)]
pub struct ConnectionRef {
    id: u64,
    outbound: UnboundedSender<Message>,
}

impl ConnectionRef {
    /// Identity of the underlying connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for sending. Returns `false` when the connection has
    /// been superseded or torn down.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Queue a text frame for sending.
    pub fn send_text(&self, text: impl Into<Utf8Bytes>) -> bool {
        self.send(Message::Text(text.into()))
    }
}

impl PartialEq for ConnectionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionRef {}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef").field("id", &self.id).finish()
    }
}

enum Command {
    Configure {
        updates: Value,
        callback: Option<ConfigCallback>,
    },
    InspectConfig {
        callback: ConfigCallback,
    },
    InspectState {
        callback: StateCallback,
    },
    DoneReplying {
        conn: ConnectionRef,
    },
    Shutdown {
        callback: Option<ShutdownCallback>,
    },
}

enum ConnEvent {
    Connected { id: u64, stream: WsStream },
    ConnectFailed { id: u64, error: TransportError },
    Frame { id: u64, message: Message },
    Pong { id: u64 },
    Closed { id: u64 },
    SendFailed { id: u64 },
}

struct Shared {
    state: Mutex<ChannelState>,
}

/// Cloneable, thread-safe front end of a [`CommandChannel`].
///
/// All operations post work onto the channel's event loop and return
/// immediately; posted operations execute in FIFO order. Operations posted
/// after shutdown are dropped.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Apply a configuration update document on the event loop.
    ///
    /// The update is previewed against the schema; when valid it is applied
    /// and, if `url` or `proxy_url` changed, the connection is restarted.
    /// The callback receives the preview and the validation findings either
    /// way; an invalid update mutates nothing.
    pub fn configure(&self, updates: Value, callback: Option<ConfigCallback>) {
        let _ = self.commands.send(Command::Configure { updates, callback });
    }

    /// Fetch the configuration dump from the event loop.
    pub fn inspect_config(&self, callback: ConfigCallback) {
        let _ = self.commands.send(Command::InspectConfig { callback });
    }

    /// Fetch a state document: `{"state": <tag>, "reconnect_planned"?: true,
    /// "shutting_down"?: true}`.
    pub fn inspect_state(&self, callback: StateCallback) {
        let _ = self.commands.send(Command::InspectState { callback });
    }

    /// Mark an asynchronous reply as complete. Reading resumes and a
    /// reconfiguration-requested reconnect deferred during the reply is
    /// honored. Ignored when `conn` is not the current connection.
    pub fn done_replying(&self, conn: &ConnectionRef) {
        let _ = self.commands.send(Command::DoneReplying { conn: conn.clone() });
    }

    /// Shut the channel down: close the connection with a GOING_AWAY close
    /// and let the event loop drain without reconnecting. The callback fires
    /// once, after [`CommandChannel::run`] has returned.
    pub fn shutdown(&self, callback: Option<ShutdownCallback>) {
        let _ = self.commands.send(Command::Shutdown { callback });
    }

    /// Whether [`CommandChannel::initialize`] has run. Stays `true` after
    /// shutdown.
    pub fn is_initialized(&self) -> bool {
        *self.shared.state.lock() != ChannelState::Uninitialized
    }

    /// Whether the channel has finished shutting down.
    pub fn is_shut_down(&self) -> bool {
        *self.shared.state.lock() == ChannelState::ShutDown
    }

    /// The current state tag.
    pub fn state_string(&self) -> &'static str {
        self.shared.state.lock().as_str()
    }
}

struct Connection {
    id: u64,
    outbound: UnboundedSender<Message>,
    resume: Arc<Notify>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Reverse-dial WebSocket command channel. See the module documentation.
pub struct CommandChannel {
    core: ChannelCore,
    commands: UnboundedReceiver<Command>,
    events: UnboundedReceiver<ConnEvent>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel").finish_non_exhaustive()
    }
}

impl CommandChannel {
    /// Build a channel with the given message handler and initial
    /// configuration document. The document is validated against the fixed
    /// schema (`url` required; proxy settings and timeouts optional) and
    /// applied atomically.
    pub fn new(handler: MessageHandler, initial_config: &Value) -> Result<Self, ChannelError> {
        let mut store = build_schema().map_err(|error| ChannelError::InvalidConfig(vec![error]))?;
        store
            .update(initial_config)
            .map_err(ChannelError::InvalidConfig)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::Uninitialized),
        });
        let handle = ChannelHandle {
            commands: command_tx,
            shared: shared.clone(),
        };
        let log_prefix = coerce_string(&store.get("log_prefix")).unwrap_or_default();

        Ok(Self {
            core: ChannelCore {
                store,
                log_prefix,
                handler,
                shared,
                handle,
                event_tx,
                commands_open: true,
                state: ChannelState::Uninitialized,
                conn: None,
                dialing: None,
                next_conn_id: 1,
                timer_deadline: None,
                pong_deadline: None,
                close_deadline: None,
                reconnect_after_reply: false,
                shutting_down: false,
                shutdown_callback: None,
            },
            commands: command_rx,
            events: event_rx,
        })
    }

    /// A front end for this channel, cloneable and usable from any thread.
    pub fn handle(&self) -> ChannelHandle {
        self.core.handle.clone()
    }

    /// Begin the first dial. Must be called once, from within the Tokio
    /// runtime that will drive [`run`](Self::run).
    pub fn initialize(&mut self) {
        assert_eq!(
            self.core.state,
            ChannelState::Uninitialized,
            "initialize() called twice"
        );
        self.core.set_state(ChannelState::NotConnected);
        self.core.start_connect();
    }

    /// Drive the event loop until a shutdown has drained all activity, then
    /// flip the state to SHUT_DOWN and invoke the shutdown callback.
    pub async fn run(self) {
        let CommandChannel {
            mut core,
            mut commands,
            mut events,
        } = self;
        assert_ne!(
            core.state,
            ChannelState::Uninitialized,
            "run() called before initialize()"
        );

        loop {
            if core.shutting_down && core.conn.is_none() && core.dialing.is_none() {
                break;
            }
            tokio::select! {
                biased;
                command = commands.recv(), if core.commands_open => match command {
                    Some(command) => core.handle_command(command),
                    None => core.commands_open = false,
                },
                Some(event) = events.recv() => core.handle_event(event),
                _ = wait_until(core.pong_deadline) => core.on_pong_deadline(),
                _ = wait_until(core.close_deadline) => core.on_close_deadline(),
                _ = wait_until(core.timer_deadline) => core.on_timer(),
            }
        }

        core.set_state(ChannelState::ShutDown);
        info!("{}channel shut down", core.log_prefix);
        if let Some(callback) = core.shutdown_callback.take() {
            callback();
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

struct ChannelCore {
    store: ConfigStore,
    log_prefix: String,
    handler: MessageHandler,
    shared: Arc<Shared>,
    handle: ChannelHandle,
    event_tx: UnboundedSender<ConnEvent>,
    commands_open: bool,
    state: ChannelState,
    conn: Option<Connection>,
    dialing: Option<u64>,
    next_conn_id: u64,
    timer_deadline: Option<Instant>,
    pong_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    reconnect_after_reply: bool,
    shutting_down: bool,
    shutdown_callback: Option<ShutdownCallback>,
}

impl ChannelCore {
    fn set_state(&mut self, state: ChannelState) {
        self.state = state;
        *self.shared.state.lock() = state;
    }

    fn is_current_conn(&self, id: u64) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.id == id)
    }

    fn connection_ref(&self) -> Option<ConnectionRef> {
        self.conn.as_ref().map(|conn| ConnectionRef {
            id: conn.id,
            outbound: conn.outbound.clone(),
        })
    }

    fn config_timeout(&self, key: &str, fallback: f64) -> Duration {
        let secs = self.store.get(key).as_f64().unwrap_or(fallback);
        Duration::from_secs_f64(secs.max(0.0))
    }

    // ------------------------------------------------------------------
    // Posted commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Configure { updates, callback } => self.internal_configure(&updates, callback),
            Command::InspectConfig { callback } => callback(self.store.dump(), Vec::new()),
            Command::InspectState { callback } => callback(self.state_document()),
            Command::DoneReplying { conn } => self.internal_done_replying(&conn),
            Command::Shutdown { callback } => self.internal_shutdown(callback),
        }
    }

    fn internal_configure(&mut self, updates: &Value, callback: Option<ConfigCallback>) {
        let (preview, errors) = self.store.preview_update(updates);
        if !errors.is_empty() {
            warn!(
                "{}rejecting configuration update: {}",
                self.log_prefix,
                errors_to_string(&errors)
            );
            if let Some(callback) = callback {
                callback(preview, errors);
            }
            return;
        }

        let old_url = self.store.get("url");
        let old_proxy_url = self.store.get("proxy_url");
        self.store.force_apply_update_preview(&preview);
        self.update_config_cache();

        if self.store.get("url") != old_url || self.store.get("proxy_url") != old_proxy_url {
            info!("{}connection settings changed, reconnecting", self.log_prefix);
            self.internal_reconnect();
        }

        if let Some(callback) = callback {
            callback(preview, errors);
        }
    }

    fn update_config_cache(&mut self) {
        self.log_prefix = coerce_string(&self.store.get("log_prefix")).unwrap_or_default();
    }

    fn state_document(&self) -> Value {
        let mut doc = json!({ "state": self.state.as_str() });
        if self.reconnect_after_reply {
            doc["reconnect_planned"] = Value::Bool(true);
        }
        if self.shutting_down {
            doc["shutting_down"] = Value::Bool(true);
        }
        doc
    }

    fn internal_done_replying(&mut self, conn: &ConnectionRef) {
        if !self.is_current_conn(conn.id()) {
            return;
        }
        if self.state == ChannelState::Closing {
            // The reply raced a close or shutdown; nothing left to resume.
            return;
        }
        assert_eq!(
            self.state,
            ChannelState::Replying,
            "done_replying() called outside the replying state"
        );
        self.set_state(ChannelState::WaitingForRequest);
        if let Some(active) = &self.conn {
            active.resume.notify_one();
        }
        if self.reconnect_after_reply {
            self.reconnect_after_reply = false;
            self.internal_reconnect();
        }
    }

    fn internal_shutdown(&mut self, callback: Option<ShutdownCallback>) {
        info!("{}shutting down", self.log_prefix);
        self.shutting_down = true;
        self.shutdown_callback = callback;
        self.close_connection(CloseCode::Away, "shutting down");
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn start_connect(&mut self) {
        self.set_state(ChannelState::Connecting);
        let settings = match self.dial_settings() {
            Ok(settings) => settings,
            Err(error) => {
                error!("{}cannot start connection: {}", self.log_prefix, error);
                self.enter_not_connected();
                return;
            }
        };

        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.dialing = Some(id);
        info!("{}connecting to {}", self.log_prefix, settings.url);

        let events = self.event_tx.clone();
        tokio::spawn(async move {
            match transport::dial(&settings).await {
                Ok(stream) => {
                    let _ = events.send(ConnEvent::Connected { id, stream });
                }
                Err(error) => {
                    let _ = events.send(ConnEvent::ConnectFailed { id, error });
                }
            }
        });
    }

    fn dial_settings(&self) -> Result<DialSettings, TransportError> {
        let url = coerce_string(&self.store.get("url")).ok_or_else(|| TransportError::InvalidUrl {
            url: String::new(),
            message: "the url setting is not set".to_string(),
        })?;
        let proxy = coerce_string(&self.store.get("proxy_url")).map(|proxy_url| ProxySettings {
            url: proxy_url,
            username: coerce_string(&self.store.get("proxy_username")),
            password: coerce_string(&self.store.get("proxy_password")),
            timeout: self.config_timeout("proxy_timeout", DEFAULT_PROXY_TIMEOUT_SECS),
        });
        Ok(DialSettings {
            url,
            proxy,
            connect_timeout: self.config_timeout("connect_timeout", DEFAULT_CONNECT_TIMEOUT_SECS),
        })
    }

    /// Restart the connection so that new settings take effect. Deferred
    /// while a reply is in flight; a close already in progress or a pending
    /// reconnect subsumes the request.
    fn internal_reconnect(&mut self) {
        match self.state {
            ChannelState::NotConnected | ChannelState::Closing => {}
            ChannelState::Connecting | ChannelState::WaitingForRequest => {
                self.close_connection(CloseCode::Restart, "reconnecting");
            }
            ChannelState::Replying => self.reconnect_after_reply = true,
            ChannelState::Uninitialized | ChannelState::ShutDown => {
                unreachable!("reconnect requested in state {}", self.state)
            }
        }
    }

    fn close_connection(&mut self, code: CloseCode, reason: &str) {
        if self.state == ChannelState::Closing {
            return;
        }
        self.reconnect_after_reply = false;
        self.timer_deadline = None;
        self.pong_deadline = None;

        if let Some(conn) = &self.conn {
            let outbound = conn.outbound.clone();
            let resume = conn.resume.clone();
            info!("{}closing connection: {}", self.log_prefix, reason);
            self.set_state(ChannelState::Closing);
            // Reading may be paused; the close handshake needs it running.
            resume.notify_one();
            let frame = CloseFrame {
                code,
                reason: Utf8Bytes::from(reason.to_string()),
            };
            if outbound.send(Message::Close(Some(frame))).is_ok() {
                self.close_deadline = Some(
                    Instant::now() + self.config_timeout("close_timeout", DEFAULT_CLOSE_TIMEOUT_SECS),
                );
            } else {
                self.finish_close();
            }
        } else if self.dialing.is_some() {
            self.set_state(ChannelState::Closing);
            self.dialing = None;
            self.finish_close();
        } else {
            self.finish_close();
        }
    }

    /// Tear down whatever remains of the connection and enter NOT_CONNECTED.
    fn finish_close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
            conn.writer.abort();
        }
        self.dialing = None;
        self.pong_deadline = None;
        self.close_deadline = None;
        self.reconnect_after_reply = false;
        self.enter_not_connected();
    }

    fn enter_not_connected(&mut self) {
        self.set_state(ChannelState::NotConnected);
        if self.shutting_down {
            self.timer_deadline = None;
        } else {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config_timeout("reconnect_timeout", DEFAULT_RECONNECT_TIMEOUT_SECS);
        debug!(
            "{}scheduling reconnect in {:.1}s",
            self.log_prefix,
            delay.as_secs_f64()
        );
        self.timer_deadline = Some(Instant::now() + delay);
    }

    fn restart_ping_timer(&mut self) {
        self.timer_deadline =
            Some(Instant::now() + self.config_timeout("ping_interval", DEFAULT_PING_INTERVAL_SECS));
    }

    // ------------------------------------------------------------------
    // Connection events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Connected { id, stream } => self.on_connected(id, stream),
            ConnEvent::ConnectFailed { id, error } => self.on_connect_failed(id, error),
            ConnEvent::Frame { id, message } => self.on_frame(id, message),
            ConnEvent::Pong { id } => self.on_pong(id),
            ConnEvent::Closed { id } => self.on_connection_closed(id),
            ConnEvent::SendFailed { id } => self.on_send_failed(id),
        }
    }

    fn on_connected(&mut self, id: u64, stream: WsStream) {
        if self.dialing != Some(id) {
            debug!("{}discarding connection {} (superseded)", self.log_prefix, id);
            return;
        }
        self.dialing = None;

        let (write, read) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let resume = Arc::new(Notify::new());
        let reader = tokio::spawn(reader_task(id, read, self.event_tx.clone(), resume.clone()));
        let writer = tokio::spawn(writer_task(id, write, outbound_rx, self.event_tx.clone()));
        self.conn = Some(Connection {
            id,
            outbound: outbound_tx,
            resume,
            reader,
            writer,
        });

        info!("{}connection established", self.log_prefix);
        self.set_state(ChannelState::WaitingForRequest);
        self.restart_ping_timer();
    }

    fn on_connect_failed(&mut self, id: u64, error: TransportError) {
        if self.dialing != Some(id) {
            return;
        }
        self.dialing = None;
        error!("{}connection attempt failed: {}", self.log_prefix, error);
        self.enter_not_connected();
    }

    fn on_frame(&mut self, id: u64, message: Message) {
        if !self.is_current_conn(id) {
            return;
        }
        match self.state {
            ChannelState::WaitingForRequest => {
                self.set_state(ChannelState::Replying);
                let Some(conn_ref) = self.connection_ref() else {
                    return;
                };
                let handle = self.handle.clone();
                let done = (self.handler)(&handle, &conn_ref, message);
                if done {
                    self.internal_done_replying(&conn_ref);
                }
            }
            ChannelState::Closing => {
                // Discard, but keep the reader pumping the close handshake.
                if let Some(conn) = &self.conn {
                    conn.resume.notify_one();
                }
            }
            other => unreachable!("command frame received in state {}", other),
        }
    }

    fn on_pong(&mut self, id: u64) {
        if !self.is_current_conn(id) {
            return;
        }
        self.pong_deadline = None;
        if self.state == ChannelState::WaitingForRequest {
            self.restart_ping_timer();
        }
    }

    fn on_connection_closed(&mut self, id: u64) {
        if !self.is_current_conn(id) {
            return;
        }
        info!("{}connection closed", self.log_prefix);
        self.finish_close();
    }

    fn on_send_failed(&mut self, id: u64) {
        if !self.is_current_conn(id) {
            return;
        }
        warn!("{}write failed", self.log_prefix);
        if self.state == ChannelState::Closing {
            self.finish_close();
        } else {
            self.close_connection(CloseCode::Normal, "write error");
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// The single intent timer: its purpose is decided by the state at fire
    /// time — a reconnect delay in NOT_CONNECTED, the next heartbeat ping
    /// otherwise.
    fn on_timer(&mut self) {
        self.timer_deadline = None;
        match self.state {
            ChannelState::NotConnected => self.start_connect(),
            ChannelState::WaitingForRequest | ChannelState::Replying => self.send_ping(),
            other => unreachable!("timer fired in state {}", other),
        }
    }

    fn send_ping(&mut self) {
        let Some(conn) = &self.conn else {
            return;
        };
        debug!("{}sending ping", self.log_prefix);
        if conn.outbound.send(Message::Ping(Bytes::from_static(b"ping"))).is_ok() {
            // Track the oldest unanswered ping, not the most recent one.
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(
                    Instant::now() + self.config_timeout("ping_timeout", DEFAULT_PING_TIMEOUT_SECS),
                );
            }
            self.restart_ping_timer();
        } else {
            self.close_connection(CloseCode::Normal, "error sending ping");
        }
    }

    fn on_pong_deadline(&mut self) {
        self.pong_deadline = None;
        if self.state == ChannelState::Replying {
            // Reading is paused while replying; the pong will be seen once
            // reading resumes.
            return;
        }
        warn!("{}no pong within the ping timeout", self.log_prefix);
        self.close_connection(CloseCode::Normal, "reconnecting because of pong timeout");
    }

    fn on_close_deadline(&mut self) {
        self.close_deadline = None;
        warn!(
            "{}close handshake timed out, dropping the connection",
            self.log_prefix
        );
        self.finish_close();
    }
}

/// Pump inbound frames into the event loop. Commands are delivered one at a
/// time: after each text or binary frame the task pauses until the loop
/// resumes it. While paused it keeps watching the socket, so control frames
/// and connection loss are still observed during a reply; at most one early
/// command frame is held back for delivery after the pause.
async fn reader_task(
    id: u64,
    mut read: SplitStream<WsStream>,
    events: UnboundedSender<ConnEvent>,
    resume: Arc<Notify>,
) {
    let mut held_back: Option<Message> = None;
    loop {
        let message = match held_back.take() {
            Some(message) => message,
            None => match read.next().await {
                Some(Ok(message)) => message,
                Some(Err(error)) => {
                    debug!("read error on connection {}: {}", id, error);
                    let _ = events.send(ConnEvent::Closed { id });
                    return;
                }
                None => {
                    let _ = events.send(ConnEvent::Closed { id });
                    return;
                }
            },
        };
        match message {
            Message::Text(_) | Message::Binary(_) => {
                let _ = events.send(ConnEvent::Frame { id, message });
                loop {
                    tokio::select! {
                        _ = resume.notified() => break,
                        next = read.next() => match next {
                            Some(Ok(next @ (Message::Text(_) | Message::Binary(_)))) => {
                                held_back = Some(next);
                                resume.notified().await;
                                break;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                let _ = events.send(ConnEvent::Pong { id });
                            }
                            Some(Ok(_)) => {}
                            Some(Err(error)) => {
                                debug!("read error on connection {}: {}", id, error);
                                let _ = events.send(ConnEvent::Closed { id });
                                return;
                            }
                            None => {
                                let _ = events.send(ConnEvent::Closed { id });
                                return;
                            }
                        },
                    }
                }
            }
            Message::Pong(_) => {
                let _ = events.send(ConnEvent::Pong { id });
            }
            // tungstenite answers pings and close frames internally.
            Message::Ping(_) | Message::Close(_) | Message::Frame(_) => {}
        }
    }
}

/// Drain the outbound queue into the socket. Reply frames, pings, and close
/// frames all pass through here, in order, without backpressure.
async fn writer_task(
    id: u64,
    mut write: SplitSink<WsStream, Message>,
    mut outbound: UnboundedReceiver<Message>,
    events: UnboundedSender<ConnEvent>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(error) = write.send(message).await {
            debug!("write error on connection {}: {}", id, error);
            let _ = events.send(ConnEvent::SendFailed { id });
            return;
        }
    }
    let _ = write.close().await;
}

fn build_schema() -> Result<ConfigStore, ConfigError> {
    let mut store = ConfigStore::new();
    store.register_key("url", ConfigType::String, true, None)?;
    store.register_key("log_prefix", ConfigType::String, false, None)?;
    store.register_key("proxy_url", ConfigType::String, false, None)?;
    store.register_key("proxy_username", ConfigType::String, false, None)?;
    store.register_key("proxy_password", ConfigType::String, false, None)?;
    store.register_key(
        "proxy_timeout",
        ConfigType::Float,
        false,
        Some(ConfigStore::static_default(DEFAULT_PROXY_TIMEOUT_SECS)),
    )?;
    store.register_key(
        "connect_timeout",
        ConfigType::Float,
        false,
        Some(ConfigStore::static_default(DEFAULT_CONNECT_TIMEOUT_SECS)),
    )?;
    store.register_key(
        "ping_interval",
        ConfigType::Float,
        false,
        Some(ConfigStore::static_default(DEFAULT_PING_INTERVAL_SECS)),
    )?;
    store.register_key(
        "ping_timeout",
        ConfigType::Float,
        false,
        Some(ConfigStore::static_default(DEFAULT_PING_TIMEOUT_SECS)),
    )?;
    store.register_key(
        "close_timeout",
        ConfigType::Float,
        false,
        Some(ConfigStore::static_default(DEFAULT_CLOSE_TIMEOUT_SECS)),
    )?;
    store.register_key(
        "reconnect_timeout",
        ConfigType::Float,
        false,
        Some(ConfigStore::static_default(DEFAULT_RECONNECT_TIMEOUT_SECS)),
    )?;
    Ok(store)
}

/// JSON-to-string coercion matching the store's string convertibility.
fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

//! Stream client handle and connection worker.
//!
//! [`StreamClient`] is a cheap, cloneable handle. All connection state lives
//! in a single background worker that owns a [`ConnectionMachine`], the held
//! transport and the reconnect timer, and that invokes registered handlers.
//! Caller commands are always processed ahead of queued transport callbacks.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, warn};
use url::Url;

use crate::retry::RetryPolicy;
use crate::stream::dedup::DEFAULT_SEEN_CAPACITY;
use crate::stream::handlers::{HandlerRegistry, Subscription};
use crate::stream::machine::{Action, ConnectionMachine, ConnectionStatus};
use crate::stream::proto::{StreamEvent, SubscriptionFilter};
use crate::stream::transport::{spawn_transport, TransportEvent, TransportHandle, TransportInput};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const RECONNECT_BASE: Duration = Duration::from_millis(1_000);
    pub const RECONNECT_CAP: Duration = Duration::from_millis(30_000);
    pub const MAX_RECONNECT_ATTEMPTS: usize = 3;
    pub const SEEN_CAPACITY: usize = DEFAULT_SEEN_CAPACITY;
}

/// Static connection configuration for a [`StreamClient`].
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    /// Base websocket endpoint, eg `wss://host/ws`.
    pub endpoint: String,
    /// Credential passed as the `token` query parameter.
    pub token: SecretString,
    /// Server build/version tag. Carried for callers; not used by the protocol.
    pub build_tag: Option<String>,
    /// Automatic reconnect pacing and attempt budget.
    pub reconnect: RetryPolicy,
    /// Number of delivered event ids remembered for duplicate suppression.
    pub dedup_capacity: usize,
}

impl StreamClientOptions {
    pub fn new(endpoint: impl Into<String>, token: SecretString) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            token,
            build_tag: None,
            reconnect: RetryPolicy {
                max_attempts: StreamDefaults::MAX_RECONNECT_ATTEMPTS,
                initial_backoff: StreamDefaults::RECONNECT_BASE,
                max_backoff: StreamDefaults::RECONNECT_CAP,
                jitter: Duration::ZERO,
            },
            dedup_capacity: StreamDefaults::SEEN_CAPACITY,
        }
    }

    pub fn with_build_tag(mut self, build_tag: impl Into<String>) -> Self {
        self.build_tag = Some(build_tag.into());
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_dedup_capacity(mut self, dedup_capacity: usize) -> Self {
        self.dedup_capacity = dedup_capacity;
        self
    }

    /// Builds the websocket URL with the url-encoded `token` query parameter.
    pub fn endpoint_url(&self) -> Result<Url, StreamClientError> {
        let mut url = Url::parse(&self.endpoint)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(StreamClientError::Protocol(format!(
                    "unsupported endpoint scheme `{other}`, expected ws or wss"
                )));
            }
        }
        url.query_pairs_mut()
            .append_pair("token", self.token.expose_secret());
        Ok(url)
    }
}

/// Errors produced by stream configuration and transport handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint could not be parsed as a URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// Stream protocol or configuration contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Point-in-time view of the connection slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamSnapshot {
    /// Last emitted status, `None` before the first connect.
    pub status: Option<ConnectionStatus>,
    /// Current resume cursor.
    pub cursor: u64,
    /// Automatic reconnects made since the last successful open.
    pub reconnect_attempts: usize,
}

#[derive(Debug)]
enum Command {
    Connect {
        cursor: u64,
        filter: Option<SubscriptionFilter>,
    },
    ManualReconnect,
    Disconnect,
}

/// Resumable event-stream client.
///
/// Must be created inside a Tokio runtime. Clones share one connection slot;
/// when the last clone is dropped the worker closes the transport and stops.
#[derive(Clone)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    handlers: Arc<HandlerRegistry>,
    snapshot: watch::Receiver<StreamSnapshot>,
    build_tag: Option<Arc<str>>,
}

impl StreamClient {
    /// Validates the endpoint and spawns the connection worker.
    ///
    /// The client stays idle until [`StreamClient::connect`] is called.
    pub fn new(options: StreamClientOptions) -> Result<Self, StreamClientError> {
        let endpoint = options.endpoint_url()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handlers = HandlerRegistry::new();
        let machine = ConnectionMachine::new(options.reconnect.clone(), options.dedup_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&machine));

        let worker = StreamWorker {
            endpoint,
            machine,
            handlers: Arc::clone(&handlers),
            snapshot: snapshot_tx,
            transport: None,
            timer: None,
        };
        tokio::spawn(worker.run(commands_rx));

        Ok(Self {
            commands: commands_tx,
            handlers,
            snapshot: snapshot_rx,
            build_tag: options.build_tag.map(Arc::from),
        })
    }

    /// Connects from `cursor`, optionally restricted by `filter`.
    ///
    /// Supersedes any connection or pending reconnect already in progress.
    pub fn connect(&self, cursor: u64, filter: Option<SubscriptionFilter>) {
        self.send(Command::Connect { cursor, filter });
    }

    /// Reconnects immediately and resets the automatic attempt budget.
    pub fn manual_reconnect(&self) {
        self.send(Command::ManualReconnect);
    }

    /// Closes the connection and stops automatic reconnects.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Registers a handler for delivered, deduplicated events.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.handlers.add_event(Arc::new(handler))
    }

    /// Registers a handler for connection status transitions.
    pub fn on_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.handlers.add_status(Arc::new(handler))
    }

    /// Returns the latest connection snapshot.
    pub fn snapshot(&self) -> StreamSnapshot {
        *self.snapshot.borrow()
    }

    /// Returns a receiver that observes every snapshot change.
    pub fn watch(&self) -> watch::Receiver<StreamSnapshot> {
        self.snapshot.clone()
    }

    pub fn build_tag(&self) -> Option<&str> {
        self.build_tag.as_deref()
    }

    fn send(&self, command: Command) {
        if let Err(err) = self.commands.send(command) {
            warn!(event = "stream_worker_stopped", command = ?err.0);
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("snapshot", &self.snapshot())
            .field("build_tag", &self.build_tag)
            .finish()
    }
}

struct StreamWorker {
    endpoint: Url,
    machine: ConnectionMachine,
    handlers: Arc<HandlerRegistry>,
    snapshot: watch::Sender<StreamSnapshot>,
    transport: Option<TransportHandle>,
    timer: Option<JoinHandle<()>>,
}

impl StreamWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();

        loop {
            let actions = tokio::select! {
                biased;
                maybe_command = commands.recv() => match maybe_command {
                    Some(Command::Connect { cursor, filter }) => self.machine.connect(cursor, filter),
                    Some(Command::ManualReconnect) => self.machine.manual_reconnect(),
                    Some(Command::Disconnect) => self.machine.disconnect(),
                    None => break,
                },
                Some(TransportInput { generation, event }) = transport_rx.recv() => match event {
                    TransportEvent::Open => self.machine.on_open(generation),
                    TransportEvent::Message(text) => self.machine.on_message(generation, &text),
                    TransportEvent::Error(error) => {
                        debug!(event = "stream_transport_error_reported", generation, error = %error);
                        self.machine.on_error(generation)
                    }
                    TransportEvent::Closed => self.machine.on_close(generation),
                },
                Some(token) = timer_rx.recv() => self.machine.on_timer(token),
            };

            self.perform(actions, &transport_tx, &timer_tx);
            self.snapshot.send_replace(snapshot_of(&self.machine));
        }

        self.shutdown();
    }

    fn perform(
        &mut self,
        actions: Vec<Action>,
        transport_tx: &mpsc::UnboundedSender<TransportInput>,
        timer_tx: &mpsc::UnboundedSender<u64>,
    ) {
        for action in actions {
            match action {
                Action::Open { generation } => {
                    self.transport = Some(spawn_transport(
                        self.endpoint.clone(),
                        generation,
                        transport_tx.clone(),
                    ));
                }
                Action::Close { generation } => {
                    if let Some(transport) = self.transport.take() {
                        if transport.generation() == generation {
                            transport.close();
                        } else {
                            self.transport = Some(transport);
                        }
                    }
                }
                Action::Send {
                    generation,
                    message,
                } => match (self.transport.as_ref(), message.to_text()) {
                    (Some(transport), Ok(text)) if transport.generation() == generation => {
                        transport.send(text);
                    }
                    (_, Err(err)) => {
                        warn!(event = "stream_encode_failed", generation, error = %err);
                    }
                    _ => {}
                },
                Action::Status(status) => self.handlers.dispatch_status(status),
                Action::Deliver(event) => self.handlers.dispatch_event(&event),
                Action::ArmTimer { token, delay } => {
                    self.cancel_timer();
                    let timer_tx = timer_tx.clone();
                    self.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = timer_tx.send(token);
                    }));
                }
                Action::CancelTimer => self.cancel_timer(),
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn shutdown(&mut self) {
        self.cancel_timer();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        debug!(event = "stream_worker_shutdown", cursor = self.machine.cursor());
    }
}

fn snapshot_of(machine: &ConnectionMachine) -> StreamSnapshot {
    StreamSnapshot {
        status: machine.status(),
        cursor: machine.cursor(),
        reconnect_attempts: machine.reconnect_attempts(),
    }
}

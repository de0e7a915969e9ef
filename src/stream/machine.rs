//! Transport-independent connection state machine.
//!
//! [`ConnectionMachine`] holds the cursor, the connection generation, the
//! duplicate filter and the reconnect bookkeeping. Every input is a plain
//! method call and every side effect is returned as an [`Action`] for the
//! caller to perform, so the same machine can sit behind the bundled
//! websocket worker or any other transport.
//!
//! Transport callbacks carry the generation they were opened under. A
//! callback is acted on only if that generation is still current and its
//! transport is still the one held; anything else is ignored.

use std::time::Duration;

use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::stream::dedup::SeenEventIds;
use crate::stream::proto::{ClientMessage, ServerMessage, StreamEvent, SubscriptionFilter};

/// Connection lifecycle status reported to status handlers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Side effect requested by the machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Open a new transport bound to `generation`.
    Open { generation: u64 },
    /// Detach and close the transport bound to `generation`.
    Close { generation: u64 },
    /// Send a frame on the transport bound to `generation`.
    Send {
        generation: u64,
        message: ClientMessage,
    },
    /// Notify status handlers.
    Status(ConnectionStatus),
    /// Notify event handlers.
    Deliver(StreamEvent),
    /// Arm the one-shot reconnect timer. Report `token` back when it fires.
    ArmTimer { token: u64, delay: Duration },
    /// Cancel the pending reconnect timer.
    CancelTimer,
}

/// Resume/replay/reconnect state for one logical connection slot.
#[derive(Debug)]
pub struct ConnectionMachine {
    cursor: u64,
    filter: Option<SubscriptionFilter>,
    generation: u64,
    transport: Option<u64>,
    should_reconnect: bool,
    reconnect_attempts: usize,
    reconnect_timer: Option<u64>,
    next_timer_token: u64,
    exhaustion_reported: bool,
    status: Option<ConnectionStatus>,
    seen: SeenEventIds,
    policy: RetryPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy, seen_capacity: usize) -> Self {
        Self {
            cursor: 0,
            filter: None,
            generation: 0,
            transport: None,
            should_reconnect: false,
            reconnect_attempts: 0,
            reconnect_timer: None,
            next_timer_token: 0,
            exhaustion_reported: false,
            status: None,
            seen: SeenEventIds::new(seen_capacity),
            policy,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last status emitted, `None` before the first connect.
    pub fn status(&self) -> Option<ConnectionStatus> {
        self.status
    }

    pub fn reconnect_attempts(&self) -> usize {
        self.reconnect_attempts
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    pub fn has_pending_timer(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    /// Generation of the transport currently held, if any.
    pub fn active_transport(&self) -> Option<u64> {
        self.transport
    }

    pub fn seen(&self) -> &SeenEventIds {
        &self.seen
    }

    /// Starts a fresh connection from `cursor`, superseding any prior one.
    pub fn connect(&mut self, cursor: u64, filter: Option<SubscriptionFilter>) -> Vec<Action> {
        let mut actions = Vec::new();
        self.cursor = cursor;
        self.filter = filter;
        self.should_reconnect = true;
        self.exhaustion_reported = false;
        self.cancel_timer(&mut actions);
        self.open(&mut actions);
        actions
    }

    /// Forces an immediate reconnect and resets the attempt budget.
    pub fn manual_reconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.should_reconnect = true;
        self.reconnect_attempts = 0;
        self.exhaustion_reported = false;
        self.cancel_timer(&mut actions);
        self.open(&mut actions);
        actions
    }

    /// Stops the connection and suppresses automatic reconnects.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.should_reconnect = false;
        self.cancel_timer(&mut actions);
        self.generation += 1;
        if let Some(generation) = self.transport.take() {
            actions.push(Action::Close { generation });
        }
        self.emit(ConnectionStatus::Disconnected, &mut actions);
        actions
    }

    pub fn on_open(&mut self, generation: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_live(generation) {
            return actions;
        }
        self.reconnect_attempts = 0;
        self.exhaustion_reported = false;
        self.emit(ConnectionStatus::Connected, &mut actions);
        debug!(
            event = "stream_hello_sent",
            generation,
            after_event_id = self.cursor
        );
        actions.push(Action::Send {
            generation,
            message: ClientMessage::Hello {
                after_event_id: self.cursor,
                subscriptions: self.filter.clone(),
            },
        });
        actions
    }

    /// Handles one text frame. Malformed frames are logged and dropped.
    pub fn on_message(&mut self, generation: u64, text: &str) -> Vec<Action> {
        if !self.is_live(generation) {
            return Vec::new();
        }
        match ServerMessage::from_text(text) {
            Ok(message) => self.on_server_message(generation, message),
            Err(err) => {
                warn!(
                    event = "stream_frame_malformed",
                    generation,
                    error = %err
                );
                Vec::new()
            }
        }
    }

    /// Handles one decoded server frame.
    pub fn on_server_message(&mut self, generation: u64, message: ServerMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_live(generation) {
            return actions;
        }
        match message {
            ServerMessage::HelloOk { replay_until } => {
                if replay_until < self.cursor {
                    debug!(
                        event = "stream_hello_ok_behind_cursor",
                        generation,
                        replay_until,
                        cursor = self.cursor
                    );
                }
                self.advance_cursor(replay_until);
            }
            ServerMessage::Event(event) => {
                self.advance_cursor(event.event_id);
                if !self.seen.insert(event.event_id) {
                    debug!(
                        event = "stream_duplicate_dropped",
                        generation,
                        event_id = event.event_id
                    );
                    return actions;
                }
                actions.push(Action::Deliver(event));
            }
        }
        actions
    }

    pub fn on_error(&mut self, generation: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_live(generation) {
            return actions;
        }
        self.emit(ConnectionStatus::Error, &mut actions);
        actions
    }

    pub fn on_close(&mut self, generation: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.is_live(generation) {
            return actions;
        }
        self.transport = None;
        self.emit(ConnectionStatus::Disconnected, &mut actions);
        if self.should_reconnect {
            self.schedule_reconnect(&mut actions);
        }
        actions
    }

    /// Handles the reconnect timer firing. Stale tokens are ignored.
    pub fn on_timer(&mut self, token: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.reconnect_timer != Some(token) {
            return actions;
        }
        self.reconnect_timer = None;
        self.open(&mut actions);
        actions
    }

    fn is_live(&self, generation: u64) -> bool {
        generation == self.generation && self.transport == Some(generation)
    }

    fn advance_cursor(&mut self, candidate: u64) {
        self.cursor = self.cursor.max(candidate);
    }

    fn open(&mut self, actions: &mut Vec<Action>) {
        self.generation += 1;
        if let Some(previous) = self.transport.take() {
            actions.push(Action::Close {
                generation: previous,
            });
        }
        self.emit(ConnectionStatus::Connecting, actions);
        self.transport = Some(self.generation);
        debug!(
            event = "stream_transport_opening",
            generation = self.generation,
            cursor = self.cursor
        );
        actions.push(Action::Open {
            generation: self.generation,
        });
    }

    fn schedule_reconnect(&mut self, actions: &mut Vec<Action>) {
        if !self.should_reconnect {
            return;
        }
        if self.reconnect_attempts >= self.policy.max_attempts {
            if !self.exhaustion_reported {
                self.exhaustion_reported = true;
                warn!(
                    event = "stream_reconnect_exhausted",
                    attempts = self.reconnect_attempts,
                    cursor = self.cursor
                );
            }
            return;
        }

        self.cancel_timer(actions);
        let delay = self.policy.delay_for_attempt(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.next_timer_token += 1;
        let token = self.next_timer_token;
        self.reconnect_timer = Some(token);
        debug!(
            event = "stream_reconnect_scheduled",
            attempt = self.reconnect_attempts,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        actions.push(Action::ArmTimer { token, delay });
    }

    fn cancel_timer(&mut self, actions: &mut Vec<Action>) {
        if self.reconnect_timer.take().is_some() {
            actions.push(Action::CancelTimer);
        }
    }

    fn emit(&mut self, status: ConnectionStatus, actions: &mut Vec<Action>) {
        self.status = Some(status);
        actions.push(Action::Status(status));
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(
            RetryPolicy::reconnect(),
            crate::stream::dedup::DEFAULT_SEEN_CAPACITY,
        )
    }
}

//! Event and status handler registries.
//!
//! Handlers are stored behind `Arc` and snapshotted before each dispatch, so
//! a handler may register or unregister handlers (itself included) while it
//! runs. A handler that panics is logged and does not stop delivery to the
//! others or the connection worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

use crate::stream::machine::ConnectionStatus;
use crate::stream::proto::StreamEvent;

pub type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct HandlerSet<H> {
    next_id: u64,
    entries: Vec<(u64, H)>,
}

impl<H: Clone> HandlerSet<H> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, handler: H) -> u64 {
        self.next_id += 1;
        self.entries.push((self.next_id, handler));
        self.next_id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<H> {
        self.entries.iter().map(|(_, handler)| handler.clone()).collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HandlerKind {
    Event,
    Status,
}

pub(crate) struct HandlerRegistry {
    events: Mutex<HandlerSet<EventHandler>>,
    statuses: Mutex<HandlerSet<StatusHandler>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(HandlerSet::new()),
            statuses: Mutex::new(HandlerSet::new()),
        })
    }

    pub(crate) fn add_event(self: &Arc<Self>, handler: EventHandler) -> Subscription {
        let id = lock(&self.events).insert(handler);
        Subscription::new(self, HandlerKind::Event, id)
    }

    pub(crate) fn add_status(self: &Arc<Self>, handler: StatusHandler) -> Subscription {
        let id = lock(&self.statuses).insert(handler);
        Subscription::new(self, HandlerKind::Status, id)
    }

    /// Invokes every event handler. A panicking handler is logged and skipped.
    pub(crate) fn dispatch_event(&self, event: &StreamEvent) {
        let handlers = lock(&self.events).snapshot();
        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                warn!(
                    event = "stream_handler_panicked",
                    kind = "event",
                    event_id = event.event_id,
                    message = panic_message(payload.as_ref())
                );
            }
        }
    }

    pub(crate) fn dispatch_status(&self, status: ConnectionStatus) {
        let handlers = lock(&self.statuses).snapshot();
        for handler in handlers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(status))) {
                warn!(
                    event = "stream_handler_panicked",
                    kind = "status",
                    status = ?status,
                    message = panic_message(payload.as_ref())
                );
            }
        }
    }

    fn remove(&self, kind: HandlerKind, id: u64) -> bool {
        match kind {
            HandlerKind::Event => lock(&self.events).remove(id),
            HandlerKind::Status => lock(&self.statuses).remove(id),
        }
    }
}

// Handlers never run under the lock, so a poisoned set is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Registration token returned by `on_event` / `on_status`.
///
/// Dropping the token keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    kind: HandlerKind,
    id: u64,
}

impl Subscription {
    fn new(registry: &Arc<HandlerRegistry>, kind: HandlerKind, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            kind,
            id,
        }
    }

    /// Removes exactly the handler this token was issued for.
    ///
    /// Returns `true` only on the call that actually removed it.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.kind, self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

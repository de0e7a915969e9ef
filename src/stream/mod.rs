//! Realtime stream modules.
//!
//! - `client`: public handle and the worker that drives one connection slot.
//! - `machine`: transport-independent resume/dedup/reconnect state machine.
//! - `transport`: websocket task spawned per connection generation.
//! - `dedup`: bounded duplicate filter for event ids.
//! - `handlers`: event and status handler registries.
//! - `proto`: protocol messages shared with the stream service.

/// Stream client handle, options and connection worker.
pub mod client;
/// Bounded duplicate filter.
pub mod dedup;
/// Handler registries and subscription tokens.
pub mod handlers;
/// Connection state machine.
pub mod machine;
/// Stream protocol messages.
pub mod proto;
mod transport;

pub use client::{StreamClient, StreamClientError, StreamClientOptions, StreamSnapshot};
pub use handlers::Subscription;
pub use machine::{Action, ConnectionMachine, ConnectionStatus};
pub use proto::{StreamEvent, SubscriptionFilter};

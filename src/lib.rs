//! Resumable realtime event-stream client.
//!
//! The crate is organized by transport surface:
//! - `stream`: websocket client with cursor resume, duplicate suppression and
//!   bounded automatic reconnects.
//! - `bootstrap`: HTTP client for fetching stream connection settings.
//! - `retry`: shared retry and timeout utilities.

/// Bootstrap settings client.
pub mod bootstrap;
/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Realtime stream client, protocol types, and connection state machine.
pub mod stream;

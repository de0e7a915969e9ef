//! Websocket transport task.
//!
//! Each connection generation gets its own task owning one socket. The task
//! reports `Open`, `Message`, `Error` and `Closed` back to the client worker
//! tagged with the generation it was spawned for; the worker decides whether
//! that generation is still allowed to act.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

/// Callback raised by a transport task.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

/// Transport callback tagged with the generation that produced it.
#[derive(Debug)]
pub(crate) struct TransportInput {
    pub(crate) generation: u64,
    pub(crate) event: TransportEvent,
}

enum TransportCommand {
    Send(String),
    Close,
}

/// Worker-side handle to a running transport task.
pub(crate) struct TransportHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn send(&self, text: String) {
        if self.commands.send(TransportCommand::Send(text)).is_err() {
            debug!(
                event = "stream_transport_send_dropped",
                generation = self.generation
            );
        }
    }

    /// Asks the task to close its socket, or to stop dialing.
    pub(crate) fn close(self) {
        let _ = self.commands.send(TransportCommand::Close);
    }
}

pub(crate) fn spawn_transport(
    endpoint: Url,
    generation: u64,
    events: mpsc::UnboundedSender<TransportInput>,
) -> TransportHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_transport(endpoint, generation, commands_rx, events));
    TransportHandle {
        generation,
        commands: commands_tx,
    }
}

async fn run_transport(
    endpoint: Url,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportInput>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(TransportInput { generation, event });
    };

    let dial = tokio::select! {
        result = connect_async(endpoint.as_str()) => Some(result),
        _ = wait_for_close(&mut commands) => None,
    };
    let mut socket = match dial {
        Some(Ok((socket, _))) => socket,
        Some(Err(err)) => {
            warn!(
                event = "stream_transport_connect_failed",
                generation,
                error = %err
            );
            emit(TransportEvent::Error(err.to_string()));
            emit(TransportEvent::Closed);
            return;
        }
        None => {
            emit(TransportEvent::Closed);
            return;
        }
    };

    emit(TransportEvent::Open);

    loop {
        tokio::select! {
            maybe_command = commands.recv() => {
                match maybe_command {
                    Some(TransportCommand::Send(text)) => {
                        if let Err(err) = socket.send(Message::Text(text.into())).await {
                            warn!(event = "stream_transport_send_failed", generation, error = %err);
                            emit(TransportEvent::Error(err.to_string()));
                            emit(TransportEvent::Closed);
                            return;
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        let _ = socket.close(None).await;
                        emit(TransportEvent::Closed);
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        emit(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => emit(TransportEvent::Message(text)),
                        Err(_) => warn!(event = "stream_binary_frame_dropped", generation, len = bytes.len()),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            emit(TransportEvent::Error(err.to_string()));
                            emit(TransportEvent::Closed);
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            event = "stream_transport_closed_by_peer",
                            generation,
                            code = frame.as_ref().map(|f| u16::from(f.code)),
                            reason = frame.as_ref().map(|f| f.reason.as_str()).unwrap_or("")
                        );
                        emit(TransportEvent::Closed);
                        return;
                    }
                    Some(Err(err)) => {
                        warn!(event = "stream_transport_error", generation, error = %err);
                        emit(TransportEvent::Error(err.to_string()));
                        emit(TransportEvent::Closed);
                        return;
                    }
                    None => {
                        emit(TransportEvent::Closed);
                        return;
                    }
                }
            }
        }
    }
}

async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<TransportCommand>) {
    loop {
        match commands.recv().await {
            Some(TransportCommand::Close) | None => return,
            // nothing can be sent before open
            Some(TransportCommand::Send(_)) => {}
        }
    }
}

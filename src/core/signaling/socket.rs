//! WebSocket task for one link generation.
//!
//! Connects, reports `Opened`, relays parsed envelopes and finally reports
//! `Closed` with the close code (if any). Outbound envelopes are handed over
//! through a [`SocketHandle`].

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::core::config::LINK_CONNECT_TIMEOUT;
use crate::core::signaling::envelope::SignalingEnvelope;

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Envelope(SignalingEnvelope),
    Closed { code: Option<u16> },
}

enum SocketCommand {
    Send(String),
    Close,
}

/// Write side of a running socket task. Dropping it closes the socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<SocketCommand>,
}

impl std::fmt::Debug for SocketCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketCommand::Send(_) => f.write_str("Send"),
            SocketCommand::Close => f.write_str("Close"),
        }
    }
}

impl SocketHandle {
    pub fn send(&self, envelope: &SignalingEnvelope) -> anyhow::Result<()> {
        let text = envelope.to_json()?;
        self.commands
            .send(SocketCommand::Send(text))
            .map_err(|_| anyhow::anyhow!("signaling socket task has exited"))
    }

    pub fn close(&self) {
        let _ = self.commands.send(SocketCommand::Close);
    }
}

/// Opens the socket for one link generation.
pub trait Connector: Send + Sync {
    fn open(&self, generation: u64, report: Box<dyn Fn(SocketEvent) + Send>) -> SocketHandle;
}

/// Connects to the relay over WebSocket.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn open(&self, generation: u64, report: Box<dyn Fn(SocketEvent) + Send>) -> SocketHandle {
        debug!(event = "link_socket_open", url = %self.url, generation, "Opening signaling socket");
        spawn_socket(self.url.clone(), report)
    }
}

/// Spawn the socket task for `url`.
pub fn spawn_socket<F>(url: String, report: F) -> SocketHandle
where
    F: Fn(SocketEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_socket(url, rx, report));
    SocketHandle { commands: tx }
}

async fn run_socket<F>(url: String, mut commands: mpsc::UnboundedReceiver<SocketCommand>, report: F)
where
    F: Fn(SocketEvent) + Send + 'static,
{
    let stream = match tokio::time::timeout(LINK_CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(event = "link_connect_failure", url = %url, error = %e, "Could not reach relay");
            report(SocketEvent::Closed { code: None });
            return;
        }
        Err(_) => {
            warn!(event = "link_connect_timeout", url = %url, "Relay handshake timed out");
            report(SocketEvent::Closed { code: None });
            return;
        }
    };
    report(SocketEvent::Opened);
    let (mut write, mut read) = stream.split();

    let code = loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!(event = "link_send_failure", error = %e, "Failed to write to relay");
                        break None;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break Some(u16::from(CloseCode::Normal));
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match SignalingEnvelope::from_json(&text) {
                    Ok(envelope) => report(SocketEvent::Envelope(envelope)),
                    Err(e) => warn!(event = "envelope_parse_failure", error = %e, "Ignoring malformed envelope"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|f| u16::from(f.code));
                }
                Some(Ok(other)) => {
                    debug!(event = "link_frame_ignored", kind = ?std::mem::discriminant(&other), "Ignoring non-text frame");
                }
                Some(Err(e)) => {
                    warn!(event = "link_read_failure", error = %e, "Relay connection error");
                    break None;
                }
                None => break None,
            },
        }
    };
    report(SocketEvent::Closed { code });
}

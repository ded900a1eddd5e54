//! Signaling relay: a WebSocket server that only passes envelopes between
//! registered peers.

pub mod hub;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::core::config::RELAY_CLIENT_QUEUE;
use crate::core::signaling::SignalingEnvelope;
use crate::utils::sos::SignalOfStop;
use hub::{ConnId, Delivery, Hub};

#[derive(Default)]
struct RelayState {
    hub: Hub,
    clients: HashMap<ConnId, mpsc::Sender<String>>,
}

impl RelayState {
    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for Delivery { conn, envelope } in deliveries {
            let Some(tx) = self.clients.get(&conn) else {
                continue;
            };
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(event = "relay_encode_failure", error = %e, "Could not encode envelope");
                    continue;
                }
            };
            if let Err(e) = tx.try_send(text) {
                warn!(event = "relay_client_backlogged", conn, error = %e, "Dropping envelope for slow client");
            }
        }
    }
}

/// Accept connections on `listen` until `sos` fires.
pub async fn run(listen: &str, sos: SignalOfStop) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding relay to {listen}"))?;
    info!(event = "relay_listening", addr = %listener.local_addr()?, "Signaling relay listening");

    let state = Arc::new(Mutex::new(RelayState::default()));
    let next_conn = AtomicU64::new(1);

    loop {
        let accepted = tokio::select! {
            _ = sos.wait() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                debug!(event = "relay_accept", conn, addr = %addr, "Incoming connection");
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, stream, state).await {
                        warn!(event = "relay_connection_error", conn, error = %e, "Connection ended with error");
                    }
                });
            }
            Err(e) => warn!(event = "relay_accept_failure", error = %e, "Accept failed"),
        }
    }
    info!(event = "relay_stopped", "Signaling relay stopped");
    Ok(())
}

async fn handle_connection(conn: ConnId, stream: TcpStream, state: Arc<Mutex<RelayState>>) -> Result<()> {
    let ws = accept_async(stream).await.context("websocket handshake")?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::channel::<String>(RELAY_CLIENT_QUEUE);
    state.lock().await.clients.insert(conn, tx);

    let forward = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                debug!(event = "relay_write_failure", conn, error = %e, "Client write failed");
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match SignalingEnvelope::from_json(&text) {
                Ok(envelope) => {
                    let mut state = state.lock().await;
                    let deliveries = state.hub.on_message(conn, envelope);
                    state.dispatch(deliveries);
                }
                Err(e) => debug!(event = "relay_parse_failure", conn, error = %e, "Ignoring malformed message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(event = "relay_read_failure", conn, error = %e, "Client read failed");
                break;
            }
        }
    }

    {
        let mut state = state.lock().await;
        state.clients.remove(&conn);
        let deliveries = state.hub.on_close(conn);
        state.dispatch(deliveries);
    }
    forward.abort();
    Ok(())
}

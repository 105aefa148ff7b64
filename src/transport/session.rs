//! Persistent backend connection with automatic reconnect.
//!
//! The session owns a background tokio task that opens a socket.io link over
//! a websocket, answers heartbeats, decodes events and writes queued
//! commands. Decoded events go to a single consumer over a crossbeam channel
//! so the ingestion loop can run on a plain thread.

use crossbeam_channel::{Sender, TrySendError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::transport::backoff::{Backoff, BackoffConfig};
use crate::transport::command::{Command, EventSink};
use crate::transport::envelope::{ConnectionState, Envelope, InboundEvent, TransportError};
use crate::transport::socketio::{self, Handshake, Packet};

/// Budget for the websocket upgrade plus the namespace join.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Backend host; an `http://` or `https://` prefix is ignored
    pub host: String,
    pub port: u16,
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            port: 3000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// `host:port` with any URL scheme and trailing slash removed.
    pub fn address(&self) -> String {
        let host = self.host.trim();
        let host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host)
            .trim_end_matches('/');
        format!("{}:{}", host, self.port)
    }

    /// Websocket URL of the backend's socket.io endpoint.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.address(), socketio::ENGINE_IO_PATH)
    }
}

/// Handle to a running connection loop.
///
/// Dropping the handle stops the loop as well.
pub struct TransportSession {
    outbound: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    address: String,
}

impl TransportSession {
    /// Start the connection loop. Must be called within a tokio runtime.
    ///
    /// Decoded inbound events, including synthesized
    /// [`InboundEvent::Connection`] changes, are sent to `inbound`.
    pub fn connect(config: &ConnectionConfig, inbound: Sender<InboundEvent>) -> Self {
        let address = config.address();
        let url = config.url();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_loop(
            url,
            config.backoff,
            inbound,
            outbound_rx,
            state_tx,
            shutdown_rx,
        ));

        Self {
            outbound: outbound_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the loop. Safe to call more than once.
    pub fn disconnect(&self) {
        if !*self.shutdown.borrow() {
            info!("Disconnecting from {}", self.address);
        }
        self.shutdown.send_replace(true);
    }

    /// Disconnect and wait for the background task to finish.
    pub async fn shutdown(&self) {
        self.disconnect();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Transport task ended abnormally: {}", e);
            }
        }
    }
}

impl EventSink for TransportSession {
    fn emit(&self, command: Command) {
        debug!("Queueing {}", command.event_name());
        let _ = self.outbound.send(command);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

enum ConnectionEnd {
    Closed,
    Shutdown,
}

async fn run_loop(
    url: String,
    backoff_config: BackoffConfig,
    inbound: Sender<InboundEvent>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(backoff_config);

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Commands issued while the link was down are not replayed
        let mut discarded = 0usize;
        while outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} commands queued while disconnected", discarded);
        }

        publish(&state, &inbound, ConnectionState::Connecting);
        let opened = tokio::select! {
            result = tokio::time::timeout(HANDSHAKE_TIMEOUT, open(&url)) => result
                .unwrap_or_else(|_| Err(TransportError::Protocol("handshake timed out".to_string()))),
            _ = shutdown.changed() => break,
        };

        match opened {
            Ok((write, read, handshake)) => {
                info!("Connected to {} (sid {})", url, handshake.sid);
                backoff.reset();
                publish(&state, &inbound, ConnectionState::Connected);
                let end = serve(write, read, &handshake, &inbound, &mut outbound, &mut shutdown).await;
                publish(&state, &inbound, ConnectionState::Disconnected);
                if let ConnectionEnd::Shutdown = end {
                    break;
                }
                info!("Connection to {} lost", url);
            }
            Err(e) => {
                publish(&state, &inbound, ConnectionState::Disconnected);
                warn!("Connect to {} failed: {}", url, e);
            }
        }

        let delay = backoff.next_delay();
        warn!(
            "Reconnecting to {} in {} ms (attempt {})",
            url,
            delay.as_millis(),
            backoff.attempts()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    if *state.borrow() != ConnectionState::Disconnected {
        publish(&state, &inbound, ConnectionState::Disconnected);
    }
    debug!("Transport loop for {} exited", url);
}

/// Upgrade to a websocket, wait for the Engine.IO open packet and join the
/// default namespace. The link only counts as connected once the join is
/// acknowledged.
async fn open(url: &str) -> Result<(WsWrite, WsRead, Handshake), TransportError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    let (mut write, mut read) = ws.split();

    let handshake = loop {
        match next_packet(&mut read).await? {
            Packet::Open(handshake) => break handshake,
            Packet::Noop | Packet::Ignored => {}
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
        }
    };

    send_text(&mut write, socketio::CONNECT_PACKET).await?;
    loop {
        match next_packet(&mut read).await? {
            Packet::Connected => return Ok((write, read, handshake)),
            Packet::ConnectError(reason) => {
                return Err(TransportError::Protocol(format!(
                    "namespace join refused: {}",
                    reason
                )))
            }
            Packet::Ping => send_text(&mut write, socketio::PONG_PACKET).await?,
            Packet::Close | Packet::Disconnected => {
                return Err(TransportError::Protocol("closed during handshake".to_string()))
            }
            _ => {}
        }
    }
}

/// Next text frame as a packet; control frames are skipped.
async fn next_packet(read: &mut WsRead) -> Result<Packet, TransportError> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return socketio::decode(text.as_str()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Protocol("connection closed".to_string()))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_text(write: &mut WsWrite, text: &str) -> Result<(), TransportError> {
    write.send(Message::text(text.to_string())).await?;
    Ok(())
}

async fn serve(
    mut write: WsWrite,
    mut read: WsRead,
    handshake: &Handshake,
    inbound: &Sender<InboundEvent>,
    outbound: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let heartbeat = handshake.heartbeat_timeout();
    let silence = tokio::time::sleep(heartbeat);
    tokio::pin!(silence);

    loop {
        tokio::select! {
            message = read.next() => {
                silence.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                match message {
                    Some(Ok(Message::Text(text))) => match socketio::decode(text.as_str()) {
                        Ok(Packet::Ping) => {
                            if let Err(e) = send_text(&mut write, socketio::PONG_PACKET).await {
                                warn!("Heartbeat reply failed: {}", e);
                                return ConnectionEnd::Closed;
                            }
                        }
                        Ok(Packet::Event(envelope)) => dispatch(envelope, inbound),
                        Ok(Packet::Close | Packet::Disconnected) => {
                            info!("Backend closed the session");
                            return ConnectionEnd::Closed;
                        }
                        Ok(Packet::ConnectError(reason)) => {
                            warn!("Backend dropped the namespace: {}", reason);
                            return ConnectionEnd::Closed;
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Dropping undecodable packet: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Read failed: {}", e);
                        return ConnectionEnd::Closed;
                    }
                }
            }
            command = outbound.recv() => match command {
                Some(command) => {
                    let text = match socketio::encode_event(&command.to_envelope()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode {}: {}", command.event_name(), e);
                            continue;
                        }
                    };
                    if let Err(e) = send_text(&mut write, &text).await {
                        warn!("Write failed: {}", e);
                        return ConnectionEnd::Closed;
                    }
                }
                None => return ConnectionEnd::Shutdown,
            },
            _ = &mut silence => {
                warn!("No heartbeat from backend for {} ms", heartbeat.as_millis());
                return ConnectionEnd::Closed;
            }
            _ = shutdown.changed() => {
                let _ = send_text(&mut write, socketio::DISCONNECT_PACKET).await;
                let _ = write.close().await;
                return ConnectionEnd::Shutdown;
            }
        }
    }
}

fn dispatch(envelope: Envelope, inbound: &Sender<InboundEvent>) {
    match InboundEvent::from_envelope(envelope) {
        Ok(Some(event)) => forward(inbound, event),
        Ok(None) => {}
        Err(e) => debug!("Dropping undecodable event: {}", e),
    }
}

fn forward(inbound: &Sender<InboundEvent>, event: InboundEvent) {
    match inbound.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Inbound queue full, dropping event"),
        Err(TrySendError::Disconnected(_)) => debug!("Inbound consumer gone"),
    }
}

fn publish(state: &watch::Sender<ConnectionState>, inbound: &Sender<InboundEvent>, next: ConnectionState) {
    if *state.borrow() == next {
        return;
    }
    state.send_replace(next);
    forward(inbound, InboundEvent::Connection(next));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_strips_scheme() {
        let mut config = ConnectionConfig::default();
        assert_eq!(config.address(), "localhost:3000");

        config.host = "https://10.0.0.5/".to_string();
        config.port = 8080;
        assert_eq!(config.address(), "10.0.0.5:8080");

        config.host = "backend.local".to_string();
        assert_eq!(config.address(), "backend.local:8080");
    }

    #[test]
    fn test_url_targets_socketio_endpoint() {
        let config = ConnectionConfig::default();
        assert_eq!(
            config.url(),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );
    }
}

//! WebSocket client for the board relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, bounded reconnect)
//! - A cloneable, synchronous [`RelaySink`] handle for outgoing messages
//! - An event channel carrying inbound [`ServerMessage`]s and transport changes
//!
//! ```text
//! RelayHandle::send ── bincode ──► outgoing mpsc ──► writer task ──► ws
//! ws ──► reader task ── decode ──► event mpsc ──► RelayEvent::Inbound
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the relay client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    /// Transport lost. Remote drags and locks can no longer be trusted.
    Disconnected,
    Inbound(ServerMessage),
}

/// Outgoing side of the relay, as the session sees it.
///
/// Sending never blocks: pointer traffic is produced from UI callbacks.
pub trait RelaySink {
    fn send(&self, msg: ClientMessage) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub outgoing_capacity: usize,
    pub event_capacity: usize,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outgoing_capacity: 256,
            event_capacity: 256,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

type Outgoing = Arc<StdMutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// Cloneable handle onto the current connection's writer.
///
/// Survives reconnects: the client swaps the sender underneath it.
#[derive(Clone)]
pub struct RelayHandle {
    outgoing: Outgoing,
}

impl RelaySink for RelayHandle {
    fn send(&self, msg: ClientMessage) -> Result<(), SyncError> {
        let encoded = msg.encode()?;
        let guard = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(ProtocolError::ConnectionClosed.into());
        };
        tx.try_send(encoded).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                log::debug!("Outgoing queue full, dropping {}", msg.name());
                SyncError::Transient(ProtocolError::Timeout)
            }
            mpsc::error::TrySendError::Closed(_) => {
                SyncError::Transient(ProtocolError::ConnectionClosed)
            }
        })
    }
}

/// The relay client.
pub struct RelayClient {
    url: String,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: Outgoing,
    event_tx: mpsc::Sender<RelayEvent>,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            url: url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing: Arc::new(StdMutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Sink for the session. Valid across reconnects.
    pub fn sink(&self) -> RelayHandle {
        RelayHandle {
            outgoing: self.outgoing.clone(),
        }
    }

    /// Connect to the relay and spawn the writer and reader tasks.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Connect to {} failed: {e}", self.url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outgoing_capacity);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        *self.outgoing.lock().unwrap_or_else(|e| e.into_inner()) = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to relay at {}", self.url);
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: decode inbound frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            log::trace!("Received {}", server_msg.name());
                            if event_tx.send(RelayEvent::Inbound(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            outgoing.lock().unwrap_or_else(|e| e.into_inner()).take();
            *state.write().await = ConnectionState::Disconnected;
            log::info!("Relay connection closed");
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Retry [`connect`](Self::connect) up to `reconnect_attempts` times.
    pub async fn reconnect(&self) -> Result<(), ProtocolError> {
        for attempt in 1..=self.config.reconnect_attempts {
            *self.state.write().await = ConnectionState::Reconnecting;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "Reconnect attempt {attempt}/{} failed: {e}",
                        self.config.reconnect_attempts
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Err(ProtocolError::ConnectionClosed)
    }

    /// Close the connection. The reader task emits `Disconnected`.
    pub fn disconnect(&self) {
        self.outgoing.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Sink that records every message instead of sending it.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        sent: Arc<StdMutex<Vec<ClientMessage>>>,
        fail: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn take(&self) -> Vec<ClientMessage> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl RelaySink for RecordingSink {
        fn send(&self, msg: ClientMessage) -> Result<(), SyncError> {
            if self.fail {
                return Err(ProtocolError::ConnectionClosed.into());
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }
}

//! Message transport under a connection.
//!
//! ```text
//!             outbound (mpsc)                 inbound (mpsc)
//! Connection ─────────────────► writer task   reader task ─────────────────► Connection
//!                                  │              ▲
//!                                  ▼              │
//!                               WebSocket ────────┘
//! ```
//!
//! A `Transport` is only a pair of channels, so tests can stand in for the
//! server with [`Transport::memory`].

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

/// Frame or command sent towards the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One delivery of bytes; not necessarily one whole frame
    Message(Vec<u8>),
    Error(String),
    Closed,
}

/// Both directions of an open transport.
pub struct Transport {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

impl Transport {
    /// Open a WebSocket and spawn its reader and writer tasks.
    pub async fn connect(url: &str, capacity: usize) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(format!("failed to connect to {url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("Connected to {url}");

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(capacity);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(data) => {
                        if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward WebSocket deliveries to the connection
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let event = match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        TransportEvent::Message(bytes)
                    }
                    Ok(Message::Text(text)) => TransportEvent::Message(text.as_str().as_bytes().to_vec()),
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                    _ => continue,
                };
                if in_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = in_tx.send(TransportEvent::Closed).await;
        });

        Ok(Self { outbound: out_tx, inbound: in_rx })
    }

    /// In-memory transport whose far end is driven by the caller.
    pub fn memory(capacity: usize) -> (Self, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Self { outbound: out_tx, inbound: in_rx },
            MemoryPeer { received: out_rx, deliver: in_tx },
        )
    }
}

/// Server side of [`Transport::memory`].
pub struct MemoryPeer {
    pub received: mpsc::Receiver<Outbound>,
    pub deliver: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next frame the client sent, `None` once it closed.
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        match self.received.recv().await? {
            Outbound::Frame(bytes) => Some(bytes),
            Outbound::Close => None,
        }
    }

    pub async fn send(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.deliver.send(TransportEvent::Message(bytes.into())).await;
    }

    pub async fn close(&self) {
        let _ = self.deliver.send(TransportEvent::Closed).await;
    }
}

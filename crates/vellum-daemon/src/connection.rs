//! Individual client connection management.
//!
//! Each connection wraps a WebSocket stream, splitting it so a spawned read
//! task can parse incoming frames while the write half is shared for
//! snapshot pushes and batch acks.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

use crate::message::{ClientMessage, MAX_MESSAGE_SIZE, ServerMessage};

/// Identifies one connection for the lifetime of the daemon process.
pub type ConnId = u64;

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A parsed client message.
    Message { conn_id: ConnId, msg: ClientMessage },
    /// The connection closed (client hangup or protocol error).
    Closed { conn_id: ConnId },
}

/// A single WebSocket connection to a store client.
pub struct ClientConnection {
    pub conn_id: ConnId,
    /// Write half, shared so snapshot fan-out and acks can interleave.
    write: Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>,
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap a fresh WebSocket stream, spawning its read task.
    pub fn new(
        conn_id: ConnId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_task = tokio::spawn(async move {
            Self::read_loop(conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: ConnId,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from conn-{}", conn_id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from conn-{} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match ClientMessage::from_binary(&data) {
                        Some(msg) => {
                            let _ = event_tx.send(ConnectionEvent::Message { conn_id, msg });
                        }
                        None => {
                            // A malformed frame is a client bug, not a reason
                            // to drop the connection.
                            warn!("Unparseable frame from conn-{} ({} bytes)", conn_id, data.len());
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection conn-{} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on conn-{}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection conn-{} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send a server message as a binary WebSocket frame.
    pub async fn send(&self, msg: &ServerMessage) -> Result<()> {
        let data = msg.to_binary();
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

//! WebSocket server for accepting store client connections.
//!
//! Owns the connection registry and the event channel the read tasks feed.
//! There is no handshake — a client's first `subscribe` is its hello; the
//! daemon layer above tracks which connection watches which project.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info};

use crate::connection::{ClientConnection, ConnId, ConnectionEvent};
use crate::message::ServerMessage;

/// WebSocket server managing store client connections.
pub struct StoreServer {
    connections: HashMap<ConnId, ClientConnection>,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl StoreServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            connections: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Store server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade a new TCP connection to WebSocket and register it.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and immediately hang up without
                // finishing the WebSocket upgrade; keep those quiet.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        info!("New client from {} (conn-{})", addr, conn_id);

        let conn = ClientConnection::new(conn_id, ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    /// Wait for the next connection event. Closed connections are dropped
    /// from the registry before the event is surfaced, so the daemon layer
    /// never sees a stale conn id it could still send to.
    pub async fn poll_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.event_rx.recv().await?;
        if let ConnectionEvent::Closed { conn_id } = &event {
            self.connections.remove(conn_id);
        }
        Some(event)
    }

    /// Send a message to one client.
    pub async fn send(&self, conn_id: ConnId, msg: &ServerMessage) -> Result<()> {
        let conn = self
            .connections
            .get(&conn_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown connection: conn-{}", conn_id))?;
        conn.send(msg).await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection gracefully (daemon shutdown).
    pub async fn close_all(&mut self) {
        info!("Closing {} connection(s)", self.connection_count());
        for conn in self.connections.values_mut() {
            conn.close().await;
        }
        self.connections.clear();
    }
}

impl Default for StoreServer {
    fn default() -> Self {
        Self::new()
    }
}

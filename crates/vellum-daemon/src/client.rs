//! `RemoteStore`: the store client for a daemon over WebSocket.
//!
//! Implements `vellum_core::RecordStore`, so a `ProjectSession` runs against
//! a daemon exactly as it runs against the in-memory store. A spawned read
//! task routes server messages: snapshots feed per-project watch channels
//! after boundary validation, batch acks resolve pending submissions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::Message,
};
use tracing::{debug, error, warn};

use vellum_core::planner::MutationPlan;
use vellum_core::record::{FileRecord, ProjectId, decode_records};
use vellum_core::store::{RecordStore, StoreError};

use crate::message::{ClientMessage, MAX_MESSAGE_SIZE, ServerMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct RemoteInner {
    write: Mutex<WsSink>,
    /// One watch channel per subscribed project, fed by the read task.
    subscriptions: StdMutex<HashMap<ProjectId, watch::Sender<Vec<FileRecord>>>>,
    /// Batch submissions waiting for their ack.
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<(), StoreError>>>>,
    next_batch_id: AtomicU64,
}

impl RemoteInner {
    async fn send(&self, msg: &ClientMessage) -> Result<(), StoreError> {
        let data = msg.to_binary();
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))
    }

    fn on_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Snapshot { project_id, files } => {
                let (records, quarantined) = decode_records(&files);
                if quarantined > 0 {
                    warn!(
                        "Snapshot for {} contained {} malformed record(s)",
                        project_id, quarantined
                    );
                }
                let subscriptions = self.subscriptions.lock().unwrap();
                match subscriptions.get(&project_id) {
                    Some(sender) => {
                        sender.send_replace(records);
                    }
                    None => {
                        debug!("Snapshot for unsubscribed project {}", project_id);
                    }
                }
            }
            ServerMessage::BatchApplied { batch_id } => {
                self.resolve_batch(batch_id, Ok(()));
            }
            ServerMessage::BatchRejected { batch_id, reason } => {
                self.resolve_batch(batch_id, Err(StoreError::Rejected(reason)));
            }
        }
    }

    fn resolve_batch(&self, batch_id: u64, result: Result<(), StoreError>) {
        let sender = self.pending.lock().unwrap().remove(&batch_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                warn!("Ack for unknown batch {}", batch_id);
            }
        }
    }

    /// Connection is gone: fail in-flight batches and end every live query.
    fn shutdown(&self) {
        self.pending.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

/// A `RecordStore` speaking the daemon's wire protocol.
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
    read_task: JoinHandle<()>,
}

impl RemoteStore {
    /// Connect to a daemon, e.g. `ws://127.0.0.1:9470`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        let (write, read) = ws_stream.split();

        let inner = Arc::new(RemoteInner {
            write: Mutex::new(write),
            subscriptions: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            next_batch_id: AtomicU64::new(1),
        });

        let read_inner = Arc::clone(&inner);
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_inner, read).await;
        });

        Ok(Self { inner, read_task })
    }

    async fn read_loop(inner: Arc<RemoteInner>, mut read: WsSource) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Binary(data) => data.to_vec(),
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => break,
                        Message::Frame(_) => continue,
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!("Oversized frame from daemon ({} bytes), dropping", data.len());
                        continue;
                    }

                    match ServerMessage::from_binary(&data) {
                        Some(msg) => inner.on_server_message(msg),
                        None => warn!("Unparseable frame from daemon ({} bytes)", data.len()),
                    }
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                None => {
                    debug!("Daemon connection ended");
                    break;
                }
            }
        }
        inner.shutdown();
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.read_task.abort();
        self.inner.shutdown();
    }
}

#[async_trait]
impl RecordStore for RemoteStore {
    /// Open a live query. Resolves once the daemon has delivered the first
    /// snapshot, so the returned receiver holds real data immediately —
    /// matching the in-memory store's contract.
    async fn subscribe(
        &self,
        project: ProjectId,
    ) -> Result<watch::Receiver<Vec<FileRecord>>, StoreError> {
        let (mut rx, fresh) = {
            let mut subscriptions = self.inner.subscriptions.lock().unwrap();
            match subscriptions.get(&project) {
                Some(sender) => (sender.subscribe(), false),
                None => {
                    let (tx, rx) = watch::channel(Vec::new());
                    subscriptions.insert(project, tx);
                    (rx, true)
                }
            }
        };

        if fresh {
            self.inner
                .send(&ClientMessage::Subscribe {
                    project_id: project,
                })
                .await?;
            rx.changed()
                .await
                .map_err(|_| StoreError::Unreachable("connection closed".into()))?;
        }
        Ok(rx)
    }

    async fn submit_batch(
        &self,
        project: ProjectId,
        plan: MutationPlan,
    ) -> Result<(), StoreError> {
        let batch_id = self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(batch_id, tx);

        let sent = self
            .inner
            .send(&ClientMessage::SubmitBatch {
                project_id: project,
                batch_id,
                ops: plan,
            })
            .await;
        if let Err(e) = sent {
            self.inner.pending.lock().unwrap().remove(&batch_id);
            return Err(e);
        }

        rx.await
            .map_err(|_| StoreError::Unreachable("connection closed".into()))?
    }
}

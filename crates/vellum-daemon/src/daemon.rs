//! Daemon state: authoritative record sets, subscriptions, batch handling.
//!
//! All mutations flow through `vellum_core::store::apply_plan`, so the
//! daemon's atomicity semantics are exactly the ones the core tests pin
//! down: a batch either lands whole and every subscriber sees one new
//! snapshot, or it is rejected and nothing changes.

use std::collections::{HashMap, HashSet, hash_map::Entry};

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use vellum_core::planner::MutationPlan;
use vellum_core::record::{FileRecord, ProjectId};
use vellum_core::store::apply_plan;

use crate::connection::{ConnId, ConnectionEvent};
use crate::message::{ClientMessage, ServerMessage};
use crate::persistence::ProjectStorage;
use crate::server::StoreServer;

pub struct Daemon {
    storage: ProjectStorage,
    /// Record sets loaded from disk on first touch.
    projects: HashMap<ProjectId, Vec<FileRecord>>,
    /// Which connections hold a live query on which project.
    subscribers: HashMap<ProjectId, HashSet<ConnId>>,
    server: StoreServer,
}

impl Daemon {
    pub fn new(storage: ProjectStorage, server: StoreServer) -> Self {
        Self {
            storage,
            projects: HashMap::new(),
            subscribers: HashMap::new(),
            server,
        }
    }

    /// Run the accept/event loop until ctrl-c.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        info!("Daemon running. Press Ctrl+C to stop.");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.server.accept_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(event) = self.server.poll_event() => {
                    match event {
                        ConnectionEvent::Message { conn_id, msg } => {
                            self.handle_message(conn_id, msg).await;
                        }
                        ConnectionEvent::Closed { conn_id } => {
                            self.on_disconnected(conn_id);
                        }
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.server.close_all().await;
        info!("Shutting down");
        Ok(())
    }

    pub async fn handle_message(&mut self, conn_id: ConnId, msg: ClientMessage) {
        match msg {
            ClientMessage::Subscribe { project_id } => {
                self.on_subscribe(conn_id, project_id).await;
            }
            ClientMessage::SubmitBatch {
                project_id,
                batch_id,
                ops,
            } => {
                self.on_submit_batch(conn_id, project_id, batch_id, ops).await;
            }
        }
    }

    async fn on_subscribe(&mut self, conn_id: ConnId, project: ProjectId) {
        if let Err(e) = self.load_project(project) {
            error!("Failed to load project {}: {}", project, e);
            return;
        }
        self.subscribers.entry(project).or_default().insert(conn_id);
        debug!("conn-{} subscribed to project {}", conn_id, project);

        let snapshot = self.snapshot_message(project);
        if let Err(e) = self.server.send(conn_id, &snapshot).await {
            warn!("Failed to send snapshot to conn-{}: {}", conn_id, e);
        }
    }

    async fn on_submit_batch(
        &mut self,
        conn_id: ConnId,
        project: ProjectId,
        batch_id: u64,
        plan: MutationPlan,
    ) {
        if let Err(e) = self.load_project(project) {
            error!("Failed to load project {}: {}", project, e);
            self.reject(conn_id, batch_id, &format!("storage error: {}", e))
                .await;
            return;
        }

        let records = self.projects.entry(project).or_default();
        if let Err(e) = apply_plan(project, records, &plan) {
            debug!("Rejected batch {} from conn-{}: {}", batch_id, conn_id, e);
            self.reject(conn_id, batch_id, &e.to_string()).await;
            return;
        }

        // The batch is only acknowledged once it is durable.
        if let Err(e) = self.storage.save(project, records) {
            error!("Failed to persist project {}: {}", project, e);
            self.reject(conn_id, batch_id, &format!("storage error: {}", e))
                .await;
            return;
        }

        if let Err(e) = self
            .server
            .send(conn_id, &ServerMessage::BatchApplied { batch_id })
            .await
        {
            warn!("Failed to ack batch {} to conn-{}: {}", batch_id, conn_id, e);
        }

        self.broadcast_snapshot(project).await;
    }

    pub fn on_disconnected(&mut self, conn_id: ConnId) {
        info!("Client disconnected: conn-{}", conn_id);
        for watchers in self.subscribers.values_mut() {
            watchers.remove(&conn_id);
        }
    }

    fn load_project(&mut self, project: ProjectId) -> Result<()> {
        if let Entry::Vacant(entry) = self.projects.entry(project) {
            let records = self.storage.load(project)?;
            debug!("Loaded project {} ({} records)", project, records.len());
            entry.insert(records);
        }
        Ok(())
    }

    fn snapshot_message(&self, project: ProjectId) -> ServerMessage {
        let files = self
            .projects
            .get(&project)
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| match serde_json::to_value(record) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            error!("Failed to serialize record {}: {}", record.id, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        ServerMessage::Snapshot {
            project_id: project,
            files,
        }
    }

    async fn broadcast_snapshot(&mut self, project: ProjectId) {
        let Some(watchers) = self.subscribers.get(&project) else {
            return;
        };
        let snapshot = self.snapshot_message(project);
        for &conn_id in watchers {
            if let Err(e) = self.server.send(conn_id, &snapshot).await {
                warn!("Failed to push snapshot to conn-{}: {}", conn_id, e);
            }
        }
    }

    async fn reject(&self, conn_id: ConnId, batch_id: u64, reason: &str) {
        let msg = ServerMessage::BatchRejected {
            batch_id,
            reason: reason.to_string(),
        };
        if let Err(e) = self.server.send(conn_id, &msg).await {
            warn!("Failed to send rejection to conn-{}: {}", conn_id, e);
        }
    }
}

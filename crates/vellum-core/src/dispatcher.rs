//! Sync dispatcher: the only layer that talks to the store.
//!
//! Structural plans (create, rename, move, delete, toggle) go out immediately
//! as one atomic batch each. Content edits never dispatch directly — the
//! `ContentCoalescer` holds the latest value per file behind a quiet window
//! and writes once typing pauses, so a keystroke burst costs one write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::events::{EventBus, SessionEvent};
use crate::planner::MutationPlan;
use crate::record::{ProjectId, RecordId};
use crate::store::{RecordStore, StoreError};

/// Quiet window before a coalesced content edit is written out.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SyncError {
    /// The store rejected the batch or could not be reached. Optimistic
    /// local state is not rolled back; retry is the caller's decision.
    #[error("Sync failed: {0}")]
    SyncFailed(#[from] StoreError),
}

/// Immediate dispatch of structural mutation plans.
pub struct SyncDispatcher<S> {
    store: Arc<S>,
    project: ProjectId,
    events: Arc<EventBus>,
}

impl<S: RecordStore> SyncDispatcher<S> {
    pub fn new(store: Arc<S>, project: ProjectId, events: Arc<EventBus>) -> Self {
        Self {
            store,
            project,
            events,
        }
    }

    /// Submit a plan as one atomic batch. Empty plans (planner no-ops) are
    /// skipped without touching the store.
    pub async fn dispatch(&self, plan: MutationPlan) -> Result<(), SyncError> {
        if plan.is_empty() {
            return Ok(());
        }
        let op_count = plan.len();
        match self.store.submit_batch(self.project, plan).await {
            Ok(()) => {
                tracing::debug!("Dispatched batch of {} ops", op_count);
                self.events.emit(SessionEvent::BatchDispatched { op_count });
                Ok(())
            }
            Err(e) => {
                tracing::error!("Batch dispatch failed: {}", e);
                self.events.emit(SessionEvent::SyncFailed {
                    message: e.to_string(),
                });
                Err(SyncError::SyncFailed(e))
            }
        }
    }
}

struct PendingEdit {
    /// Latest value wins; intermediate values are acceptable loss.
    latest: String,
    generation: u64,
    /// `None` once a write for this value has failed; the value then waits
    /// for an explicit flush or the next edit.
    timer: Option<JoinHandle<()>>,
}

struct CoalescerInner<S> {
    store: Arc<S>,
    project: ProjectId,
    events: Arc<EventBus>,
    quiet_window: Duration,
    pending: Mutex<HashMap<RecordId, PendingEdit>>,
    generations: AtomicU64,
}

impl<S: RecordStore> CoalescerInner<S> {
    /// Timer expiry. A newer edit may have re-armed the window after this
    /// timer was scheduled but before it ran; the generation check lets the
    /// newer timer win.
    async fn fire(&self, id: RecordId, generation: u64) {
        let content = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(&id) {
                Some(edit) if edit.generation == generation => {
                    pending.remove(&id).map(|edit| edit.latest)
                }
                _ => None,
            }
        };
        if let Some(content) = content {
            if !self.write(id, content.clone()).await {
                self.restore(id, content, generation);
            }
        }
    }

    async fn write(&self, id: RecordId, content: String) -> bool {
        let plan = MutationPlan::content_update(id, content);
        match self.store.submit_batch(self.project, plan).await {
            Ok(()) => {
                tracing::debug!("Flushed content for {}", id);
                self.events.emit(SessionEvent::ContentFlushed { id });
                true
            }
            Err(e) => {
                tracing::error!("Content flush for {} failed: {}", id, e);
                self.events.emit(SessionEvent::SyncFailed {
                    message: e.to_string(),
                });
                false
            }
        }
    }

    /// Put a failed write's value back so it stays pending until a flush
    /// retries it or a newer edit supersedes it. Only the *latest* value is
    /// recoverable; a newer edit that raced in wins.
    fn restore(&self, id: RecordId, content: String, generation: u64) {
        self.pending
            .lock()
            .unwrap()
            .entry(id)
            .or_insert(PendingEdit {
                latest: content,
                generation,
                timer: None,
            });
    }
}

/// Trailing-edge coalescing of content edits, one window per file.
///
/// Each edit replaces the pending value and restarts the quiet window; the
/// write fires only once edits stop for the whole window. The pending value
/// is owned state, so a flush (file switch, shutdown) can always dispatch it
/// immediately — discarding a timer never discards its value.
pub struct ContentCoalescer<S> {
    inner: Arc<CoalescerInner<S>>,
}

impl<S: RecordStore + 'static> ContentCoalescer<S> {
    pub fn new(store: Arc<S>, project: ProjectId, events: Arc<EventBus>) -> Self {
        Self::with_quiet_window(store, project, events, DEFAULT_QUIET_WINDOW)
    }

    pub fn with_quiet_window(
        store: Arc<S>,
        project: ProjectId,
        events: Arc<EventBus>,
        quiet_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                store,
                project,
                events,
                quiet_window,
                pending: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Record the latest content for a file and (re)start its quiet window.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn edit(&self, id: RecordId, content: String) {
        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(previous) = pending.remove(&id) {
            if let Some(timer) = previous.timer {
                timer.abort();
            }
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.quiet_window).await;
            inner.fire(id, generation).await;
        });

        pending.insert(
            id,
            PendingEdit {
                latest: content,
                generation,
                timer: Some(timer),
            },
        );
    }

    /// Whether a write for `id` is waiting on its quiet window.
    pub fn has_pending(&self, id: RecordId) -> bool {
        self.inner.pending.lock().unwrap().contains_key(&id)
    }

    /// Write any pending edit for `id` immediately (file-switch path). The
    /// value stays pending if the write fails, so a later flush can retry.
    pub async fn flush(&self, id: RecordId) {
        let edit = self.inner.pending.lock().unwrap().remove(&id);
        if let Some(edit) = edit {
            if let Some(timer) = edit.timer {
                timer.abort();
            }
            if !self.inner.write(id, edit.latest.clone()).await {
                self.inner.restore(id, edit.latest, edit.generation);
            }
        }
    }

    /// Write every pending edit immediately (shutdown path).
    pub async fn flush_all(&self) {
        let drained: Vec<(RecordId, PendingEdit)> =
            self.inner.pending.lock().unwrap().drain().collect();
        for (id, edit) in drained {
            if let Some(timer) = edit.timer {
                timer.abort();
            }
            if !self.inner.write(id, edit.latest.clone()).await {
                self.inner.restore(id, edit.latest, edit.generation);
            }
        }
    }
}

impl<S> Drop for ContentCoalescer<S> {
    fn drop(&mut self) {
        // Timers hold an Arc of the inner state; aborting them lets it free
        // promptly. Values still pending here were not flushed — callers
        // that care run flush_all first.
        for edit in self.inner.pending.lock().unwrap().values() {
            if let Some(timer) = &edit.timer {
                timer.abort();
            }
        }
    }
}

//! Project session: one project's sync loop.
//!
//! A session owns the live query receiver, the latest snapshot and its
//! derived tree, and the dispatch machinery. User intents are planned against
//! the latest snapshot and dispatched; the store answers with a fresh
//! snapshot, which `refresh` turns into the next tree. Local state is never
//! edited structurally — the snapshot is the only structural truth.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::dispatcher::{ContentCoalescer, SyncDispatcher, SyncError};
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::planner::{PlanError, Planner};
use crate::record::{FileRecord, FileType, Parent, ProjectId, RecordId};
use crate::store::{RecordStore, StoreError};
use crate::tree::{TreeNode, build_tree};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Where the session stands relative to its live query.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// Subscribed, first snapshot not yet processed.
    Loading,
    /// Tree reflects the latest delivered snapshot.
    Live,
    /// The live query ended; the tree is stale.
    Error(String),
}

/// One project's view of the store: snapshot in, intents out.
pub struct ProjectSession<S: RecordStore + 'static> {
    project: ProjectId,
    snapshots: watch::Receiver<Vec<FileRecord>>,
    records: Vec<FileRecord>,
    tree: Vec<TreeNode>,
    status: SessionStatus,
    dispatcher: SyncDispatcher<S>,
    coalescer: ContentCoalescer<S>,
    events: Arc<EventBus>,
    open_file: Option<RecordId>,
    /// Unflushed edits shadow snapshot content so the editor never lags a
    /// keystroke behind itself.
    local_content: HashMap<RecordId, String>,
}

impl<S: RecordStore + 'static> ProjectSession<S> {
    /// Subscribe to a project and process the initial snapshot.
    pub async fn connect(store: Arc<S>, project: ProjectId) -> Result<Self, StoreError> {
        let snapshots = store.subscribe(project).await?;
        let events = Arc::new(EventBus::new());
        let dispatcher = SyncDispatcher::new(Arc::clone(&store), project, Arc::clone(&events));
        let coalescer = ContentCoalescer::new(store, project, Arc::clone(&events));

        let mut session = Self {
            project,
            snapshots,
            records: Vec::new(),
            tree: Vec::new(),
            status: SessionStatus::Loading,
            dispatcher,
            coalescer,
            events,
            open_file: None,
            local_content: HashMap::new(),
        };
        session.refresh();
        Ok(session)
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    /// The current nested view.
    pub fn tree(&self) -> &[TreeNode] {
        &self.tree
    }

    /// The latest flat snapshot the tree was built from.
    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Subscribe to session events (tree rebuilds, dispatches, failures).
    pub fn subscribe_events(
        &self,
        callback: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Suspend until the store delivers the next snapshot, then fold it in.
    ///
    /// Returns `Err` once the live query ends (store dropped or connection
    /// lost); the session keeps serving its stale tree after that.
    pub async fn changed(&mut self) -> Result<(), StoreError> {
        if self.snapshots.changed().await.is_err() {
            let message = "live query ended".to_string();
            self.status = SessionStatus::Error(message.clone());
            return Err(StoreError::Unreachable(message));
        }
        self.refresh();
        Ok(())
    }

    /// Rebuild the tree from the latest delivered snapshot.
    pub fn refresh(&mut self) {
        self.records = self.snapshots.borrow_and_update().clone();

        // An overlay entry whose write already landed would only hide remote
        // edits from now on; keep overlays only while a write is pending.
        let coalescer = &self.coalescer;
        self.local_content
            .retain(|id, _| coalescer.has_pending(*id));

        self.tree = build_tree(&self.records);
        self.status = SessionStatus::Live;
        self.events.emit(SessionEvent::TreeRebuilt {
            record_count: self.records.len(),
        });
    }

    /// Create a file or folder under `parent`. Returns the new record's id
    /// so the caller can select it once the snapshot catches up.
    pub async fn create(
        &mut self,
        parent: Parent,
        name: &str,
        kind: FileType,
    ) -> Result<RecordId, SessionError> {
        let (id, plan) = self.planner().create(parent, name, kind)?;
        self.dispatcher.dispatch(plan).await?;
        Ok(id)
    }

    pub async fn rename(&mut self, id: RecordId, new_name: &str) -> Result<(), SessionError> {
        let plan = self.planner().rename(id, new_name)?;
        self.dispatcher.dispatch(plan).await?;
        Ok(())
    }

    pub async fn move_records(
        &mut self,
        ids: &[RecordId],
        new_parent: Parent,
        index: usize,
    ) -> Result<(), SessionError> {
        let plan = self.planner().move_records(ids, new_parent, index)?;
        self.dispatcher.dispatch(plan).await?;
        Ok(())
    }

    pub async fn delete(&mut self, ids: &[RecordId]) -> Result<(), SessionError> {
        let plan = self.planner().delete(ids)?;
        self.dispatcher.dispatch(plan).await?;
        Ok(())
    }

    pub async fn toggle_expand(
        &mut self,
        id: RecordId,
        expanded: bool,
    ) -> Result<(), SessionError> {
        let plan = self.planner().toggle_expand(id, expanded)?;
        self.dispatcher.dispatch(plan).await?;
        Ok(())
    }

    /// Record a keystroke. The local overlay updates synchronously; the
    /// store write is handed to the coalescer and fires once typing pauses.
    pub fn edit_content(&mut self, id: RecordId, content: &str) -> Result<(), SessionError> {
        // Plan for validation only — the coalescer owns the actual write.
        let plan = self.planner().edit_content(id, content)?;
        if plan.is_empty() {
            return Ok(());
        }
        self.local_content.insert(id, content.to_string());
        self.coalescer.edit(id, content.to_string());
        Ok(())
    }

    /// Content of a file as the editor should display it: the unflushed
    /// local overlay if one exists, otherwise the snapshot value.
    pub fn content(&self, id: RecordId) -> Option<&str> {
        if let Some(overlay) = self.local_content.get(&id) {
            return Some(overlay);
        }
        self.records
            .iter()
            .find(|r| r.id == id)
            .and_then(|r| r.content.as_deref())
    }

    /// Switch the open file. Any pending write for the previously open file
    /// is flushed immediately so nothing is lost if the editor never comes
    /// back to it.
    pub async fn open_file(&mut self, id: Option<RecordId>) {
        if let Some(previous) = self.open_file.take() {
            if Some(previous) != id {
                self.coalescer.flush(previous).await;
            }
        }
        self.open_file = id;
    }

    pub fn opened_file(&self) -> Option<RecordId> {
        self.open_file
    }

    /// Flush every pending content write. Call before dropping the session.
    pub async fn shutdown(&mut self) {
        self.coalescer.flush_all().await;
    }

    fn planner(&self) -> Planner<'_> {
        Planner::new(&self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DEFAULT_QUIET_WINDOW;
    use crate::store::InMemoryStore;

    async fn live_session() -> (Arc<InMemoryStore>, ProjectSession<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let project = ProjectId::generate();
        let session = ProjectSession::connect(Arc::clone(&store), project)
            .await
            .unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn test_connect_processes_initial_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let project = ProjectId::generate();
        store.seed(
            project,
            vec![FileRecord::new_file(project, Parent::Root, "main.tex", 0)],
        );

        let session = ProjectSession::connect(store, project).await.unwrap();
        assert_eq!(*session.status(), SessionStatus::Live);
        assert_eq!(session.tree().len(), 1);
    }

    #[tokio::test]
    async fn test_create_then_changed_shows_new_node() {
        let (_, mut session) = live_session().await;

        let folder = session
            .create(Parent::Root, "chapters", FileType::Folder)
            .await
            .unwrap();
        session.changed().await.unwrap();

        let file = session
            .create(Parent::Folder(folder), "intro.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();

        assert_eq!(session.tree().len(), 1);
        assert_eq!(session.tree()[0].record.id, folder);
        assert_eq!(session.tree()[0].children[0].record.id, file);
    }

    #[tokio::test]
    async fn test_delete_cascade_through_session() {
        let (_, mut session) = live_session().await;

        let folder = session
            .create(Parent::Root, "drafts", FileType::Folder)
            .await
            .unwrap();
        session.changed().await.unwrap();
        session
            .create(Parent::Folder(folder), "a.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();

        session.delete(&[folder]).await.unwrap();
        session.changed().await.unwrap();
        assert!(session.tree().is_empty());
    }

    #[tokio::test]
    async fn test_plan_error_dispatches_nothing() {
        let (store, mut session) = live_session().await;

        let result = session.create(Parent::Root, "   ", FileType::File).await;
        assert!(matches!(
            result,
            Err(SessionError::Plan(PlanError::EmptyName))
        ));
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_tree_and_emits_event() {
        let (store, mut session) = live_session().await;
        session
            .create(Parent::Root, "main.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();
        let before = session.tree().to_vec();

        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let failed_clone = Arc::clone(&failed);
        let _sub = session.subscribe_events(move |event| {
            if matches!(event, SessionEvent::SyncFailed { .. }) {
                failed_clone.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        });

        store.fail_next_batch();
        let id = before[0].record.id;
        let result = session.rename(id, "other.tex").await;

        assert!(matches!(result, Err(SessionError::Sync(_))));
        assert!(failed.load(std::sync::atomic::Ordering::Relaxed));
        // No rollback machinery and no partial state: tree is unchanged.
        assert_eq!(session.tree(), before.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_content_overlay_is_synchronous() {
        let (_, mut session) = live_session().await;
        let id = session
            .create(Parent::Root, "main.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();

        session.edit_content(id, "\\documentclass{article}").unwrap();
        // Nothing flushed yet, but the editor view is already current.
        assert_eq!(session.content(id), Some("\\documentclass{article}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_burst_reaches_store_once() {
        let (store, mut session) = live_session().await;
        let id = session
            .create(Parent::Root, "main.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();
        let batches_before = store.batch_count();

        session.edit_content(id, "a").unwrap();
        session.edit_content(id, "ab").unwrap();
        session.edit_content(id, "abc").unwrap();
        tokio::time::sleep(DEFAULT_QUIET_WINDOW * 2).await;

        assert_eq!(store.batch_count(), batches_before + 1);
        session.changed().await.unwrap();
        assert_eq!(session.content(id), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_content_write_keeps_editor_view() {
        let (store, mut session) = live_session().await;
        let id = session
            .create(Parent::Root, "main.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();

        store.fail_next_batch();
        session.edit_content(id, "important paragraph").unwrap();
        tokio::time::sleep(DEFAULT_QUIET_WINDOW * 2).await;

        // An unrelated remote change arrives and the tree is rebuilt; the
        // unflushed value must survive the rebuild, not revert to the stale
        // snapshot content.
        let other = SyncDispatcher::new(
            Arc::clone(&store),
            session.project(),
            Arc::new(EventBus::new()),
        );
        let (_, plan) = Planner::new(session.records())
            .create(Parent::Root, "other.tex", FileType::File)
            .unwrap();
        other.dispatch(plan).await.unwrap();
        session.changed().await.unwrap();

        assert_eq!(session.content(id), Some("important paragraph"));

        // The held value is still flushable once the store recovers.
        session.shutdown().await;
        session.changed().await.unwrap();
        assert_eq!(session.content(id), Some("important paragraph"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_files_flushes_previous_pending_edit() {
        let (store, mut session) = live_session().await;
        let first = session
            .create(Parent::Root, "a.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();
        let second = session
            .create(Parent::Root, "b.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();
        let batches_before = store.batch_count();

        session.open_file(Some(first)).await;
        assert_eq!(session.opened_file(), Some(first));
        session.edit_content(first, "unsaved").unwrap();
        session.open_file(Some(second)).await;
        assert_eq!(session.opened_file(), Some(second));

        // Flushed on switch, ahead of the quiet window.
        assert_eq!(store.batch_count(), batches_before + 1);
        session.changed().await.unwrap();
        assert_eq!(session.content(first), Some("unsaved"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_all_pending_edits() {
        let (store, mut session) = live_session().await;
        let id = session
            .create(Parent::Root, "main.tex", FileType::File)
            .await
            .unwrap();
        session.changed().await.unwrap();
        let batches_before = store.batch_count();

        session.edit_content(id, "final words").unwrap();
        session.shutdown().await;

        assert_eq!(store.batch_count(), batches_before + 1);
    }

    #[tokio::test]
    async fn test_remote_change_visible_after_changed() {
        let store = Arc::new(InMemoryStore::new());
        let project = ProjectId::generate();
        let mut session = ProjectSession::connect(Arc::clone(&store), project)
            .await
            .unwrap();

        // Another collaborator writes through the same store.
        let other = SyncDispatcher::new(Arc::clone(&store), project, Arc::new(EventBus::new()));
        let planner_records: Vec<FileRecord> = Vec::new();
        let (id, plan) = Planner::new(&planner_records)
            .create(Parent::Root, "shared.tex", FileType::File)
            .unwrap();
        other.dispatch(plan).await.unwrap();

        session.changed().await.unwrap();
        assert_eq!(session.tree().len(), 1);
        assert_eq!(session.tree()[0].record.id, id);
    }
}

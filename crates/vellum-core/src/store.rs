//! Record store contract plus the shared batch-application logic and an
//! in-memory implementation for tests.
//!
//! The store is authoritative: clients never merge, they replace. A live
//! query delivers the *full* current record set on every change (`watch`
//! semantics), and mutation batches apply all-or-nothing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::planner::{MutationOp, MutationPlan};
use crate::record::{FileRecord, ProjectId, RecordId};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused the batch; nothing was applied.
    #[error("Batch rejected: {0}")]
    Rejected(String),

    /// The store could not be reached; the batch may be retried.
    #[error("Store unreachable: {0}")]
    Unreachable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The remote store a project session syncs against.
///
/// Implementations: `InMemoryStore` for tests, `RemoteStore` (in
/// vellum-daemon) over the wire protocol.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open a live query on a project's flat record set.
    ///
    /// Every delivery on the returned channel is the full current set, not a
    /// diff. The receiver holds valid data from the moment this returns.
    async fn subscribe(&self, project: ProjectId) -> Result<watch::Receiver<Vec<FileRecord>>>;

    /// Apply a mutation plan as one atomic batch: all operations land or
    /// none do. Subscribers observe the result as a single new snapshot.
    async fn submit_batch(&self, project: ProjectId, plan: MutationPlan) -> Result<()>;
}

// RecordStore for Arc<T> lets sessions, dispatchers, and coalescers share
// one store without caring about the wrapper.
#[async_trait]
impl<T: RecordStore + Send + Sync> RecordStore for std::sync::Arc<T> {
    async fn subscribe(&self, project: ProjectId) -> Result<watch::Receiver<Vec<FileRecord>>> {
        (**self).subscribe(project).await
    }

    async fn submit_batch(&self, project: ProjectId, plan: MutationPlan) -> Result<()> {
        (**self).submit_batch(project, plan).await
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// An update targeted an id the set does not contain, and the patch
    /// lacks the required fields to create the record.
    #[error("Update for unknown record {0} is missing required fields")]
    IncompleteCreate(RecordId),
}

/// Apply a plan to a record set, all-or-nothing.
///
/// Operations are staged against a copy; the set is only replaced once every
/// operation has applied. An `Update` on a missing id creates the record when
/// the patch carries the full field set (the create path); `Delete` on a
/// missing id is idempotent.
pub fn apply_plan(
    project: ProjectId,
    records: &mut Vec<FileRecord>,
    plan: &MutationPlan,
) -> std::result::Result<(), ApplyError> {
    let mut staged = records.clone();

    for op in &plan.ops {
        match op {
            MutationOp::Update { id, patch } => {
                if let Some(record) = staged.iter_mut().find(|r| r.id == *id) {
                    patch.apply(record);
                } else {
                    let record = patch
                        .create(*id, project)
                        .ok_or(ApplyError::IncompleteCreate(*id))?;
                    staged.push(record);
                }
            }
            MutationOp::Delete { id } => {
                staged.retain(|r| r.id != *id);
            }
        }
    }

    *records = staged;
    Ok(())
}

struct ProjectState {
    records: Vec<FileRecord>,
    snapshots: watch::Sender<Vec<FileRecord>>,
}

impl ProjectState {
    fn new() -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self {
            records: Vec::new(),
            snapshots,
        }
    }
}

/// In-memory store for tests.
///
/// Matches the trait contract exactly — atomic batches, full-snapshot
/// deliveries — and adds failure injection so dispatch failure paths are
/// testable.
pub struct InMemoryStore {
    projects: Mutex<HashMap<ProjectId, ProjectState>>,
    fail_next: AtomicBool,
    batches: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            projects: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
            batches: AtomicUsize::new(0),
        }
    }

    /// Make the next `submit_batch` fail with `StoreError::Unreachable`
    /// without applying anything.
    pub fn fail_next_batch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of batches successfully applied. Lets tests assert on write
    /// frequency (e.g. that a burst of edits produced one write).
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Replace a project's record set directly (test setup).
    pub fn seed(&self, project: ProjectId, records: Vec<FileRecord>) {
        let mut projects = self.projects.lock().unwrap();
        let state = projects.entry(project).or_insert_with(ProjectState::new);
        state.records = records.clone();
        state.snapshots.send_replace(records);
    }

    /// Current record set for a project (test assertions).
    pub fn records(&self, project: ProjectId) -> Vec<FileRecord> {
        let projects = self.projects.lock().unwrap();
        projects
            .get(&project)
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn subscribe(&self, project: ProjectId) -> Result<watch::Receiver<Vec<FileRecord>>> {
        let mut projects = self.projects.lock().unwrap();
        // The channel always mirrors `records`, so a new receiver sees a
        // valid snapshot immediately — empty for a brand-new project.
        let state = projects.entry(project).or_insert_with(ProjectState::new);
        Ok(state.snapshots.subscribe())
    }

    async fn submit_batch(&self, project: ProjectId, plan: MutationPlan) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unreachable("injected failure".into()));
        }

        let mut projects = self.projects.lock().unwrap();
        let state = projects.entry(project).or_insert_with(ProjectState::new);
        apply_plan(project, &mut state.records, &plan)
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        self.batches.fetch_add(1, Ordering::SeqCst);
        state.snapshots.send_replace(state.records.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileType, Parent, RecordPatch};

    fn full_create_patch(name: &str, parent: Parent, kind: FileType, order: i64) -> RecordPatch {
        RecordPatch {
            name: Some(name.into()),
            parent: Some(parent),
            kind: Some(kind),
            order: Some(order),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_plan_creates_updates_and_deletes() {
        let project = ProjectId::generate();
        let mut records = Vec::new();

        let id = RecordId::generate();
        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Update {
            id,
            patch: full_create_patch("main.tex", Parent::Root, FileType::File, 0),
        });
        apply_plan(project, &mut records, &plan).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].project_id, project);

        let mut rename = MutationPlan::default();
        rename.push(MutationOp::Update {
            id,
            patch: RecordPatch {
                name: Some("renamed.tex".into()),
                ..Default::default()
            },
        });
        apply_plan(project, &mut records, &rename).unwrap();
        assert_eq!(records[0].name, "renamed.tex");

        let mut delete = MutationPlan::default();
        delete.push(MutationOp::Delete { id });
        apply_plan(project, &mut records, &delete).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_apply_plan_is_atomic_on_failure() {
        let project = ProjectId::generate();
        let mut records = vec![FileRecord::new_file(project, Parent::Root, "a.tex", 0)];
        let before = records.clone();

        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Delete {
            id: records[0].id,
        });
        // Incomplete create: unknown id, patch missing required fields.
        plan.push(MutationOp::Update {
            id: RecordId::generate(),
            patch: RecordPatch {
                name: Some("half".into()),
                ..Default::default()
            },
        });

        let err = apply_plan(project, &mut records, &plan).unwrap_err();
        assert!(matches!(err, ApplyError::IncompleteCreate(_)));
        // The delete earlier in the batch did not land either.
        assert_eq!(records, before);
    }

    #[test]
    fn test_apply_plan_delete_missing_is_idempotent() {
        let project = ProjectId::generate();
        let mut records = Vec::new();
        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Delete {
            id: RecordId::generate(),
        });
        apply_plan(project, &mut records, &plan).unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_seeded_snapshot_immediately() {
        let store = InMemoryStore::new();
        let project = ProjectId::generate();
        store.seed(
            project,
            vec![FileRecord::new_file(project, Parent::Root, "main.tex", 0)],
        );

        let rx = store.subscribe(project).await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_batch_notifies_subscribers_with_full_set() {
        let store = InMemoryStore::new();
        let project = ProjectId::generate();
        let mut rx = store.subscribe(project).await.unwrap();
        rx.borrow_and_update();

        let id = RecordId::generate();
        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Update {
            id,
            patch: full_create_patch("notes.tex", Parent::Root, FileType::File, 0),
        });
        store.submit_batch(project, plan).await.unwrap();

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, id);
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_set_and_count_untouched() {
        let store = InMemoryStore::new();
        let project = ProjectId::generate();
        store.seed(
            project,
            vec![FileRecord::new_file(project, Parent::Root, "a.tex", 0)],
        );

        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Update {
            id: RecordId::generate(),
            patch: RecordPatch::default(),
        });

        let err = store.submit_batch(project, plan).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.records(project).len(), 1);
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_next_batch_injects_one_failure() {
        let store = InMemoryStore::new();
        let project = ProjectId::generate();
        store.fail_next_batch();

        let id = RecordId::generate();
        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Update {
            id,
            patch: full_create_patch("x.tex", Parent::Root, FileType::File, 0),
        });

        let err = store.submit_batch(project, plan.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
        assert!(store.records(project).is_empty());

        // Next attempt goes through.
        store.submit_batch(project, plan).await.unwrap();
        assert_eq!(store.records(project).len(), 1);
    }
}

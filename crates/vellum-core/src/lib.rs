//! vellum-core: hierarchical file-tree synchronization for document projects.
//!
//! A project's files and folders live in an authoritative remote store as a
//! flat record set; hierarchy is encoded per record through a nullable parent
//! reference plus a sibling `order`. This crate rebuilds the nested view from
//! each live-query snapshot, plans structural mutations (create, rename, move,
//! delete, expand/collapse) as atomic batches, and coalesces high-frequency
//! content edits into low-frequency writes.
//!
//! The three layers:
//! - `tree` — pure derivation of the nested view model from the flat set
//! - `planner` — pure translation of user intents into `MutationPlan`s
//! - `dispatcher` — the only layer that talks to the store, via `RecordStore`
//!
//! `session` wires them together for one project; `store` provides the store
//! contract plus an in-memory implementation for tests.

pub mod dispatcher;
pub mod events;
pub mod planner;
pub mod record;
pub mod session;
pub mod store;
pub mod tree;

pub use dispatcher::{ContentCoalescer, DEFAULT_QUIET_WINDOW, SyncDispatcher, SyncError};
pub use events::{EventBus, SessionEvent, Subscription};
pub use planner::{MutationOp, MutationPlan, PlanError, Planner};
pub use record::{
    FileRecord, FileType, Parent, ProjectId, RecordId, RecordPatch, decode_records,
};
pub use session::{ProjectSession, SessionError, SessionStatus};
pub use store::{ApplyError, InMemoryStore, RecordStore, StoreError, apply_plan};
pub use tree::{TreeNode, build_tree};

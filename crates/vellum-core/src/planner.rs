//! Mutation planner: translates user intents into record-level mutation plans.
//!
//! A `Planner` indexes one snapshot of the flat record set and stays pure
//! against it — it never talks to the store and never mutates the snapshot.
//! Every entry point either returns a complete `MutationPlan` or an error;
//! a failed intent dispatches nothing.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{FileRecord, FileType, Parent, RecordId, RecordPatch};

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    /// The named parent does not exist in the snapshot or is not a folder.
    #[error("Invalid parent: {0:?}")]
    InvalidParent(Parent),

    /// The move would make a folder a descendant of itself.
    #[error("Move would create a cycle through {0}")]
    CyclicMove(RecordId),

    /// The name is empty after trimming.
    #[error("Name is empty")]
    EmptyName,

    /// The intent names a record missing from the snapshot.
    #[error("Unknown record: {0}")]
    UnknownRecord(RecordId),
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// One field-level operation against the store.
///
/// `Update` on an id the store does not know is the create path — the patch
/// must then carry the full required field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum MutationOp {
    Update { id: RecordId, patch: RecordPatch },
    Delete { id: RecordId },
}

/// Ordered list of operations produced for one intent.
///
/// A plan is applied by the store as a single atomic batch: all operations
/// land or none do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationPlan {
    pub ops: Vec<MutationOp>,
}

impl MutationPlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn push(&mut self, op: MutationOp) {
        self.ops.push(op);
    }

    /// A plan carrying one content update, as produced by the coalescer.
    pub fn content_update(id: RecordId, content: String) -> Self {
        Self {
            ops: vec![MutationOp::Update {
                id,
                patch: RecordPatch {
                    content: Some(content),
                    ..Default::default()
                },
            }],
        }
    }
}

/// Intent-to-plan translation over one snapshot of the record set.
pub struct Planner<'a> {
    by_id: HashMap<RecordId, &'a FileRecord>,
    /// Sibling groups sorted by `(order, id)`, same as the tree builder.
    children: HashMap<Parent, Vec<&'a FileRecord>>,
}

impl<'a> Planner<'a> {
    pub fn new(records: &'a [FileRecord]) -> Self {
        let mut by_id = HashMap::with_capacity(records.len());
        let mut children: HashMap<Parent, Vec<&FileRecord>> = HashMap::new();
        for record in records {
            by_id.insert(record.id, record);
            children.entry(record.parent).or_default().push(record);
        }
        for group in children.values_mut() {
            group.sort_by_key(|r| (r.order, r.id));
        }
        Self { by_id, children }
    }

    /// Plan a new file or folder under `parent`.
    ///
    /// The new record lands after its siblings (max order + 1, or 0 in an
    /// empty group). Returns the minted id so the caller can select the node
    /// once the snapshot catches up.
    pub fn create(
        &self,
        parent: Parent,
        name: &str,
        kind: FileType,
    ) -> Result<(RecordId, MutationPlan)> {
        let name = trimmed(name)?;
        self.require_folder(parent)?;
        self.warn_on_duplicate_name(parent, name, None);

        let order = self
            .siblings(parent)
            .iter()
            .map(|r| r.order)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        let id = RecordId::generate();
        let patch = RecordPatch {
            name: Some(name.to_string()),
            parent: Some(parent),
            kind: Some(kind),
            order: Some(order),
            is_expanded: Some(false),
            content: match kind {
                FileType::File => Some(String::new()),
                FileType::Folder => None,
            },
        };

        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Update { id, patch });
        Ok((id, plan))
    }

    /// Plan a rename. Duplicate sibling names are allowed but logged.
    pub fn rename(&self, id: RecordId, new_name: &str) -> Result<MutationPlan> {
        let name = trimmed(new_name)?;
        let record = self.get(id)?;
        self.warn_on_duplicate_name(record.parent, name, Some(id));

        let mut plan = MutationPlan::default();
        plan.push(MutationOp::Update {
            id,
            patch: RecordPatch {
                name: Some(name.to_string()),
                ..Default::default()
            },
        });
        Ok(plan)
    }

    /// Plan moving `ids` into `new_parent` at sibling position `index`
    /// (clamped to the destination group's length).
    ///
    /// The destination group is renumbered to exactly `0..n-1`; already
    /// correct siblings are skipped, and the source group is deliberately
    /// left un-renumbered — relative order there is unchanged and gaps are
    /// harmless since ordering is comparative.
    pub fn move_records(
        &self,
        ids: &[RecordId],
        new_parent: Parent,
        index: usize,
    ) -> Result<MutationPlan> {
        let mut moved: Vec<&FileRecord> = Vec::with_capacity(ids.len());
        let mut moved_set: HashSet<RecordId> = HashSet::with_capacity(ids.len());
        for &id in ids {
            let record = self.get(id)?;
            if moved_set.insert(id) {
                moved.push(record);
            }
        }
        if moved.is_empty() {
            return Ok(MutationPlan::default());
        }

        self.require_folder(new_parent)?;
        if let Some(id) = self.ancestor_among(new_parent, &moved_set) {
            return Err(PlanError::CyclicMove(id));
        }

        // Final destination sequence: current siblings minus the moved
        // records, with the moved block spliced in at `index`.
        let mut sequence: Vec<RecordId> = self
            .siblings(new_parent)
            .iter()
            .map(|r| r.id)
            .filter(|id| !moved_set.contains(id))
            .collect();
        let index = index.min(sequence.len());
        for (offset, record) in moved.iter().enumerate() {
            sequence.insert(index + offset, record.id);
        }

        let mut plan = MutationPlan::default();
        for (position, id) in sequence.iter().enumerate() {
            let order = position as i64;
            if moved_set.contains(id) {
                plan.push(MutationOp::Update {
                    id: *id,
                    patch: RecordPatch {
                        parent: Some(new_parent),
                        order: Some(order),
                        ..Default::default()
                    },
                });
            } else if let Some(record) = self.by_id.get(id) {
                if record.order != order {
                    plan.push(MutationOp::Update {
                        id: *id,
                        patch: RecordPatch {
                            order: Some(order),
                            ..Default::default()
                        },
                    });
                }
            }
        }
        Ok(plan)
    }

    /// Plan deletion of `ids` plus every transitive descendant.
    pub fn delete(&self, ids: &[RecordId]) -> Result<MutationPlan> {
        let mut doomed: Vec<RecordId> = Vec::new();
        let mut seen: HashSet<RecordId> = HashSet::new();
        let mut queue: VecDeque<RecordId> = VecDeque::new();

        for &id in ids {
            let record = self.get(id)?;
            if seen.insert(id) {
                doomed.push(id);
                if record.kind == FileType::Folder {
                    queue.push_back(id);
                }
            }
        }

        while let Some(folder) = queue.pop_front() {
            for child in self.siblings(Parent::Folder(folder)) {
                if seen.insert(child.id) {
                    doomed.push(child.id);
                    if child.kind == FileType::Folder {
                        queue.push_back(child.id);
                    }
                }
            }
        }

        let mut plan = MutationPlan::default();
        for id in doomed {
            plan.push(MutationOp::Delete { id });
        }
        Ok(plan)
    }

    /// Plan expanding or collapsing a folder. Empty plan for files — the
    /// field is meaningless there, and a no-op beats an error the UI would
    /// have to swallow.
    pub fn toggle_expand(&self, id: RecordId, expanded: bool) -> Result<MutationPlan> {
        let record = self.get(id)?;
        let mut plan = MutationPlan::default();
        if record.kind == FileType::Folder {
            plan.push(MutationOp::Update {
                id,
                patch: RecordPatch {
                    is_expanded: Some(expanded),
                    ..Default::default()
                },
            });
        }
        Ok(plan)
    }

    /// Plan a content write for a file. Empty plan for folders, mirroring
    /// `toggle_expand`'s policy for files.
    ///
    /// Callers route this through the content coalescer rather than
    /// dispatching it directly; content is the one high-frequency intent.
    pub fn edit_content(&self, id: RecordId, content: &str) -> Result<MutationPlan> {
        let record = self.get(id)?;
        if record.kind == FileType::Folder {
            return Ok(MutationPlan::default());
        }
        Ok(MutationPlan::content_update(id, content.to_string()))
    }

    fn get(&self, id: RecordId) -> Result<&'a FileRecord> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or(PlanError::UnknownRecord(id))
    }

    fn siblings(&self, parent: Parent) -> &[&'a FileRecord] {
        self.children
            .get(&parent)
            .map(|group| group.as_slice())
            .unwrap_or(&[])
    }

    fn require_folder(&self, parent: Parent) -> Result<()> {
        match parent {
            Parent::Root => Ok(()),
            Parent::Folder(id) => match self.by_id.get(&id) {
                Some(record) if record.kind == FileType::Folder => Ok(()),
                _ => Err(PlanError::InvalidParent(parent)),
            },
        }
    }

    /// Walk up from `start`; the first ancestor found in `ids`, if any.
    /// Bounded by a visited set so a corrupt snapshot cannot loop forever.
    fn ancestor_among(&self, start: Parent, ids: &HashSet<RecordId>) -> Option<RecordId> {
        let mut current = start;
        let mut walked: HashSet<RecordId> = HashSet::new();
        while let Parent::Folder(id) = current {
            if ids.contains(&id) {
                return Some(id);
            }
            if !walked.insert(id) {
                break;
            }
            current = match self.by_id.get(&id) {
                Some(record) => record.parent,
                None => break,
            };
        }
        None
    }

    /// Sibling name uniqueness is a soft constraint: surface it, don't
    /// block it.
    fn warn_on_duplicate_name(&self, parent: Parent, name: &str, exclude: Option<RecordId>) {
        if self
            .siblings(parent)
            .iter()
            .any(|r| Some(r.id) != exclude && r.name == name)
        {
            tracing::warn!("Duplicate sibling name: {:?}", name);
        }
    }
}

fn trimmed(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PlanError::EmptyName);
    }
    Ok(name)
}

//! Tree builder: derives the nested view model from the flat record set.
//!
//! The build is pure and deterministic — same input set, same tree — and the
//! whole tree is rebuilt from scratch on every snapshot. Nothing here mutates
//! records or talks to the store.

use std::collections::{HashMap, HashSet};

use crate::record::{FileRecord, FileType, Parent, RecordId};

/// One node of the derived view tree.
///
/// Carries no identity across rebuilds beyond `record.id`; collaborators that
/// need stable selection or expansion state key it off the id.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub record: FileRecord,
    /// Sibling-ordered children. Always empty for files.
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(record: FileRecord) -> Self {
        Self {
            record,
            children: Vec::new(),
        }
    }

    /// Total number of nodes in this subtree, including self.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::count).sum::<usize>()
    }
}

/// Build the nested view from a flat record set.
///
/// Sibling groups are sorted by `(order, id)` — the id tie-break keeps the
/// output stable when concurrent edits produce duplicate orders.
///
/// A record whose parent is missing from the set, or whose parent is a file,
/// is *detached*: it surfaces at the project root (after the genuine roots)
/// instead of disappearing. Records stranded on a parent cycle — possible
/// only in a mid-sync snapshot — surface flat at the root the same way.
/// Nothing in the input is ever silently hidden.
pub fn build_tree(records: &[FileRecord]) -> Vec<TreeNode> {
    let by_id: HashMap<RecordId, &FileRecord> =
        records.iter().map(|r| (r.id, r)).collect();

    // Group children under parents that exist in the set *and* are folders.
    // Everything else is a root of some kind.
    let mut children: HashMap<RecordId, Vec<&FileRecord>> = HashMap::new();
    let mut roots: Vec<&FileRecord> = Vec::new();
    let mut detached: Vec<&FileRecord> = Vec::new();

    for record in records {
        match record.parent {
            Parent::Root => roots.push(record),
            Parent::Folder(parent_id) => match by_id.get(&parent_id) {
                Some(parent) if parent.kind == FileType::Folder => {
                    children.entry(parent_id).or_default().push(record);
                }
                _ => detached.push(record),
            },
        }
    }

    sort_group(&mut roots);
    sort_group(&mut detached);
    for group in children.values_mut() {
        sort_group(group);
    }

    let mut visited: HashSet<RecordId> = HashSet::new();
    let mut top: Vec<TreeNode> = Vec::new();

    for record in roots.iter().chain(detached.iter()) {
        if let Some(node) = build_subtree(record, &children, &mut visited) {
            top.push(node);
        }
    }

    // Anything still unvisited sits on a parent cycle. Break the cycle by
    // surfacing its members flat at the root.
    let mut stranded: Vec<&FileRecord> =
        records.iter().filter(|r| !visited.contains(&r.id)).collect();
    sort_group(&mut stranded);
    for record in stranded {
        visited.insert(record.id);
        top.push(TreeNode::leaf(record.clone()));
    }

    top
}

fn sort_group(group: &mut [&FileRecord]) {
    group.sort_by_key(|r| (r.order, r.id));
}

/// Assemble one subtree with an explicit stack. Snapshots taken mid-sync can
/// nest arbitrarily deep, so recursion is off the table.
fn build_subtree(
    root: &FileRecord,
    children: &HashMap<RecordId, Vec<&FileRecord>>,
    visited: &mut HashSet<RecordId>,
) -> Option<TreeNode> {
    enum Step<'a> {
        Enter(&'a FileRecord),
        Exit(&'a FileRecord),
    }

    let mut stack = vec![Step::Enter(root)];
    // Completed children waiting for their parent's Exit.
    let mut built: HashMap<RecordId, Vec<TreeNode>> = HashMap::new();
    let mut result: Option<TreeNode> = None;

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(record) => {
                if !visited.insert(record.id) {
                    continue;
                }
                stack.push(Step::Exit(record));
                if record.kind == FileType::Folder {
                    if let Some(kids) = children.get(&record.id) {
                        // Reversed so siblings complete in order.
                        for kid in kids.iter().rev() {
                            stack.push(Step::Enter(kid));
                        }
                    }
                }
            }
            Step::Exit(record) => {
                let node = TreeNode {
                    record: record.clone(),
                    children: built.remove(&record.id).unwrap_or_default(),
                };
                if record.id == root.id {
                    result = Some(node);
                } else if let Parent::Folder(parent_id) = record.parent {
                    built.entry(parent_id).or_default().push(node);
                }
            }
        }
    }

    result
}

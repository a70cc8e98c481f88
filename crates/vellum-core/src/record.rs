//! Flat record model for a project's file tree.
//!
//! Records arrive from the store as a flat set; hierarchy lives entirely in
//! each record's `parent` reference plus its sibling `order`. The store is
//! schemaless, so validation happens here at the boundary — nothing downstream
//! ever sees a malformed record.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record name is empty")]
    EmptyName,

    #[error("Folder record carries content")]
    ContentOnFolder,

    #[error("Malformed record: {0}")]
    Malformed(String),
}

/// Unique identifier for a `FileRecord`, stable for the record's lifetime.
///
/// Displays and serializes as a hyphenated UUID string, matching the id shape
/// the remote store hands out.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Mint a fresh random id for a record created locally.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a project (one record set per project).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

impl ProjectId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Location of a record: directly under the project root, or inside a folder.
///
/// On the wire this is the nullable `parentId` field; `null` means root. The
/// enum keeps the two cases distinct in code so "no parent" can never be
/// confused with "parent not set".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<RecordId>", into = "Option<RecordId>")]
pub enum Parent {
    Root,
    Folder(RecordId),
}

impl Default for Parent {
    fn default() -> Self {
        Parent::Root
    }
}

impl From<Option<RecordId>> for Parent {
    fn from(id: Option<RecordId>) -> Self {
        match id {
            Some(id) => Parent::Folder(id),
            None => Parent::Root,
        }
    }
}

impl From<Parent> for Option<RecordId> {
    fn from(parent: Parent) -> Self {
        match parent {
            Parent::Folder(id) => Some(id),
            Parent::Root => None,
        }
    }
}

/// Whether a record is a document or a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Folder,
}

/// One row of a project's flat record set.
///
/// Field names follow the store's camelCase schema (`projectId`, `parentId`,
/// `isExpanded`) so records round-trip through JSON unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: RecordId,
    pub project_id: ProjectId,
    /// Absent and `null` both mean the project root; some store rows omit
    /// the attribute entirely instead of writing an explicit `null`.
    #[serde(default, rename = "parentId")]
    pub parent: Parent,
    pub name: String,
    /// Sibling position within the parent; ties broken by id.
    pub order: i64,
    #[serde(rename = "type")]
    pub kind: FileType,
    /// Meaningful for folders only; files ignore it.
    #[serde(default)]
    pub is_expanded: bool,
    /// Document body. Present for files, absent for folders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileRecord {
    pub fn new_file(
        project_id: ProjectId,
        parent: Parent,
        name: impl Into<String>,
        order: i64,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            project_id,
            parent,
            name: name.into(),
            order,
            kind: FileType::File,
            is_expanded: false,
            content: Some(String::new()),
        }
    }

    pub fn new_folder(
        project_id: ProjectId,
        parent: Parent,
        name: impl Into<String>,
        order: i64,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            project_id,
            parent,
            name: name.into(),
            order,
            kind: FileType::Folder,
            is_expanded: false,
            content: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == FileType::Folder
    }

    /// Structural checks a well-formed record must pass. Parent existence and
    /// cycle freedom are set-level properties checked by the tree builder.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.name.trim().is_empty() {
            return Err(RecordError::EmptyName);
        }
        if self.kind == FileType::Folder && self.content.is_some() {
            return Err(RecordError::ContentOnFolder);
        }
        Ok(())
    }
}

/// Decode raw store rows into validated `FileRecord`s.
///
/// The store is schemaless, so a row can be missing fields or carry the wrong
/// shapes entirely. Malformed rows are quarantined — logged and counted, never
/// propagated — so one bad row cannot take down the whole tree.
///
/// Returns the valid records plus the number quarantined.
pub fn decode_records(raw: &[serde_json::Value]) -> (Vec<FileRecord>, usize) {
    let mut records = Vec::with_capacity(raw.len());
    let mut quarantined = 0;

    for value in raw {
        let decoded = serde_json::from_value::<FileRecord>(value.clone())
            .map_err(|e| RecordError::Malformed(e.to_string()))
            .and_then(|record| {
                record.validate()?;
                Ok(record)
            });
        match decoded {
            Ok(record) => records.push(record),
            Err(e) => {
                quarantined += 1;
                tracing::warn!("Quarantined malformed record: {}", e);
            }
        }
    }

    (records, quarantined)
}

/// Field-level update payload. Only the fields that are set serialize, and
/// only those fields are touched when the patch is applied.
///
/// Applied to an id the store does not know, a patch that carries every
/// required field creates the record — that is the create path; there is no
/// separate insert operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        rename = "parentId",
        skip_serializing_if = "Option::is_none",
        with = "parent_field"
    )]
    pub parent: Option<Parent>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<FileType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_expanded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// `parentId` needs field-presence semantics a plain `Option<Parent>` can't
/// express: an *absent* field leaves the parent alone, while a *present* but
/// `null` field moves the record to the root. `skip_serializing_if` handles
/// the absent side; this module maps present-null to `Parent::Root`.
mod parent_field {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Parent, RecordId};

    pub fn serialize<S: Serializer>(value: &Option<Parent>, s: S) -> Result<S::Ok, S::Error> {
        let id: Option<RecordId> = match value {
            Some(parent) => (*parent).into(),
            None => None,
        };
        id.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Parent>, D::Error> {
        let id = Option::<RecordId>::deserialize(d)?;
        Ok(Some(id.into()))
    }
}

impl RecordPatch {
    /// Overwrite the set fields on an existing record.
    pub fn apply(&self, record: &mut FileRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(parent) = self.parent {
            record.parent = parent;
        }
        if let Some(kind) = self.kind {
            record.kind = kind;
        }
        if let Some(order) = self.order {
            record.order = order;
        }
        if let Some(is_expanded) = self.is_expanded {
            record.is_expanded = is_expanded;
        }
        if let Some(content) = &self.content {
            record.content = Some(content.clone());
        }
    }

    /// Materialize a new record from this patch, or `None` if a required
    /// field is missing (name, parent, type, order).
    pub fn create(&self, id: RecordId, project_id: ProjectId) -> Option<FileRecord> {
        let kind = self.kind?;
        Some(FileRecord {
            id,
            project_id,
            parent: self.parent?,
            name: self.name.clone()?,
            order: self.order?,
            kind,
            is_expanded: self.is_expanded.unwrap_or(false),
            content: match kind {
                FileType::File => Some(self.content.clone().unwrap_or_default()),
                FileType::Folder => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_roundtrip() {
        let original = RecordId::generate();
        let parsed: RecordId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_record_serializes_camel_case_with_null_parent() {
        let project = ProjectId::generate();
        let record = FileRecord::new_file(project, Parent::Root, "notes.tex", 0);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["parentId"], serde_json::Value::Null);
        assert_eq!(value["type"], "file");
        assert_eq!(value["isExpanded"], false);
        assert_eq!(value["projectId"], json!(project.to_string()));
    }

    #[test]
    fn test_null_parent_decodes_as_root() {
        let record: FileRecord = serde_json::from_value(json!({
            "id": RecordId::generate().to_string(),
            "projectId": ProjectId::generate().to_string(),
            "parentId": null,
            "name": "main.tex",
            "order": 0,
            "type": "file",
            "content": ""
        }))
        .unwrap();

        assert_eq!(record.parent, Parent::Root);
        assert!(!record.is_expanded); // defaulted
    }

    #[test]
    fn test_decode_records_quarantines_malformed() {
        let good = serde_json::to_value(FileRecord::new_folder(
            ProjectId::generate(),
            Parent::Root,
            "chapters",
            0,
        ))
        .unwrap();
        let missing_name = json!({
            "id": RecordId::generate().to_string(),
            "projectId": ProjectId::generate().to_string(),
            "parentId": null,
            "order": 1,
            "type": "file"
        });
        let not_an_object = json!("garbage");

        let (records, quarantined) = decode_records(&[good, missing_name, not_an_object]);
        assert_eq!(records.len(), 1);
        assert_eq!(quarantined, 2);
        assert_eq!(records[0].name, "chapters");
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut record = FileRecord::new_file(ProjectId::generate(), Parent::Root, "a", 0);
        record.name = "   ".into();
        assert!(matches!(record.validate(), Err(RecordError::EmptyName)));
    }

    #[test]
    fn test_validate_rejects_content_on_folder() {
        let mut record = FileRecord::new_folder(ProjectId::generate(), Parent::Root, "ch", 0);
        record.content = Some("body".into());
        assert!(matches!(
            record.validate(),
            Err(RecordError::ContentOnFolder)
        ));
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let mut record = FileRecord::new_file(ProjectId::generate(), Parent::Root, "old", 3);
        let patch = RecordPatch {
            name: Some("new".into()),
            ..Default::default()
        };

        patch.apply(&mut record);
        assert_eq!(record.name, "new");
        assert_eq!(record.order, 3);
        assert_eq!(record.parent, Parent::Root);
    }

    #[test]
    fn test_patch_parent_null_roundtrips_as_move_to_root() {
        let patch = RecordPatch {
            parent: Some(Parent::Root),
            ..Default::default()
        };

        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["parentId"], serde_json::Value::Null);

        let back: RecordPatch = serde_json::from_value(json).unwrap();
        assert_eq!(back.parent, Some(Parent::Root));
    }

    #[test]
    fn test_patch_without_parent_field_stays_none() {
        let back: RecordPatch = serde_json::from_value(json!({ "name": "x" })).unwrap();
        assert_eq!(back.parent, None);
    }

    #[test]
    fn test_patch_create_requires_full_field_set() {
        let id = RecordId::generate();
        let project = ProjectId::generate();

        let partial = RecordPatch {
            name: Some("orphan".into()),
            ..Default::default()
        };
        assert!(partial.create(id, project).is_none());

        let full = RecordPatch {
            name: Some("notes.tex".into()),
            parent: Some(Parent::Root),
            kind: Some(FileType::File),
            order: Some(0),
            ..Default::default()
        };
        let record = full.create(id, project).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.content, Some(String::new())); // files start empty
    }

    #[test]
    fn test_patch_create_folder_has_no_content() {
        let full = RecordPatch {
            name: Some("chapters".into()),
            parent: Some(Parent::Root),
            kind: Some(FileType::Folder),
            order: Some(0),
            ..Default::default()
        };
        let record = full
            .create(RecordId::generate(), ProjectId::generate())
            .unwrap();
        assert_eq!(record.content, None);
    }
}

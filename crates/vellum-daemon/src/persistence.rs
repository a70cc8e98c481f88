//! On-disk persistence for project record sets.
//!
//! Each project's flat record set lives in `projects/<project-id>.json`
//! under the daemon's data directory. Writes are whole-file replacements —
//! the sets are small (one document project) and the daemon serializes all
//! mutations, so there is nothing to merge on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vellum_core::record::{FileRecord, ProjectId};

/// One project's persisted record set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedProject {
    pub files: Vec<FileRecord>,
}

/// Storage root for all projects the daemon serves.
pub struct ProjectStorage {
    projects_dir: PathBuf,
}

impl ProjectStorage {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            projects_dir: data_dir.join("projects"),
        }
    }

    fn project_path(&self, project: ProjectId) -> PathBuf {
        self.projects_dir.join(format!("{}.json", project))
    }

    /// Load a project's record set. A project with no file yet is simply
    /// empty — first write creates it.
    pub fn load(&self, project: ProjectId) -> Result<Vec<FileRecord>> {
        let path = self.project_path(project);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let persisted: PersistedProject = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(persisted.files)
    }

    /// Save a project's record set, creating the directory on first write.
    pub fn save(&self, project: ProjectId, records: &[FileRecord]) -> Result<()> {
        fs::create_dir_all(&self.projects_dir)?;

        let persisted = PersistedProject {
            files: records.to_vec(),
        };
        let contents = serde_json::to_string_pretty(&persisted)?;
        let path = self.project_path(project);
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Ids of every project with a persisted record set.
    pub fn list_projects(&self) -> Result<Vec<ProjectId>> {
        if !self.projects_dir.exists() {
            return Ok(Vec::new());
        }

        let mut projects = Vec::new();
        for entry in fs::read_dir(&self.projects_dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match stem.parse::<ProjectId>() {
                Ok(project) => projects.push(project),
                Err(_) => {
                    tracing::warn!("Skipping non-project file {}", path.display());
                }
            }
        }
        Ok(projects)
    }
}

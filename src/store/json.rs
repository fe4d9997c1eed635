use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use log::{debug, error};
use crate::config::defs::PipelineError;
use crate::store::memory::{MemoryStore, StoreSnapshot};
use crate::store::{
    Artifact, ArtifactFilter, ArtifactRegistry, NewArtifact, NewProject, Project, ProjectStatus,
    ProjectStore,
};

/// `MemoryStore` that rewrites a JSON snapshot after every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    memory: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let snapshot = if path.exists() {
            let raw = fs::read_to_string(path)?;
            serde_json::from_str::<StoreSnapshot>(&raw)
                .map_err(|e| PipelineError::Store(format!("{}: {}", path.display(), e)))?
        } else {
            StoreSnapshot::default()
        };
        Ok(JsonFileStore {
            path: path.to_path_buf(),
            memory: MemoryStore::from_snapshot(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    /// Applies `op` and writes the result out. If the snapshot cannot be
    /// written the in-memory change is rolled back, so memory and disk agree.
    fn mutate<T>(&self, op: impl FnOnce(&MemoryStore) -> Result<T, PipelineError>) -> Result<T, PipelineError> {
        let _guard = self.lock_writes()?;
        let before = self.memory.snapshot()?;
        let value = op(&self.memory)?;
        if let Err(e) = self.write_snapshot() {
            self.memory.restore(before)?;
            return Err(e);
        }
        Ok(value)
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, PipelineError> {
        self.write_lock
            .lock()
            .map_err(|_| PipelineError::Store("snapshot lock poisoned".to_string()))
    }

    fn write_snapshot(&self) -> Result<(), PipelineError> {
        let snapshot = self.memory.snapshot()?;
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| PipelineError::Store(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Store snapshot written to {}", self.path.display());
        Ok(())
    }
}

impl ProjectStore for JsonFileStore {
    fn create_project(&self, new: NewProject) -> Result<Project, PipelineError> {
        self.mutate(|memory| memory.create_project(new))
    }

    fn get_project(&self, id: u64) -> Result<Project, PipelineError> {
        self.memory.get_project(id)
    }

    fn set_project_size(&self, id: u64, size: u64) -> Result<Project, PipelineError> {
        self.mutate(|memory| memory.set_project_size(id, size))
    }

    fn try_begin_run(&self, id: u64) -> Result<Project, PipelineError> {
        self.mutate(|memory| memory.try_begin_run(id))
    }

    fn transition(&self, id: u64, status: ProjectStatus, error_message: Option<String>) -> Result<Project, PipelineError> {
        self.mutate(|memory| memory.transition(id, status, error_message))
    }

    /// The release always sticks in memory; a failed write is only logged
    /// because the on-disk row is then stale, not inconsistent.
    fn release_run(&self, id: u64, error_message: String) -> Result<Project, PipelineError> {
        let _guard = self.lock_writes()?;
        let project = self.memory.release_run(id, error_message)?;
        if let Err(e) = self.write_snapshot() {
            error!("Project {} released in memory only: {}", id, e);
        }
        Ok(project)
    }

    fn list_projects(&self, session_id: Option<&str>) -> Result<Vec<Project>, PipelineError> {
        self.memory.list_projects(session_id)
    }
}

impl ArtifactRegistry for JsonFileStore {
    fn register(&self, project_id: u64, new: NewArtifact) -> Result<Artifact, PipelineError> {
        self.mutate(|memory| memory.register(project_id, new))
    }

    fn query(&self, project_id: u64, filter: &ArtifactFilter) -> Result<Vec<Artifact>, PipelineError> {
        self.memory.query(project_id, filter)
    }
}

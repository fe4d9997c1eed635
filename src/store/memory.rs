use std::collections::BTreeMap;
use std::fs;
use std::sync::{Mutex, MutexGuard};
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::config::defs::PipelineError;
use crate::store::{
    Artifact, ArtifactFilter, ArtifactRegistry, NewArtifact, NewProject, Project, ProjectStatus,
    ProjectStore,
};

/// Everything the store holds; also the on-disk snapshot format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_project_id: u64,
    pub next_artifact_id: u64,
    pub projects: BTreeMap<u64, Project>,
    /// Per project, in creation order.
    pub artifacts: BTreeMap<u64, Vec<Artifact>>,
}

/// In-process store. Every trait call is one critical section, which is what
/// makes `try_begin_run` and `transition` atomic against concurrent callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        MemoryStore { inner: Mutex::new(snapshot) }
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, PipelineError> {
        Ok(self.lock()?.clone())
    }

    /// Replaces the whole state, e.g. to undo a change that could not be saved.
    pub fn restore(&self, snapshot: StoreSnapshot) -> Result<(), PipelineError> {
        *self.lock()? = snapshot;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreSnapshot>, PipelineError> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::Store("store mutex poisoned".to_string()))
    }
}

impl ProjectStore for MemoryStore {
    fn create_project(&self, new: NewProject) -> Result<Project, PipelineError> {
        new.validate()?;
        let mut state = self.lock()?;
        state.next_project_id += 1;
        let project = Project {
            id: state.next_project_id,
            session_id: new.session_id,
            name: new.name,
            status: ProjectStatus::Pending,
            species: new.species,
            genome_reference: new.genome_reference,
            pipeline_version: new.pipeline_version,
            sequencing_type: new.sequencing_type,
            pvalue_cutoff: new.pvalue_cutoff,
            is_running: false,
            error_message: None,
            project_size: None,
            created_at: Utc::now(),
        };
        state.projects.insert(project.id, project.clone());
        Ok(project)
    }

    fn get_project(&self, id: u64) -> Result<Project, PipelineError> {
        let state = self.lock()?;
        state.projects.get(&id).cloned().ok_or(PipelineError::ProjectNotFound(id))
    }

    fn set_project_size(&self, id: u64, size: u64) -> Result<Project, PipelineError> {
        let mut state = self.lock()?;
        let project = state.projects.get_mut(&id).ok_or(PipelineError::ProjectNotFound(id))?;
        project.project_size = Some(size);
        Ok(project.clone())
    }

    fn try_begin_run(&self, id: u64) -> Result<Project, PipelineError> {
        let mut state = self.lock()?;
        let project = state.projects.get_mut(&id).ok_or(PipelineError::ProjectNotFound(id))?;
        if project.is_running {
            return Err(PipelineError::AlreadyRunning { project_id: id });
        }
        if project.status.is_terminal() {
            debug!("Resetting project {} from {} for a new run", id, project.status);
            project.status = ProjectStatus::Pending;
            project.error_message = None;
        }
        project.is_running = true;
        Ok(project.clone())
    }

    fn transition(&self, id: u64, status: ProjectStatus, error_message: Option<String>) -> Result<Project, PipelineError> {
        let mut state = self.lock()?;
        let project = state.projects.get_mut(&id).ok_or(PipelineError::ProjectNotFound(id))?;
        project.status = status;
        if error_message.is_some() {
            project.error_message = error_message;
        }
        project.is_running = !status.is_terminal();
        Ok(project.clone())
    }

    fn release_run(&self, id: u64, error_message: String) -> Result<Project, PipelineError> {
        let mut state = self.lock()?;
        let project = state.projects.get_mut(&id).ok_or(PipelineError::ProjectNotFound(id))?;
        project.status = ProjectStatus::Failed;
        project.error_message = Some(error_message);
        project.is_running = false;
        Ok(project.clone())
    }

    fn list_projects(&self, session_id: Option<&str>) -> Result<Vec<Project>, PipelineError> {
        let state = self.lock()?;
        Ok(state
            .projects
            .values()
            .filter(|p| session_id.map_or(true, |s| p.session_id == s))
            .cloned()
            .collect())
    }
}

impl ArtifactRegistry for MemoryStore {
    fn register(&self, project_id: u64, new: NewArtifact) -> Result<Artifact, PipelineError> {
        // Checked outside the lock; registration is a post-condition of production.
        let metadata = fs::metadata(&new.path)
            .map_err(|_| PipelineError::MissingInput { path: new.path.clone() })?;
        let size = match new.size {
            Some(size) => Some(size),
            None if metadata.is_file() => Some(metadata.len()),
            None => None,
        };

        let mut state = self.lock()?;
        if !state.projects.contains_key(&project_id) {
            return Err(PipelineError::ProjectNotFound(project_id));
        }
        state.next_artifact_id += 1;
        let artifact = Artifact {
            id: state.next_artifact_id,
            project_id,
            kind: new.kind,
            path: new.path,
            is_directory: new.is_directory,
            file_format: new.file_format,
            size,
            created_at: Utc::now(),
        };
        state.artifacts.entry(project_id).or_default().push(artifact.clone());
        Ok(artifact)
    }

    fn query(&self, project_id: u64, filter: &ArtifactFilter) -> Result<Vec<Artifact>, PipelineError> {
        let state = self.lock()?;
        Ok(state
            .artifacts
            .get(&project_id)
            .map(|artifacts| artifacts.iter().filter(|a| filter.matches(a)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ArtifactKind, SequencingLayout};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn new_project() -> NewProject {
        NewProject {
            session_id: "session-a".to_string(),
            name: "yeast heat shock".to_string(),
            species: "yeast".to_string(),
            genome_reference: "Saccharomyces cerevisiae (R64-1-1)".to_string(),
            pipeline_version: "1.0.0".to_string(),
            sequencing_type: SequencingLayout::Single,
            pvalue_cutoff: 0.05,
        }
    }

    #[test]
    fn test_begin_run_is_single_flight() {
        let store = MemoryStore::new();
        let project = store.create_project(new_project()).unwrap();
        assert_eq!(project.status, ProjectStatus::Pending);

        let running = store.try_begin_run(project.id).unwrap();
        assert!(running.is_running);

        let err = store.try_begin_run(project.id).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRunning { project_id } if project_id == project.id));
        assert!(store.get_project(project.id).unwrap().is_running);
    }

    #[test]
    fn test_terminal_transition_clears_running_flag() {
        let store = MemoryStore::new();
        let project = store.create_project(new_project()).unwrap();
        store.try_begin_run(project.id).unwrap();

        let aligning = store.transition(project.id, ProjectStatus::Aligning, None).unwrap();
        assert!(aligning.is_running);

        let failed = store
            .transition(project.id, ProjectStatus::Failed, Some("hisat2 died".to_string()))
            .unwrap();
        assert!(!failed.is_running);
        assert_eq!(failed.error_message.as_deref(), Some("hisat2 died"));

        // A new run resets the terminal state.
        let rerun = store.try_begin_run(project.id).unwrap();
        assert_eq!(rerun.status, ProjectStatus::Pending);
        assert!(rerun.error_message.is_none());
    }

    #[test]
    fn test_concurrent_begin_only_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let project = store.create_project(new_project()).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.try_begin_run(project.id).is_ok())
            })
            .collect();
        let wins = handles.into_iter().filter_map(|h| h.join().ok()).filter(|won| *won).count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_register_requires_existing_path() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let project = store.create_project(new_project()).unwrap();

        let missing = dir.path().join("nope.fastq");
        let err = store
            .register(project.id, NewArtifact::file(ArtifactKind::InputFastq, &missing))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { .. }));

        let present = dir.path().join("ctrl1.fastq");
        fs::write(&present, b"@r1\nACGT\n+\nIIII\n").unwrap();
        let artifact = store
            .register(project.id, NewArtifact::file(ArtifactKind::InputFastq, &present))
            .unwrap();
        assert_eq!(artifact.size, Some(16));
        assert_eq!(artifact.file_format, "fastq");
    }

    #[test]
    fn test_query_filters_in_creation_order() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let project = store.create_project(new_project()).unwrap();
        let other = store.create_project(new_project()).unwrap();

        for name in ["b.fastq", "a.fastq"] {
            let path = dir.path().join(name);
            fs::write(&path, b"").unwrap();
            store.register(project.id, NewArtifact::file(ArtifactKind::InputFastq, &path)).unwrap();
        }
        let html = dir.path().join("b_fastqc.html");
        fs::write(&html, b"<html/>").unwrap();
        store.register(project.id, NewArtifact::file(ArtifactKind::FastqcOutput, &html)).unwrap();
        store.register(other.id, NewArtifact::file(ArtifactKind::InputFastq, &html)).unwrap();

        let inputs = store.query(project.id, &ArtifactFilter::kind(ArtifactKind::InputFastq)).unwrap();
        let names: Vec<_> = inputs.iter().map(|a| a.path.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["b.fastq", "a.fastq"]);

        let by_format = ArtifactFilter { format: Some("html".to_string()), ..Default::default() };
        assert_eq!(store.query(project.id, &by_format).unwrap().len(), 1);

        let by_path = ArtifactFilter { paths: Some(vec![html.clone()]), ..Default::default() };
        assert_eq!(store.query(other.id, &by_path).unwrap().len(), 1);
    }
}

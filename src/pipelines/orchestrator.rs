use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info};
use crate::config::defs::{
    PipelineError, RunConfig, DESEQ2_DIR, FASTQC_DIR, FASTQC_TRIMMED_DIR, FEATURECOUNTS_DIR,
    HISAT2_DIR, SAMTOOLS_DIR, TRIMMOMATIC_DIR,
};
use crate::pipelines::align::AlignExecutor;
use crate::pipelines::differential::DifferentialExecutor;
use crate::pipelines::enrichment::EnrichmentExecutor;
use crate::pipelines::events::{NotificationPublisher, StatusEvent};
use crate::pipelines::qc::QcExecutor;
use crate::pipelines::quantify::QuantifyExecutor;
use crate::pipelines::router::{decide_trim_needed, load_qc_signals, select_alignment_inputs};
use crate::pipelines::sort_index::SortIndexExecutor;
use crate::pipelines::trim::TrimExecutor;
use crate::pipelines::{StageContext, StageExecutor};
use crate::store::{
    Artifact, ArtifactFilter, ArtifactKind, ArtifactRegistry, NewArtifact, NewProject, Project,
    ProjectStatus, ProjectStore,
};


/// Cooperative cancellation, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}


/// Edges of the run graph. `Failed` is reachable from every live state.
pub fn is_allowed(from: ProjectStatus, to: ProjectStatus) -> bool {
    use ProjectStatus::*;
    if to == Failed {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Pending, Processing)
            | (Processing, Trimming)
            | (Processing, Aligning)
            | (Trimming, PostTrimQc)
            | (Trimming, Aligning)
            | (PostTrimQc, Aligning)
            | (Aligning, Converting)
            | (Converting, Quantifying)
            | (Quantifying, DifferentialExpression)
            | (DifferentialExpression, Completed)
    )
}


/// Status bookkeeping for one run. Each transition is persisted first and
/// then handed back as the event to publish.
pub struct PipelineStateMachine<'a> {
    store: &'a dyn ProjectStore,
    project: Project,
}

impl<'a> PipelineStateMachine<'a> {
    /// Claims the single-flight flag and enters `pending`.
    pub fn begin(store: &'a dyn ProjectStore, project_id: u64) -> Result<(Self, StatusEvent), PipelineError> {
        let project = store.try_begin_run(project_id)?;
        let event = StatusEvent::from_project(&project);
        Ok((PipelineStateMachine { store, project }, event))
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn status(&self) -> ProjectStatus {
        self.project.status
    }

    pub fn transition(&mut self, next: ProjectStatus) -> Result<StatusEvent, PipelineError> {
        self.apply(next, None)
    }

    /// Terminal failure carrying `message`; also releases `is_running`.
    pub fn fail(&mut self, message: String) -> Result<StatusEvent, PipelineError> {
        self.apply(ProjectStatus::Failed, Some(message))
    }

    fn apply(&mut self, next: ProjectStatus, error_message: Option<String>) -> Result<StatusEvent, PipelineError> {
        let current = self.project.status;
        if !is_allowed(current, next) {
            return Err(PipelineError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.project = self.store.transition(self.project.id, next, error_message)?;
        debug!("Project {}: {} -> {}", self.project.id, current, next);
        Ok(StatusEvent::from_project(&self.project))
    }
}


/// Drives one project through every stage, sequentially.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    config: Arc<RunConfig>,
    projects: Arc<dyn ProjectStore>,
    artifacts: Arc<dyn ArtifactRegistry>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        projects: Arc<dyn ProjectStore>,
        artifacts: Arc<dyn ArtifactRegistry>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        PipelineOrchestrator { config, projects, artifacts, publisher }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Creates a project and registers its reads and sample metadata.
    ///
    /// # Arguments
    ///
    /// * `new` - Project fields from the submitter.
    /// * `reads` - Input FASTQ files (plain or gzipped).
    /// * `metadata` - Sample/condition table for differential expression.
    ///
    /// # Returns
    /// The created project with `project_size` set to the summed input size.
    pub fn submit(&self, new: NewProject, reads: &[PathBuf], metadata: &Path) -> Result<Project, PipelineError> {
        new.validate()?;
        if reads.is_empty() {
            return Err(PipelineError::InvalidInput("no input reads given".to_string()));
        }
        // Species must resolve before anything is written.
        self.config.references.get(&new.species)?;
        for path in reads.iter().map(PathBuf::as_path).chain([metadata]) {
            if !path.exists() {
                return Err(PipelineError::MissingInput { path: path.to_path_buf() });
            }
        }

        let project = self.projects.create_project(new)?;
        let mut total = 0;
        for read in reads {
            let artifact = self.artifacts.register(project.id, NewArtifact::file(ArtifactKind::InputFastq, read))?;
            total += artifact.size.unwrap_or(0);
        }
        self.artifacts.register(project.id, NewArtifact::file(ArtifactKind::DeseqMetadata, metadata))?;
        let project = self.projects.set_project_size(project.id, total)?;
        info!(
            "Submitted project {} ({}) with {} read files, {} bytes",
            project.id,
            project.name,
            reads.len(),
            total
        );
        Ok(project)
    }

    /// Runs the whole pipeline for `project_id`.
    ///
    /// A second concurrent call fails with `AlreadyRunning` and leaves the
    /// running project untouched. Any other error ends the run in `failed`
    /// with the error text as the project's `error_message`.
    pub async fn run(&self, project_id: u64, cancel: Option<CancelToken>) -> Result<Project, PipelineError> {
        let (mut machine, event) = PipelineStateMachine::begin(self.projects.as_ref(), project_id)?;
        self.publisher.publish(event);
        let cancel = cancel.unwrap_or_default();

        match self.execute(&mut machine, &cancel).await {
            Ok(()) => {
                info!("Project {} completed", project_id);
                Ok(machine.project().clone())
            }
            Err(e) => {
                error!("Project {} failed in {}: {}", project_id, machine.status(), e);
                let recorded = machine.fail(e.to_string()).or_else(|store_err| {
                    error!("Could not record failure of project {}: {}", project_id, store_err);
                    self.projects
                        .release_run(project_id, e.to_string())
                        .map(|project| StatusEvent::from_project(&project))
                });
                match recorded {
                    Ok(event) => self.publisher.publish(event),
                    Err(store_err) => error!("Project {} is still marked running: {}", project_id, store_err),
                }
                Err(e)
            }
        }
    }

    fn advance(
        &self,
        machine: &mut PipelineStateMachine<'_>,
        next: ProjectStatus,
        cancel: &CancelToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let event = machine.transition(next)?;
        info!("Project {} is now {}", event.project_id, event.status);
        self.publisher.publish(event);
        Ok(())
    }

    async fn execute(&self, machine: &mut PipelineStateMachine<'_>, cancel: &CancelToken) -> Result<(), PipelineError> {
        let pause = self.config.settings.pending_pause_ms;
        if pause > 0 {
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }

        let project = machine.project().clone();
        let registry = self.artifacts.as_ref();
        let ctx = StageContext { config: self.config.as_ref(), registry };
        let stage_dir = |stage: &str| self.config.stage_dir(&project.session_id, project.id, stage);

        let inputs = registry.query(project.id, &ArtifactFilter::kind(ArtifactKind::InputFastq))?;
        if inputs.is_empty() {
            return Err(PipelineError::InvalidInput(format!("project {} has no input reads", project.id)));
        }

        self.advance(machine, ProjectStatus::Processing, cancel)?;
        let qc_dir = stage_dir(FASTQC_DIR);
        QcExecutor::initial().run(&ctx, &project, &inputs, &qc_dir).await?.require_complete()?;
        let signals = load_qc_signals(registry, project.id, &inputs, &qc_dir)?;

        let mut trimmed: Vec<Artifact> = Vec::new();
        if decide_trim_needed(&signals) {
            self.advance(machine, ProjectStatus::Trimming, cancel)?;
            let by_path: HashMap<PathBuf, _> = inputs.iter().map(|a| a.path.clone()).zip(signals).collect();
            let trim = TrimExecutor::new(by_path)
                .run(&ctx, &project, &inputs, &stage_dir(TRIMMOMATIC_DIR))
                .await?;
            trim.require_complete()?;
            trimmed = trim
                .artifacts
                .into_iter()
                .filter(|a| matches!(a.kind, ArtifactKind::TrimmomaticFastq | ArtifactKind::TrimmomaticFastqPaired))
                .collect();

            if !trimmed.is_empty() {
                self.advance(machine, ProjectStatus::PostTrimQc, cancel)?;
                QcExecutor::post_trim()
                    .run(&ctx, &project, &trimmed, &stage_dir(FASTQC_TRIMMED_DIR))
                    .await?;
            }
        } else {
            info!("All inputs of project {} passed QC, skipping trimming", project.id);
        }

        let samples = select_alignment_inputs(project.sequencing_type, &trimmed, &inputs)?;
        let align_inputs: Vec<Artifact> = samples.iter().flat_map(|s| s.artifacts()).cloned().collect();
        self.advance(machine, ProjectStatus::Aligning, cancel)?;
        let aligned = AlignExecutor
            .run(&ctx, &project, &align_inputs, &stage_dir(HISAT2_DIR))
            .await?;
        aligned.require_complete()?;

        self.advance(machine, ProjectStatus::Converting, cancel)?;
        let sorted = SortIndexExecutor
            .run(&ctx, &project, &aligned.of_kind(ArtifactKind::Hisat2Bam), &stage_dir(SAMTOOLS_DIR))
            .await?;
        sorted.require_complete()?;
        let sorted_bams = sorted.of_kind(ArtifactKind::SamtoolsBam);
        if sorted_bams.len() != samples.len() {
            return Err(PipelineError::InvalidInput(format!(
                "{} samples but {} sorted alignments",
                samples.len(),
                sorted_bams.len()
            )));
        }

        self.advance(machine, ProjectStatus::Quantifying, cancel)?;
        let counts = QuantifyExecutor
            .run(&ctx, &project, &sorted_bams, &stage_dir(FEATURECOUNTS_DIR))
            .await?;
        counts.require_complete()?;

        self.advance(machine, ProjectStatus::DifferentialExpression, cancel)?;
        let mut de_inputs = counts.of_kind(ArtifactKind::FeaturecountsCounts);
        de_inputs.extend(registry.query(project.id, &ArtifactFilter::kind(ArtifactKind::DeseqMetadata))?);
        let de_dir = stage_dir(DESEQ2_DIR);
        let de = DifferentialExecutor.run(&ctx, &project, &de_inputs, &de_dir).await?;
        de.require_complete()?;

        if self.config.settings.enrichment {
            EnrichmentExecutor
                .run(&ctx, &project, &de.of_kind(ArtifactKind::DeseqOutput), &de_dir)
                .await?;
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let event = machine.transition(ProjectStatus::Completed)?;
        self.publisher.publish(event);
        Ok(())
    }
}

//! Stage executors, routing and the run state machine.
//!
//! Every executor follows the same contract: check inputs exist, run one
//! external tool, register what it produced. Soft problems are returned as
//! warnings next to the artifacts; hard failures are `PipelineError`s.

pub mod align;
pub mod differential;
pub mod enrichment;
pub mod events;
pub mod orchestrator;
pub mod qc;
pub mod quantify;
pub mod router;
pub mod sort_index;
pub mod trim;

use std::path::{Path, PathBuf};
use log::{info, warn};
use crate::config::defs::{PipelineError, RunConfig};
use crate::store::{Artifact, ArtifactKind, ArtifactRegistry, NewArtifact, Project};

/// Shared handles passed to every executor.
pub struct StageContext<'a> {
    pub config: &'a RunConfig,
    pub registry: &'a dyn ArtifactRegistry,
}

impl<'a> StageContext<'a> {
    pub fn register(&self, project: &Project, new: NewArtifact) -> Result<Artifact, PipelineError> {
        let artifact = self.registry.register(project.id, new)?;
        info!(
            "Registered {} artifact {} for project {}",
            artifact.kind,
            artifact.path.display(),
            project.id
        );
        Ok(artifact)
    }
}

/// Diagnostics collected alongside a successful stage.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub stage: &'static str,
    pub warnings: Vec<String>,
    /// Expected outputs the next stage depends on but that were not found.
    pub missing_required: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub artifacts: Vec<Artifact>,
    pub result: StageResult,
}

impl StageOutput {
    pub fn new(stage: &'static str) -> Self {
        StageOutput {
            artifacts: Vec::new(),
            result: StageResult { stage, ..Default::default() },
        }
    }

    pub fn warn(&mut self, message: String) {
        warn!("[{}] {}", self.result.stage, message);
        self.result.warnings.push(message);
    }

    /// Registers `path` when it exists; otherwise records a warning.
    /// A missing `required` output is also remembered for `require_complete`.
    pub fn collect(
        &mut self,
        ctx: &StageContext<'_>,
        project: &Project,
        kind: ArtifactKind,
        path: &Path,
        required: bool,
    ) -> Result<Option<Artifact>, PipelineError> {
        if !path.exists() {
            self.warn(format!("expected {} output {} was not produced", kind, path.display()));
            if required {
                self.result.missing_required.push(path.to_path_buf());
            }
            return Ok(None);
        }
        let new = if path.is_dir() {
            NewArtifact::directory(kind, path)
        } else {
            NewArtifact::file(kind, path)
        };
        let artifact = ctx.register(project, new)?;
        self.artifacts.push(artifact.clone());
        Ok(Some(artifact))
    }

    pub fn of_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        self.artifacts.iter().filter(|a| a.kind == kind).cloned().collect()
    }

    /// Fails with `MissingOutput` for the first required output that never appeared.
    pub fn require_complete(&self) -> Result<(), PipelineError> {
        match self.result.missing_required.first() {
            Some(path) => Err(PipelineError::MissingOutput {
                stage: self.result.stage.to_string(),
                path: path.clone(),
            }),
            None => Ok(()),
        }
    }
}

pub fn ensure_inputs_exist<'a, I>(paths: I) -> Result<(), PipelineError>
where
    I: IntoIterator<Item = &'a Path>,
{
    for path in paths {
        if !path.exists() {
            return Err(PipelineError::MissingInput { path: path.to_path_buf() });
        }
    }
    Ok(())
}

/// One pipeline stage bound to one external tool.
#[allow(async_fn_in_trait)]
pub trait StageExecutor {
    const STAGE: &'static str;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError>;
}

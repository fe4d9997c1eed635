//! Project rows and the append-only artifact catalog.
//!
//! The core only talks to the [`ProjectStore`] and [`ArtifactRegistry`]
//! traits. `MemoryStore` is the reference adapter, `JsonFileStore` snapshots
//! it to disk for the CLI.

pub mod json;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::config::defs::PipelineError;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Processing,
    Trimming,
    PostTrimQc,
    Aligning,
    Converting,
    Quantifying,
    DifferentialExpression,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Processing => "processing",
            ProjectStatus::Trimming => "trimming",
            ProjectStatus::PostTrimQc => "post_trim_qc",
            ProjectStatus::Aligning => "aligning",
            ProjectStatus::Converting => "converting",
            ProjectStatus::Quantifying => "quantifying",
            ProjectStatus::DifferentialExpression => "differential_expression",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencingLayout {
    Single,
    Paired,
}

impl SequencingLayout {
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw.trim().to_lowercase().as_str() {
            "single" => Ok(SequencingLayout::Single),
            "paired" => Ok(SequencingLayout::Paired),
            other => Err(PipelineError::InvalidInput(format!("Invalid sequencing type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub session_id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub species: String,
    pub genome_reference: String,
    pub pipeline_version: String,
    pub sequencing_type: SequencingLayout,
    pub pvalue_cutoff: f64,
    pub is_running: bool,
    pub error_message: Option<String>,
    pub project_size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when a workflow is submitted.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub session_id: String,
    pub name: String,
    pub species: String,
    pub genome_reference: String,
    pub pipeline_version: String,
    pub sequencing_type: SequencingLayout,
    pub pvalue_cutoff: f64,
}

impl NewProject {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.pvalue_cutoff) {
            return Err(PipelineError::InvalidInput(format!(
                "p-value cutoff {} outside [0, 1]",
                self.pvalue_cutoff
            )));
        }
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidInput("project name is empty".to_string()));
        }
        Ok(())
    }
}

/// Role of a registered file. The stage set is fixed at compile time, so
/// the role is a closed enum; the serialized tags match the legacy strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    InputFastq,
    DeseqMetadata,
    FastqcOutput,
    FastqcData,
    FastqcTrimmedOutput,
    FastqcTrimmedData,
    TrimmomaticFastq,
    TrimmomaticFastqPaired,
    TrimmomaticFastqUnpaired,
    Hisat2Bam,
    Hisat2Summary,
    SamtoolsBam,
    SamtoolsBai,
    FeaturecountsCounts,
    FeaturecountsSummary,
    DeseqOutput,
    DeseqSignificant,
    DeseqPca,
    DeseqClustering,
    EnrichmentOutput,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::InputFastq => "input_fastq",
            ArtifactKind::DeseqMetadata => "deseq_metadata",
            ArtifactKind::FastqcOutput => "fastqc_output",
            ArtifactKind::FastqcData => "fastqc_data",
            ArtifactKind::FastqcTrimmedOutput => "fastqc_trimmed_output",
            ArtifactKind::FastqcTrimmedData => "fastqc_trimmed_data",
            ArtifactKind::TrimmomaticFastq => "trimmomatic_fastq",
            ArtifactKind::TrimmomaticFastqPaired => "trimmomatic_fastq_paired",
            ArtifactKind::TrimmomaticFastqUnpaired => "trimmomatic_fastq_unpaired",
            ArtifactKind::Hisat2Bam => "hisat2_bam",
            ArtifactKind::Hisat2Summary => "hisat2_summary",
            ArtifactKind::SamtoolsBam => "samtools_bam",
            ArtifactKind::SamtoolsBai => "samtools_bai",
            ArtifactKind::FeaturecountsCounts => "featurecounts_counts",
            ArtifactKind::FeaturecountsSummary => "featurecounts_summary",
            ArtifactKind::DeseqOutput => "deseq_output",
            ArtifactKind::DeseqSignificant => "deseq_significant",
            ArtifactKind::DeseqPca => "deseq_pca",
            ArtifactKind::DeseqClustering => "deseq_clustering",
            ArtifactKind::EnrichmentOutput => "enrichment_output",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub project_id: u64,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub is_directory: bool,
    pub file_format: String,
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Registration request; `size` is read from disk when left empty.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub is_directory: bool,
    pub file_format: String,
    pub size: Option<u64>,
}

impl NewArtifact {
    pub fn file(kind: ArtifactKind, path: &Path) -> Self {
        NewArtifact {
            kind,
            path: path.to_path_buf(),
            is_directory: false,
            file_format: crate::utils::file::format_tag(path),
            size: None,
        }
    }

    pub fn directory(kind: ArtifactKind, path: &Path) -> Self {
        NewArtifact {
            kind,
            path: path.to_path_buf(),
            is_directory: true,
            file_format: "directory".to_string(),
            size: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub kinds: Option<Vec<ArtifactKind>>,
    pub paths: Option<Vec<PathBuf>>,
    pub format: Option<String>,
}

impl ArtifactFilter {
    pub fn kind(kind: ArtifactKind) -> Self {
        ArtifactFilter { kinds: Some(vec![kind]), ..Default::default() }
    }

    pub fn kinds(kinds: &[ArtifactKind]) -> Self {
        ArtifactFilter { kinds: Some(kinds.to_vec()), ..Default::default() }
    }

    pub fn matches(&self, artifact: &Artifact) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&artifact.kind) {
                return false;
            }
        }
        if let Some(paths) = &self.paths {
            if !paths.iter().any(|p| p == &artifact.path) {
                return false;
            }
        }
        if let Some(format) = &self.format {
            if &artifact.file_format != format {
                return false;
            }
        }
        true
    }
}

pub trait ProjectStore: Send + Sync {
    fn create_project(&self, new: NewProject) -> Result<Project, PipelineError>;

    fn get_project(&self, id: u64) -> Result<Project, PipelineError>;

    fn set_project_size(&self, id: u64, size: u64) -> Result<Project, PipelineError>;

    /// Atomic check-and-set of `is_running`. Fails with `AlreadyRunning`
    /// without touching the row when another run holds the flag. A terminal
    /// project is reset to `pending` with its error cleared.
    fn try_begin_run(&self, id: u64) -> Result<Project, PipelineError>;

    /// Moves the project to `status`; entering a terminal status clears
    /// `is_running` in the same critical section.
    fn transition(&self, id: u64, status: ProjectStatus, error_message: Option<String>) -> Result<Project, PipelineError>;

    /// Forces the project to `failed` and clears `is_running`. Used when a
    /// failure could not be recorded through `transition`, so the project
    /// never stays claimed by a run that has ended.
    fn release_run(&self, id: u64, error_message: String) -> Result<Project, PipelineError>;

    fn list_projects(&self, session_id: Option<&str>) -> Result<Vec<Project>, PipelineError>;
}

pub trait ArtifactRegistry: Send + Sync {
    /// Fails with `MissingInput` when `path` does not exist right now.
    fn register(&self, project_id: u64, new: NewArtifact) -> Result<Artifact, PipelineError>;

    /// Matching artifacts in creation order.
    fn query(&self, project_id: u64, filter: &ArtifactFilter) -> Result<Vec<Artifact>, PipelineError>;
}

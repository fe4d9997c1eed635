use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use crate::config::references::ReferenceCatalog;
use crate::config::settings::PipelineSettings;

// External software
pub const FASTQC_TAG: &str = "fastqc";
pub const TRIMMOMATIC_TAG: &str = "trimmomatic";
pub const HISAT2_TAG: &str = "hisat2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const FEATURECOUNTS_TAG: &str = "featureCounts";
pub const DESEQ2_TAG: &str = "run_deseq2";
pub const ENRICHMENT_TAG: &str = "run_enrichment";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Sort,
    Index,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Index => "index",
        }
    }
}

// Static Filenames
pub const FASTQC_DATA_FILE: &str = "fastqc_data.txt";
pub const FEATURECOUNTS_RAW_FILE: &str = "featurecounts_raw.txt";
pub const COUNTS_FILE: &str = "counts.tsv";
pub const DESEQ_COUNTS_FILE: &str = "deseq_counts.tsv";
pub const DESEQ_METADATA_FILE: &str = "deseq_metadata.tsv";
pub const DESEQ_RAW_FILE: &str = "deseq2_raw.tsv";
pub const DESEQ_RESULTS_FILE: &str = "deseq2_results.csv";
pub const DESEQ_SIGNIFICANT_FILE: &str = "deseq2_significant.csv";
pub const PCA_FILE: &str = "pca.tsv";
pub const CLUSTERING_FILE: &str = "sample_clustering.tsv";
pub const ENRICHMENT_RAW_FILE: &str = "enrichment_raw.csv";
pub const ENRICHMENT_FILE: &str = "enrichment_results.csv";

// Per-project output directories
pub const FASTQC_DIR: &str = "fastqc";
pub const FASTQC_TRIMMED_DIR: &str = "fastqc_trimmed";
pub const TRIMMOMATIC_DIR: &str = "trimmomatic";
pub const HISAT2_DIR: &str = "hisat2";
pub const SAMTOOLS_DIR: &str = "samtools";
pub const FEATURECOUNTS_DIR: &str = "featurecounts";
pub const DESEQ2_DIR: &str = "deseq2";

// Static Parameters
pub const LOW_QUALITY_THRESHOLD: f64 = 20.0;
pub const ADAPTER_PRESENCE_THRESHOLD: f64 = 0.01;
pub const ADAPTER_HIGH_THRESHOLD: f64 = 0.1;
pub const EARLY_POSITION_LIMIT: u32 = 5;

pub const TRIM_WINDOW_SIZE: u32 = 4;
pub const TRIM_STRICT_WINDOW_SIZE: u32 = 3;
pub const TRIM_QUALITY: u32 = 20;
pub const TRIM_STRICT_QUALITY: u32 = 25;
pub const TRIM_LEADING: u32 = 3;
pub const TRIM_STRICT_LEADING: u32 = 10;
pub const TRIM_TRAILING: u32 = 3;
pub const TRIM_MIN_LENGTH: u32 = 36;
pub const CLIP_SEED_MISMATCHES: u32 = 2;
pub const CLIP_PALINDROME_STRICT: u32 = 15;
pub const CLIP_PALINDROME_LOOSE: u32 = 30;
pub const CLIP_SIMPLE: u32 = 7;

pub const DE_MIN_ABS_LOG2FC: f64 = 1.0;
pub const DE_MIN_BASE_MEAN: f64 = 10.0;
pub const MISSING_SYMBOL: &str = "Na";

pub const HISAT2_INDEX_SUFFIX: &str = "1.ht2";
pub const FEATURECOUNTS_FIXED_COLUMNS: &[&'static str] = &["Geneid", "Chr", "Start", "End", "Strand", "Length"];


/// Shared, read-only context for one process. Every stage executor gets the
/// same instance so tool paths and reference lookups never drift apart.
pub struct RunConfig {
    pub settings: PipelineSettings,
    pub references: Arc<ReferenceCatalog>,
    pub threads: usize,
}

impl RunConfig {
    /// Directory for a project's outputs, `<media_root>/<session>/<project>/<stage>`.
    pub fn stage_dir(&self, session_id: &str, project_id: u64, stage: &str) -> PathBuf {
        self.settings
            .media_root
            .join(session_id)
            .join(project_id.to_string())
            .join(stage)
    }

    pub fn tool(&self, tag: &str) -> String {
        self.settings.tools.path_for(tag)
    }
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Input file not found: {}", .path.display())]
    MissingInput { path: PathBuf },

    #[error("Malformed QC report {}: {reason}", .path.display())]
    MalformedReport { path: PathBuf, reason: String },

    #[error("Pairing error: {0}")]
    Pairing(String),

    #[error("No common samples between counts ({counts_samples} samples) and metadata ({metadata_samples} samples). Check sample names.")]
    NoSharedSamples { counts_samples: usize, metadata_samples: usize },

    #[error("{}", render_tool_error(.tool, .status, .stderr))]
    ToolExecution { tool: String, status: Option<i32>, stderr: String },

    #[error("Project {project_id} is already running")]
    AlreadyRunning { project_id: u64 },

    #[error("Project {0} not found")]
    ProjectNotFound(u64),

    #[error("Invalid FASTQ format: {0}")]
    InvalidFastqFormat(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{stage} did not produce expected output {}", .path.display())]
    MissingOutput { stage: String, path: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn render_tool_error(tool: &str, status: &Option<i32>, stderr: &str) -> String {
    let diagnostic = stderr.trim();
    if !diagnostic.is_empty() {
        return diagnostic.to_string();
    }
    match status {
        Some(code) => format!("{} exited with status {}", tool, code),
        None => format!("{} was terminated by a signal", tool),
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(e: csv::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

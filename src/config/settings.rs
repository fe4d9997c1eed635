use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::config::defs::{
    PipelineError, DESEQ2_TAG, ENRICHMENT_TAG, FASTQC_TAG, FEATURECOUNTS_TAG, HISAT2_TAG,
    SAMTOOLS_TAG, TRIMMOMATIC_TAG,
};

/// Executable names (or absolute paths) for every external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub fastqc: String,
    pub trimmomatic: String,
    pub hisat2: String,
    pub samtools: String,
    pub featurecounts: String,
    pub deseq2: String,
    pub enrichment: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            fastqc: FASTQC_TAG.to_string(),
            trimmomatic: TRIMMOMATIC_TAG.to_string(),
            hisat2: HISAT2_TAG.to_string(),
            samtools: SAMTOOLS_TAG.to_string(),
            featurecounts: FEATURECOUNTS_TAG.to_string(),
            deseq2: DESEQ2_TAG.to_string(),
            enrichment: ENRICHMENT_TAG.to_string(),
        }
    }
}

impl ToolPaths {
    pub fn path_for(&self, tag: &str) -> String {
        match tag {
            FASTQC_TAG => self.fastqc.clone(),
            TRIMMOMATIC_TAG => self.trimmomatic.clone(),
            HISAT2_TAG => self.hisat2.clone(),
            SAMTOOLS_TAG => self.samtools.clone(),
            FEATURECOUNTS_TAG => self.featurecounts.clone(),
            DESEQ2_TAG => self.deseq2.clone(),
            ENRICHMENT_TAG => self.enrichment.clone(),
            other => other.to_string(),
        }
    }

    /// Tag and executable of every tool a run invokes. The enrichment tool
    /// is only listed when enrichment is switched on.
    pub fn all(&self, enrichment: bool) -> Vec<(&'static str, &str)> {
        let mut tools = vec![
            (FASTQC_TAG, self.fastqc.as_str()),
            (TRIMMOMATIC_TAG, self.trimmomatic.as_str()),
            (HISAT2_TAG, self.hisat2.as_str()),
            (SAMTOOLS_TAG, self.samtools.as_str()),
            (FEATURECOUNTS_TAG, self.featurecounts.as_str()),
            (DESEQ2_TAG, self.deseq2.as_str()),
        ];
        if enrichment {
            tools.push((ENRICHMENT_TAG, self.enrichment.as_str()));
        }
        tools
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Root for per-project output trees.
    pub media_root: PathBuf,
    /// Root that relative paths in the reference catalog resolve against.
    pub references_root: PathBuf,
    /// Optional override for the reference catalog (TOML).
    pub references_file: Option<PathBuf>,
    pub adapters_fasta: Option<PathBuf>,
    pub threads: usize,
    /// Pause after entering `pending`. Zero is fine because events are replayed.
    pub pending_pause_ms: u64,
    pub event_buffer: usize,
    pub enrichment: bool,
    pub tools: ToolPaths,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            media_root: PathBuf::from("media"),
            references_root: PathBuf::from("references"),
            references_file: None,
            adapters_fasta: Some(PathBuf::from("references/adapters.fa")),
            threads: 8,
            pending_pause_ms: 0,
            event_buffer: 256,
            enrichment: false,
            tools: ToolPaths::default(),
        }
    }
}

impl PipelineSettings {
    /// Reads settings from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, PipelineError> {
        toml::from_str(raw).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    pub fn required_tools(&self) -> Vec<(&'static str, &str)> {
        self.tools.all(self.enrichment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = PipelineSettings::from_toml(
            r#"
            media_root = "/data/media"
            threads = 4

            [tools]
            hisat2 = "/opt/hisat2/bin/hisat2"
            "#,
        )
        .unwrap();
        assert_eq!(settings.media_root, PathBuf::from("/data/media"));
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.tools.path_for(HISAT2_TAG), "/opt/hisat2/bin/hisat2");
        assert_eq!(settings.tools.path_for(SAMTOOLS_TAG), "samtools");
        assert_eq!(settings.event_buffer, 256);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = PipelineSettings::from_toml("threads = \"many\"").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_required_tools_follow_enrichment_toggle() {
        let mut settings = PipelineSettings::default();
        let tags: Vec<&str> = settings.required_tools().into_iter().map(|(tag, _)| tag).collect();
        assert_eq!(tags.len(), 6);
        assert!(!tags.contains(&ENRICHMENT_TAG));

        settings.enrichment = true;
        settings.tools.enrichment = "/opt/rsa/run_enrichment".to_string();
        let tools = settings.required_tools();
        assert_eq!(tools.len(), 7);
        assert_eq!(tools.last(), Some(&(ENRICHMENT_TAG, "/opt/rsa/run_enrichment")));
    }
}

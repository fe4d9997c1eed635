use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use log::info;
use crate::config::defs::{
    PipelineError, CLIP_PALINDROME_LOOSE, CLIP_PALINDROME_STRICT, CLIP_SEED_MISMATCHES,
    CLIP_SIMPLE, EARLY_POSITION_LIMIT, TRIMMOMATIC_TAG, TRIM_LEADING, TRIM_MIN_LENGTH,
    TRIM_QUALITY, TRIM_STRICT_LEADING, TRIM_STRICT_QUALITY, TRIM_STRICT_WINDOW_SIZE,
    TRIM_TRAILING, TRIM_WINDOW_SIZE,
};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project};
use crate::utils::command::trimmomatic::{paired_arg_generator, single_arg_generator, PairedOutputs};
use crate::utils::command::run_tool;
use crate::utils::fastqc::{QcSignal, Verdict};
use crate::utils::fastx::{file_stem, group_samples, SampleReads};


/// Trimmomatic steps for one file or pair.
///
/// # Arguments
///
/// * `signal` - QC signal (worst-of both mates for pairs).
/// * `adapters_fasta` - Adapter FASTA for ILLUMINACLIP, if configured and present.
///
/// # Returns
/// The step list, plus a warning when adapters were seen but cannot be clipped.
pub fn trim_steps(signal: &QcSignal, adapters_fasta: Option<&Path>) -> (Vec<String>, Option<String>) {
    let mut steps = Vec::new();
    let mut warning = None;

    if signal.adapter_content != Verdict::Pass && !signal.adapters.is_empty() {
        match adapters_fasta {
            Some(fasta) => {
                let palindrome = if signal.has_high_adapter_content() {
                    CLIP_PALINDROME_STRICT
                } else {
                    CLIP_PALINDROME_LOOSE
                };
                steps.push(format!(
                    "ILLUMINACLIP:{}:{}:{}:{}:1:true",
                    fasta.display(),
                    CLIP_SEED_MISMATCHES,
                    palindrome,
                    CLIP_SIMPLE
                ));
            }
            None => {
                let names: Vec<&str> = signal.adapters.iter().map(|(n, _)| n.as_str()).collect();
                warning = Some(format!(
                    "adapters detected ({}) but no adapter FASTA is available; skipping adapter clipping",
                    names.join(", ")
                ));
            }
        }
    }

    let poor_quality = signal.per_base_quality != Verdict::Pass && !signal.low_quality_positions.is_empty();
    let (leading, window, quality) = if poor_quality {
        let early = signal
            .low_quality_positions
            .iter()
            .any(|r| r.start <= EARLY_POSITION_LIMIT);
        let leading = if early { TRIM_STRICT_LEADING } else { TRIM_LEADING };
        (leading, TRIM_STRICT_WINDOW_SIZE, TRIM_QUALITY.max(TRIM_STRICT_QUALITY))
    } else {
        (TRIM_LEADING, TRIM_WINDOW_SIZE, TRIM_QUALITY)
    };
    steps.push(format!("LEADING:{}", leading));
    steps.push(format!("TRAILING:{}", TRIM_TRAILING));
    steps.push(format!("SLIDINGWINDOW:{}:{}", window, quality));
    steps.push(format!("MINLEN:{}", TRIM_MIN_LENGTH));
    (steps, warning)
}


/// Trimmomatic, run only for samples whose QC signal is not all-pass.
pub struct TrimExecutor {
    signals: HashMap<PathBuf, QcSignal>,
}

impl TrimExecutor {
    pub fn new(signals: HashMap<PathBuf, QcSignal>) -> Self {
        TrimExecutor { signals }
    }

    fn signal_for(&self, path: &Path) -> Result<&QcSignal, PipelineError> {
        self.signals
            .get(path)
            .ok_or_else(|| PipelineError::InvalidInput(format!("No QC signal for {}", path.display())))
    }
}

impl StageExecutor for TrimExecutor {
    const STAGE: &'static str = TRIMMOMATIC_TAG;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError> {
        ensure_inputs_exist(inputs.iter().map(|a| a.path.as_path()))?;
        fs::create_dir_all(output_dir)?;

        let mut output = StageOutput::new(Self::STAGE);
        let program = ctx.config.tool(TRIMMOMATIC_TAG);
        let threads = ctx.config.threads;
        let adapters = ctx
            .config
            .settings
            .adapters_fasta
            .clone()
            .filter(|p| p.exists());

        for sample in group_samples(project.sequencing_type, inputs)? {
            match &sample.reads {
                SampleReads::Single(read) => {
                    let signal = self.signal_for(&read.path)?;
                    if !signal.needs_trimming() {
                        info!("Sample {} passed QC, not trimming", sample.name);
                        continue;
                    }
                    let (steps, warning) = trim_steps(signal, adapters.as_deref());
                    if let Some(w) = warning {
                        output.warn(format!("{}: {}", sample.name, w));
                    }
                    let trimmed = output_dir.join(format!("{}_trimmed.fastq", file_stem(&read.path)));
                    let args = single_arg_generator(&read.path, &trimmed, threads, &steps);
                    run_tool(TRIMMOMATIC_TAG, &program, &args).await?;
                    output.collect(ctx, project, ArtifactKind::TrimmomaticFastq, &trimmed, true)?;
                }
                SampleReads::Paired { forward, reverse } => {
                    let signal = self.signal_for(&forward.path)?.merge(self.signal_for(&reverse.path)?);
                    if !signal.needs_trimming() {
                        info!("Sample {} passed QC, not trimming", sample.name);
                        continue;
                    }
                    let (steps, warning) = trim_steps(&signal, adapters.as_deref());
                    if let Some(w) = warning {
                        output.warn(format!("{}: {}", sample.name, w));
                    }
                    let outputs = PairedOutputs {
                        forward_paired: output_dir.join(format!("{}_R1_trimmed.fastq", sample.name)),
                        forward_unpaired: output_dir.join(format!("{}_R1_unpaired.fastq", sample.name)),
                        reverse_paired: output_dir.join(format!("{}_R2_trimmed.fastq", sample.name)),
                        reverse_unpaired: output_dir.join(format!("{}_R2_unpaired.fastq", sample.name)),
                    };
                    let args = paired_arg_generator(&forward.path, &reverse.path, &outputs, threads, &steps);
                    run_tool(TRIMMOMATIC_TAG, &program, &args).await?;

                    output.collect(ctx, project, ArtifactKind::TrimmomaticFastqPaired, &outputs.forward_paired, true)?;
                    output.collect(ctx, project, ArtifactKind::TrimmomaticFastqPaired, &outputs.reverse_paired, true)?;
                    output.collect(ctx, project, ArtifactKind::TrimmomaticFastqUnpaired, &outputs.forward_unpaired, false)?;
                    output.collect(ctx, project, ArtifactKind::TrimmomaticFastqUnpaired, &outputs.reverse_unpaired, false)?;
                }
            }
        }
        Ok(output)
    }
}

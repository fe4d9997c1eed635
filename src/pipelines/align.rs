use std::fs;
use std::path::{Path, PathBuf};
use log::info;
use crate::config::defs::{PipelineError, SamtoolsSubcommand, HISAT2_INDEX_SUFFIX, HISAT2_TAG, SAMTOOLS_TAG};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project};
use crate::utils::command::hisat2::{self, Hisat2Reads};
use crate::utils::command::samtools::{self, SamtoolsConfig};
use crate::utils::command::{pipe_tools, PipeStage};
use crate::utils::fastx::{group_samples, SampleReads};


/// `<prefix>.1.ht2`, the file whose presence marks a built index.
pub fn index_first_file(prefix: &Path) -> PathBuf {
    let mut first = prefix.as_os_str().to_owned();
    first.push(".");
    first.push(HISAT2_INDEX_SUFFIX);
    PathBuf::from(first)
}


/// HISAT2 piped straight into `samtools view -b`, one BAM per sample.
pub struct AlignExecutor;

impl StageExecutor for AlignExecutor {
    const STAGE: &'static str = HISAT2_TAG;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError> {
        ensure_inputs_exist(inputs.iter().map(|a| a.path.as_path()))?;
        let index = ctx.config.references.hisat2_index(&project.species)?;
        let first = index_first_file(&index);
        if !first.exists() {
            return Err(PipelineError::MissingInput { path: first });
        }
        fs::create_dir_all(output_dir)?;

        let mut output = StageOutput::new(Self::STAGE);
        let hisat2_program = ctx.config.tool(HISAT2_TAG);
        let samtools_program = ctx.config.tool(SAMTOOLS_TAG);

        for sample in group_samples(project.sequencing_type, inputs)? {
            let reads = match &sample.reads {
                SampleReads::Single(read) => Hisat2Reads::Unpaired(&read.path),
                SampleReads::Paired { forward, reverse } => Hisat2Reads::Paired(&forward.path, &reverse.path),
            };
            let bam = output_dir.join(format!("{}.bam", sample.name));
            let view_config = SamtoolsConfig {
                subcommand: SamtoolsSubcommand::View,
                subcommand_fields: vec![
                    ("-b".to_string(), None),
                    ("-o".to_string(), Some(bam.to_string_lossy().to_string())),
                    ("-".to_string(), None),
                ],
            };
            let upstream = PipeStage {
                tag: HISAT2_TAG,
                program: &hisat2_program,
                args: hisat2::arg_generator(&index, &reads, ctx.config.threads),
            };
            let downstream = PipeStage {
                tag: SAMTOOLS_TAG,
                program: &samtools_program,
                args: samtools::arg_generator(&view_config, ctx.config.threads),
            };

            info!("Aligning sample {} against {}", sample.name, index.display());
            let (summary, _) = pipe_tools(&upstream, &downstream).await?;

            output.collect(ctx, project, ArtifactKind::Hisat2Bam, &bam, true)?;
            if summary.trim().is_empty() {
                output.warn(format!("HISAT2 printed no alignment summary for {}", sample.name));
            } else {
                let log_path = output_dir.join(format!("{}.hisat2.log", sample.name));
                fs::write(&log_path, summary)?;
                output.collect(ctx, project, ArtifactKind::Hisat2Summary, &log_path, false)?;
            }
        }
        Ok(output)
    }
}

use std::fs;
use std::path::Path;
use log::info;
use crate::config::defs::{PipelineError, FASTQC_TAG};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project};
use crate::utils::command::{fastqc, run_tool};
use crate::utils::fastqc::report_path;
use crate::utils::fastx::validate_fastq;
use crate::utils::file::strip_known_extensions;

/// FastQC over every input file. The same executor serves the post-trim pass,
/// which only differs in the artifact kinds it registers.
pub struct QcExecutor {
    pub output_kind: ArtifactKind,
    pub data_kind: ArtifactKind,
    pub validate_inputs: bool,
}

impl QcExecutor {
    pub fn initial() -> Self {
        QcExecutor {
            output_kind: ArtifactKind::FastqcOutput,
            data_kind: ArtifactKind::FastqcData,
            validate_inputs: true,
        }
    }

    pub fn post_trim() -> Self {
        QcExecutor {
            output_kind: ArtifactKind::FastqcTrimmedOutput,
            data_kind: ArtifactKind::FastqcTrimmedData,
            validate_inputs: false,
        }
    }
}

impl StageExecutor for QcExecutor {
    const STAGE: &'static str = FASTQC_TAG;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError> {
        ensure_inputs_exist(inputs.iter().map(|a| a.path.as_path()))?;
        if self.validate_inputs {
            for input in inputs {
                validate_fastq(&input.path)?;
            }
        }
        fs::create_dir_all(output_dir)?;

        let mut output = StageOutput::new(Self::STAGE);
        let program = ctx.config.tool(FASTQC_TAG);
        for input in inputs {
            info!("Running FastQC on {}", input.path.display());
            let args = fastqc::arg_generator(&input.path, output_dir, ctx.config.threads);
            run_tool(FASTQC_TAG, &program, &args).await?;

            let base = strip_known_extensions(&input.path);
            for ext in ["html", "zip"] {
                let path = output_dir.join(format!("{}_fastqc.{}", base, ext));
                output.collect(ctx, project, self.output_kind, &path, false)?;
            }
            // Routing re-reads this report, so its absence surfaces there.
            output.collect(ctx, project, self.data_kind, &report_path(output_dir, &input.path), false)?;
        }
        Ok(output)
    }
}

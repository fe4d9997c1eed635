use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info};
use crate::config::defs::{PipelineError, SamtoolsSubcommand, SAMTOOLS_TAG};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project};
use crate::utils::command::samtools::{arg_generator, SamtoolsConfig};
use crate::utils::command::run_tool;
use crate::utils::file::strip_known_extensions;


pub fn sorted_path(output_dir: &Path, bam: &Path) -> PathBuf {
    output_dir.join(format!("{}.sorted.bam", strip_known_extensions(bam)))
}


/// `samtools sort` then `samtools index`. Both outputs are part of the
/// contract; the unsorted BAM is removed once they exist.
pub struct SortIndexExecutor;

impl StageExecutor for SortIndexExecutor {
    const STAGE: &'static str = SAMTOOLS_TAG;

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
        let program = ctx.config.tool(SAMTOOLS_TAG);

        for input in inputs {
            let sorted = sorted_path(output_dir, &input.path);
            let mut index = sorted.as_os_str().to_owned();
            index.push(".bai");
            let index = PathBuf::from(index);

            let sort_config = SamtoolsConfig {
                subcommand: SamtoolsSubcommand::Sort,
                subcommand_fields: vec![
                    ("-o".to_string(), Some(sorted.to_string_lossy().to_string())),
                    (input.path.to_string_lossy().to_string(), None),
                ],
            };
            info!("Sorting {}", input.path.display());
            run_tool(SAMTOOLS_TAG, &program, &arg_generator(&sort_config, ctx.config.threads)).await?;
            if !sorted.exists() {
                return Err(PipelineError::MissingOutput { stage: "samtools sort".to_string(), path: sorted });
            }

            let index_config = SamtoolsConfig {
                subcommand: SamtoolsSubcommand::Index,
                subcommand_fields: vec![(sorted.to_string_lossy().to_string(), None)],
            };
            run_tool(SAMTOOLS_TAG, &program, &arg_generator(&index_config, ctx.config.threads)).await?;
            if !index.exists() {
                return Err(PipelineError::MissingOutput { stage: "samtools index".to_string(), path: index });
            }

            output.collect(ctx, project, ArtifactKind::SamtoolsBam, &sorted, true)?;
            output.collect(ctx, project, ArtifactKind::SamtoolsBai, &index, true)?;

            if input.path != sorted {
                match fs::remove_file(&input.path) {
                    Ok(()) => debug!("Removed unsorted BAM {}", input.path.display()),
                    Err(e) => output.warn(format!("could not remove unsorted BAM {}: {}", input.path.display(), e)),
                }
            }
        }
        Ok(output)
    }
}

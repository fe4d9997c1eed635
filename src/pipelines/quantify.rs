use std::fs;
use std::path::{Path, PathBuf};
use log::info;
use crate::config::defs::{
    PipelineError, COUNTS_FILE, FEATURECOUNTS_FIXED_COLUMNS, FEATURECOUNTS_RAW_FILE, FEATURECOUNTS_TAG,
};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project, SequencingLayout};
use crate::utils::command::featurecounts::{arg_generator, FeatureCountsConfig};
use crate::utils::command::run_tool;
use crate::utils::fastx::sample_name;


/// Rewrites featureCounts output into a plain TSV: the leading `#` command
/// line is dropped and BAM path columns become sample names.
///
/// # Arguments
///
/// * `raw` - featureCounts main output.
/// * `layout` - Used to derive sample names from the BAM paths.
///
/// # Returns
/// The rewritten table, or `InvalidInput` when the header is not recognisable.
pub fn rewrite_counts_header(raw: &str, layout: SequencingLayout) -> Result<String, PipelineError> {
    let mut lines = raw.lines().skip_while(|l| l.starts_with('#'));
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::InvalidInput("featureCounts output has no header".to_string()))?;
    let cols: Vec<&str> = header.split('\t').collect();
    let fixed = FEATURECOUNTS_FIXED_COLUMNS.len();
    if cols.len() <= fixed || cols[..fixed] != *FEATURECOUNTS_FIXED_COLUMNS {
        return Err(PipelineError::InvalidInput(format!(
            "unexpected featureCounts header: {}",
            header
        )));
    }

    let mut new_header: Vec<String> = cols[..fixed].iter().map(|c| c.to_string()).collect();
    new_header.extend(cols[fixed..].iter().map(|c| sample_name(Path::new(c.trim()), layout)));

    let mut out = new_header.join("\t");
    out.push('\n');
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}


/// featureCounts once over every sorted BAM of the project.
pub struct QuantifyExecutor;

impl StageExecutor for QuantifyExecutor {
    const STAGE: &'static str = FEATURECOUNTS_TAG;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError> {
        if inputs.is_empty() {
            return Err(PipelineError::InvalidInput("no alignments to quantify".to_string()));
        }
        ensure_inputs_exist(inputs.iter().map(|a| a.path.as_path()))?;
        let reference = ctx.config.references.get(&project.species)?;
        let annotation = ctx.config.references.annotation(&project.species)?;
        ensure_inputs_exist([annotation.as_path()])?;
        fs::create_dir_all(output_dir)?;

        let raw_path = output_dir.join(FEATURECOUNTS_RAW_FILE);
        let bams: Vec<PathBuf> = inputs.iter().map(|a| a.path.clone()).collect();
        let config = FeatureCountsConfig {
            annotation: &annotation,
            feature_type: &reference.feature_type,
            id_attribute: &reference.id_attribute,
            output: &raw_path,
            paired: project.sequencing_type == SequencingLayout::Paired,
            bams: &bams,
        };
        info!("Counting features for {} alignments", bams.len());
        run_tool(FEATURECOUNTS_TAG, &ctx.config.tool(FEATURECOUNTS_TAG), &arg_generator(&config, ctx.config.threads)).await?;

        let mut output = StageOutput::new(Self::STAGE);
        if !raw_path.exists() {
            output.warn(format!("featureCounts wrote no table at {}", raw_path.display()));
            output.result.missing_required.push(output_dir.join(COUNTS_FILE));
            return Ok(output);
        }
        let raw = fs::read_to_string(&raw_path)?;
        let counts_path = output_dir.join(COUNTS_FILE);
        fs::write(&counts_path, rewrite_counts_header(&raw, project.sequencing_type)?)?;

        output.collect(ctx, project, ArtifactKind::FeaturecountsCounts, &counts_path, true)?;
        let mut summary = raw_path.as_os_str().to_owned();
        summary.push(".summary");
        output.collect(ctx, project, ArtifactKind::FeaturecountsSummary, Path::new(&summary), false)?;
        Ok(output)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_header_uses_sample_names() {
        let raw = "# Program:featureCounts v2.0.6; Command:\"featureCounts\" \"-T\" \"4\"\n\
                   Geneid\tChr\tStart\tEnd\tStrand\tLength\t/m/s/1/samtools/ctrl1.sorted.bam\t/m/s/1/samtools/heat1.sorted.bam\n\
                   YAL068C\tI\t1807\t2169\t-\t363\t12\t0\n";
        let rewritten = rewrite_counts_header(raw, SequencingLayout::Single).unwrap();
        let mut lines = rewritten.lines();
        assert_eq!(lines.next(), Some("Geneid\tChr\tStart\tEnd\tStrand\tLength\tctrl1\theat1"));
        assert_eq!(lines.next(), Some("YAL068C\tI\t1807\t2169\t-\t363\t12\t0"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_rewrite_rejects_foreign_table() {
        let err = rewrite_counts_header("gene\tcount\nA\t1\n", SequencingLayout::Single).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}

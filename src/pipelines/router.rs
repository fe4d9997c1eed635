use std::collections::BTreeMap;
use std::path::Path;
use crate::config::defs::PipelineError;
use crate::store::{Artifact, ArtifactFilter, ArtifactKind, ArtifactRegistry, SequencingLayout};
use crate::utils::fastqc::{parse_qc_report, report_path, QcSignal};
use crate::utils::fastx::{artifact_sample_name, group_samples, Sample};


/// True iff any monitored module is `warn` or `fail` for any input.
pub fn decide_trim_needed(signals: &[QcSignal]) -> bool {
    signals.iter().any(|s| s.needs_trimming())
}


/// Reads the QC report registered for each input.
///
/// # Arguments
///
/// * `registry` - Artifact registry for the project.
/// * `project_id` - Owning project.
/// * `inputs` - Files that went through QC.
/// * `qc_dir` - Directory the QC stage wrote to.
///
/// # Returns
/// One signal per input, in input order. A report that was never registered
/// or has since vanished is `MissingInput`.
pub fn load_qc_signals(
    registry: &dyn ArtifactRegistry,
    project_id: u64,
    inputs: &[Artifact],
    qc_dir: &Path,
) -> Result<Vec<QcSignal>, PipelineError> {
    let mut signals = Vec::with_capacity(inputs.len());
    for input in inputs {
        let expected = report_path(qc_dir, &input.path);
        let filter = ArtifactFilter {
            kinds: Some(vec![ArtifactKind::FastqcData, ArtifactKind::FastqcTrimmedData]),
            paths: Some(vec![expected.clone()]),
            format: None,
        };
        let registered = registry.query(project_id, &filter)?;
        if registered.is_empty() || !expected.exists() {
            return Err(PipelineError::MissingInput { path: expected });
        }
        signals.push(parse_qc_report(&expected)?);
    }
    Ok(signals)
}


/// Picks the reads each sample is aligned from: the trimmed output when
/// trimming produced it, the original input otherwise.
///
/// # Arguments
///
/// * `layout` - Project sequencing layout.
/// * `trimmed` - Trimmed reads (`trimmomatic_fastq` / `trimmomatic_fastq_paired`).
/// * `originals` - Registered input reads.
///
/// # Returns
/// Exactly one sample per original sample, sorted by name.
pub fn select_alignment_inputs(
    layout: SequencingLayout,
    trimmed: &[Artifact],
    originals: &[Artifact],
) -> Result<Vec<Sample>, PipelineError> {
    let original_samples = group_samples(layout, originals)?;

    let mut trimmed_by_sample: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
    for artifact in trimmed {
        trimmed_by_sample
            .entry(artifact_sample_name(artifact, layout))
            .or_default()
            .push(artifact.clone());
    }

    let mut selected = Vec::with_capacity(original_samples.len());
    for sample in original_samples {
        match trimmed_by_sample.remove(&sample.name) {
            None => selected.push(sample),
            Some(files) => {
                let mut grouped = group_samples(layout, &files).map_err(|_| {
                    PipelineError::Pairing(format!(
                        "Sample {} has an incomplete set of trimmed reads ({} files)",
                        sample.name,
                        files.len()
                    ))
                })?;
                if grouped.len() != 1 {
                    return Err(PipelineError::Pairing(format!(
                        "Sample {} resolves to {} trimmed samples",
                        sample.name,
                        grouped.len()
                    )));
                }
                let mut resolved = grouped.remove(0);
                resolved.name = sample.name;
                selected.push(resolved);
            }
        }
    }
    Ok(selected)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use chrono::Utc;
    use crate::utils::fastqc::Verdict;
    use crate::utils::fastx::SampleReads;

    fn artifact(id: u64, kind: ArtifactKind, path: &str) -> Artifact {
        Artifact {
            id,
            project_id: 1,
            kind,
            path: PathBuf::from(path),
            is_directory: false,
            file_format: "fastq".to_string(),
            size: None,
            created_at: Utc::now(),
        }
    }

    fn signal(quality: Verdict, adapter: Verdict) -> QcSignal {
        QcSignal {
            per_base_quality: quality,
            low_quality_positions: vec![],
            adapter_content: adapter,
            adapters: vec![],
        }
    }

    #[test]
    fn test_all_pass_skips_trimming() {
        let signals = vec![signal(Verdict::Pass, Verdict::Pass), signal(Verdict::Pass, Verdict::Pass)];
        assert!(!decide_trim_needed(&signals));
        assert!(!decide_trim_needed(&[]));
    }

    #[test]
    fn test_any_warn_or_fail_trims() {
        let signals = vec![signal(Verdict::Pass, Verdict::Pass), signal(Verdict::Pass, Verdict::Warn)];
        assert!(decide_trim_needed(&signals));
        let signals = vec![signal(Verdict::Fail, Verdict::Pass)];
        assert!(decide_trim_needed(&signals));
    }

    #[test]
    fn test_select_prefers_trimmed_pairs() {
        let originals = vec![
            artifact(1, ArtifactKind::InputFastq, "/in/a_R1.fastq.gz"),
            artifact(2, ArtifactKind::InputFastq, "/in/a_R2.fastq.gz"),
            artifact(3, ArtifactKind::InputFastq, "/in/b_R1.fastq.gz"),
            artifact(4, ArtifactKind::InputFastq, "/in/b_R2.fastq.gz"),
        ];
        let trimmed = vec![
            artifact(5, ArtifactKind::TrimmomaticFastqPaired, "/t/b_R1_trimmed.fastq"),
            artifact(6, ArtifactKind::TrimmomaticFastqPaired, "/t/b_R2_trimmed.fastq"),
        ];
        let selected = select_alignment_inputs(SequencingLayout::Paired, &trimmed, &originals).unwrap();
        assert_eq!(selected.len(), 2);
        match (&selected[0].reads, &selected[1].reads) {
            (
                SampleReads::Paired { forward: a_fwd, .. },
                SampleReads::Paired { forward: b_fwd, reverse: b_rev },
            ) => {
                assert_eq!(a_fwd.id, 1);
                assert_eq!((b_fwd.id, b_rev.id), (5, 6));
            }
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_trimmed_pair_is_fatal() {
        let originals = vec![
            artifact(1, ArtifactKind::InputFastq, "/in/a_R1.fastq"),
            artifact(2, ArtifactKind::InputFastq, "/in/a_R2.fastq"),
        ];
        let trimmed = vec![artifact(3, ArtifactKind::TrimmomaticFastqPaired, "/t/a_R1_trimmed.fastq")];
        let err = select_alignment_inputs(SequencingLayout::Paired, &trimmed, &originals).unwrap_err();
        assert!(matches!(err, PipelineError::Pairing(_)));
    }

    #[test]
    fn test_single_layout_fallback() {
        let originals = vec![
            artifact(1, ArtifactKind::InputFastq, "/in/ctrl.fastq"),
            artifact(2, ArtifactKind::InputFastq, "/in/heat.fastq"),
        ];
        let trimmed = vec![artifact(3, ArtifactKind::TrimmomaticFastq, "/t/heat_trimmed.fastq")];
        let selected = select_alignment_inputs(SequencingLayout::Single, &trimmed, &originals).unwrap();
        let ids: Vec<u64> = selected.iter().flat_map(|s| s.artifacts()).map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_missing_report_is_missing_input() {
        let store = crate::store::MemoryStore::new();
        let inputs = vec![artifact(1, ArtifactKind::InputFastq, "/in/ctrl.fastq")];
        let err = load_qc_signals(&store, 1, &inputs, Path::new("/qc")).unwrap_err();
        match err {
            PipelineError::MissingInput { path } => {
                assert_eq!(path, PathBuf::from("/qc/ctrl_fastqc/fastqc_data.txt"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

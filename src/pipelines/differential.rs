use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use log::info;
use ndarray::Array2;
use crate::config::defs::{
    PipelineError, CLUSTERING_FILE, DESEQ2_TAG, DESEQ_COUNTS_FILE, DESEQ_METADATA_FILE,
    DESEQ_RAW_FILE, DESEQ_RESULTS_FILE, DESEQ_SIGNIFICANT_FILE, DE_MIN_ABS_LOG2FC,
    DE_MIN_BASE_MEAN, FEATURECOUNTS_FIXED_COLUMNS, MISSING_SYMBOL, PCA_FILE,
};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project};
use crate::utils::command::deseq2::{arg_generator, Deseq2Config};
use crate::utils::command::run_tool;
use crate::utils::gtf::gene_symbols;
use crate::utils::stats::{average_linkage, euclidean_distances, log2_cpm, pca};


/// Gene x sample count matrix.
#[derive(Debug, Clone)]
pub struct CountsTable {
    pub genes: Vec<String>,
    pub samples: Vec<String>,
    pub counts: Array2<f64>,
}

impl CountsTable {
    /// Keeps only `samples` (in that order) and drops genes with zero total count.
    pub fn subset(&self, samples: &[String]) -> CountsTable {
        let columns: Vec<usize> = samples
            .iter()
            .filter_map(|s| self.samples.iter().position(|c| c == s))
            .collect();
        let kept: Vec<usize> = (0..self.genes.len())
            .filter(|&g| columns.iter().map(|&c| self.counts[[g, c]]).sum::<f64>() > 0.0)
            .collect();
        let mut counts = Array2::zeros((kept.len(), columns.len()));
        for (i, &g) in kept.iter().enumerate() {
            for (j, &c) in columns.iter().enumerate() {
                counts[[i, j]] = self.counts[[g, c]];
            }
        }
        CountsTable {
            genes: kept.iter().map(|&g| self.genes[g].clone()).collect(),
            samples: columns.iter().map(|&c| self.samples[c].clone()).collect(),
            counts,
        }
    }
}


fn tsv_reader(path: &Path) -> Result<csv::Reader<File>, PipelineError> {
    let file = File::open(path).map_err(|_| PipelineError::MissingInput { path: path.to_path_buf() })?;
    Ok(csv::ReaderBuilder::new().delimiter(b'\t').from_reader(file))
}


/// Reads the rewritten featureCounts table, ignoring its coordinate columns.
pub fn read_counts(path: &Path) -> Result<CountsTable, PipelineError> {
    let mut reader = tsv_reader(path)?;
    let headers = reader.headers()?.clone();
    let sample_cols: Vec<usize> = (1..headers.len())
        .filter(|&i| !FEATURECOUNTS_FIXED_COLUMNS.contains(&headers[i].trim()))
        .collect();
    let samples: Vec<String> = sample_cols.iter().map(|&i| headers[i].trim().to_string()).collect();

    let mut genes = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        genes.push(record.get(0).unwrap_or("").to_string());
        for &i in &sample_cols {
            let raw = record.get(i).unwrap_or("");
            let v: f64 = raw.trim().parse().map_err(|_| {
                PipelineError::InvalidInput(format!("non-numeric count '{}' in {}", raw, path.display()))
            })?;
            values.push(v);
        }
    }
    let counts = Array2::from_shape_vec((genes.len(), samples.len()), values)
        .map_err(|e| PipelineError::InvalidInput(format!("{}: {}", path.display(), e)))?;
    Ok(CountsTable { genes, samples, counts })
}


/// (sample, condition) rows in file order. Comma or tab separated; the first
/// column is the sample, the condition is the `condition` column or the second one.
pub fn read_metadata(path: &Path) -> Result<Vec<(String, String)>, PipelineError> {
    let raw = fs::read_to_string(path).map_err(|_| PipelineError::MissingInput { path: path.to_path_buf() })?;
    let first_line = raw.lines().next().unwrap_or("");
    let delimiter = if first_line.contains('\t') { b'\t' } else { b',' };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(PipelineError::InvalidInput(format!(
            "metadata {} needs a sample column and a condition column",
            path.display()
        )));
    }
    let condition_col = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("condition"))
        .unwrap_or(1);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let sample = record.get(0).unwrap_or("");
        if sample.is_empty() {
            continue;
        }
        let condition = record.get(condition_col).unwrap_or("");
        rows.push((sample.to_string(), condition.to_string()));
    }
    Ok(rows)
}


/// Samples and contrast handed to the DE tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Design {
    pub samples: Vec<(String, String)>,
    pub reference: String,
    pub treatment: String,
}


/// Joins counts and metadata on sample name.
///
/// # Returns
/// `NoSharedSamples` when nothing overlaps, `InvalidInput` when fewer than two
/// conditions remain. The first two conditions in metadata order are the contrast.
pub fn build_design(counts: &CountsTable, metadata: &[(String, String)]) -> Result<Design, PipelineError> {
    let available: HashSet<&str> = counts.samples.iter().map(|s| s.as_str()).collect();
    let samples: Vec<(String, String)> = metadata
        .iter()
        .filter(|(s, _)| available.contains(s.as_str()))
        .cloned()
        .collect();
    if samples.is_empty() {
        return Err(PipelineError::NoSharedSamples {
            counts_samples: counts.samples.len(),
            metadata_samples: metadata.len(),
        });
    }

    let mut conditions: Vec<&str> = Vec::new();
    for (_, condition) in &samples {
        if !conditions.contains(&condition.as_str()) {
            conditions.push(condition);
        }
    }
    if conditions.len() < 2 {
        return Err(PipelineError::InvalidInput(format!(
            "At least two conditions are required for differential expression, found {}",
            conditions.len()
        )));
    }
    Ok(Design {
        reference: conditions[0].to_string(),
        treatment: conditions[1].to_string(),
        samples,
    })
}


fn write_design_inputs(table: &CountsTable, design: &Design, counts_path: &Path, metadata_path: &Path) -> Result<(), PipelineError> {
    let mut out = BufWriter::new(File::create(counts_path)?);
    writeln!(out, "gene_id\t{}", table.samples.join("\t"))?;
    for (i, gene) in table.genes.iter().enumerate() {
        let row: Vec<String> = table.counts.row(i).iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}\t{}", gene, row.join("\t"))?;
    }
    out.flush()?;

    let mut out = BufWriter::new(File::create(metadata_path)?);
    writeln!(out, "sample\tcondition")?;
    for (sample, condition) in &design.samples {
        writeln!(out, "{}\t{}", sample, condition)?;
    }
    out.flush()?;
    Ok(())
}


/// Counts of rows written by `annotate_results`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultSummary {
    pub genes: usize,
    pub significant: usize,
}


fn parse_stat(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|v| v.trim().parse::<f64>().ok()).filter(|v| v.is_finite())
}


/// Adds `gene_symbol` after the id column and writes the full and the
/// significant result tables as CSV.
///
/// # Arguments
///
/// * `raw_path` - DE tool output (TSV with `baseMean`, `log2FoldChange`, `padj`).
/// * `symbols` - Gene id -> symbol; absent ids become `Na`.
/// * `pvalue_cutoff` - Project cutoff on `padj`.
pub fn annotate_results(
    raw_path: &Path,
    symbols: &HashMap<String, String>,
    pvalue_cutoff: f64,
    results_path: &Path,
    significant_path: &Path,
) -> Result<ResultSummary, PipelineError> {
    let mut reader = tsv_reader(raw_path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PipelineError::InvalidInput(format!("{} has no {} column", raw_path.display(), name)))
    };
    let base_mean_col = column("baseMean")?;
    let lfc_col = column("log2FoldChange")?;
    let padj_col = column("padj")?;

    let mut out_header = vec!["gene_id".to_string(), "gene_symbol".to_string()];
    out_header.extend(headers.iter().skip(1).map(|h| h.to_string()));

    let mut all = csv::Writer::from_path(results_path)?;
    let mut significant = csv::Writer::from_path(significant_path)?;
    all.write_record(&out_header)?;
    significant.write_record(&out_header)?;

    let mut summary = ResultSummary { genes: 0, significant: 0 };
    for record in reader.records() {
        let record = record?;
        let gene = record.get(0).unwrap_or("");
        let symbol = symbols.get(gene).map(|s| s.as_str()).unwrap_or(MISSING_SYMBOL);
        let mut row = vec![gene, symbol];
        row.extend(record.iter().skip(1));
        all.write_record(&row)?;
        summary.genes += 1;

        let hit = match (
            parse_stat(record.get(padj_col)),
            parse_stat(record.get(lfc_col)),
            parse_stat(record.get(base_mean_col)),
        ) {
            (Some(padj), Some(lfc), Some(base_mean)) => {
                padj < pvalue_cutoff && lfc.abs() >= DE_MIN_ABS_LOG2FC && base_mean >= DE_MIN_BASE_MEAN
            }
            _ => false,
        };
        if hit {
            significant.write_record(&row)?;
            summary.significant += 1;
        }
    }
    all.flush()?;
    significant.flush()?;
    Ok(summary)
}


/// PCA scores and average-linkage merges over log2 CPM of the design samples.
pub fn write_exploratory(table: &CountsTable, design: &Design, pca_path: &Path, clustering_path: &Path) -> Result<(), PipelineError> {
    let per_sample = log2_cpm(&table.counts).t().to_owned();
    let result = pca(&per_sample);
    let conditions: HashMap<&str, &str> = design
        .samples
        .iter()
        .map(|(s, c)| (s.as_str(), c.as_str()))
        .collect();

    let mut out = BufWriter::new(File::create(pca_path)?);
    writeln!(out, "# variance_explained\t{:.6}\t{:.6}", result.explained[0], result.explained[1])?;
    writeln!(out, "sample\tcondition\tPC1\tPC2")?;
    for (i, sample) in table.samples.iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{:.6}\t{:.6}",
            sample,
            conditions.get(sample.as_str()).copied().unwrap_or(""),
            result.scores[[i, 0]],
            result.scores[[i, 1]]
        )?;
    }
    out.flush()?;

    let n = table.samples.len();
    let label = |id: usize| {
        if id < n {
            table.samples[id].clone()
        } else {
            format!("cluster{}", id)
        }
    };
    let mut out = BufWriter::new(File::create(clustering_path)?);
    writeln!(out, "step\tleft\tright\tdistance\tsize")?;
    for (step, merge) in average_linkage(&euclidean_distances(&per_sample)).iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}\t{:.6}\t{}",
            step + 1,
            label(merge.left),
            label(merge.right),
            merge.distance,
            merge.size
        )?;
    }
    out.flush()?;
    Ok(())
}


fn latest_of(inputs: &[Artifact], kind: ArtifactKind) -> Result<&Artifact, PipelineError> {
    inputs
        .iter()
        .rev()
        .find(|a| a.kind == kind)
        .ok_or_else(|| PipelineError::InvalidInput(format!("no {} artifact available", kind)))
}


/// Counts + metadata join, external DE run, annotation and filtering.
pub struct DifferentialExecutor;

impl StageExecutor for DifferentialExecutor {
    const STAGE: &'static str = DESEQ2_TAG;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError> {
        let counts_artifact = latest_of(inputs, ArtifactKind::FeaturecountsCounts)?;
        let metadata_artifact = latest_of(inputs, ArtifactKind::DeseqMetadata)?;
        let reference = ctx.config.references.get(&project.species)?;
        let annotation = ctx.config.references.resolve(&reference.annotation);
        ensure_inputs_exist([
            counts_artifact.path.as_path(),
            metadata_artifact.path.as_path(),
            annotation.as_path(),
        ])?;
        fs::create_dir_all(output_dir)?;
        let symbols = gene_symbols(&annotation, reference.annotation_format, &reference.id_attribute)?;

        let counts = read_counts(&counts_artifact.path)?;
        let metadata = read_metadata(&metadata_artifact.path)?;
        let design = build_design(&counts, &metadata)?;
        let sample_names: Vec<String> = design.samples.iter().map(|(s, _)| s.clone()).collect();
        let table = counts.subset(&sample_names);
        info!(
            "DE contrast {} vs {} over {} samples, {} expressed genes",
            design.treatment,
            design.reference,
            table.samples.len(),
            table.genes.len()
        );

        let mut output = StageOutput::new(Self::STAGE);
        if table.samples.len() < counts.samples.len() {
            output.warn(format!(
                "{} counted samples have no metadata row and were left out",
                counts.samples.len() - table.samples.len()
            ));
        }

        let counts_path = output_dir.join(DESEQ_COUNTS_FILE);
        let metadata_path = output_dir.join(DESEQ_METADATA_FILE);
        write_design_inputs(&table, &design, &counts_path, &metadata_path)?;

        let raw_path = output_dir.join(DESEQ_RAW_FILE);
        let config = Deseq2Config {
            counts: &counts_path,
            metadata: &metadata_path,
            reference: &design.reference,
            treatment: &design.treatment,
            output: &raw_path,
        };
        run_tool(DESEQ2_TAG, &ctx.config.tool(DESEQ2_TAG), &arg_generator(&config, ctx.config.threads)).await?;
        if !raw_path.exists() {
            return Err(PipelineError::MissingOutput { stage: DESEQ2_TAG.to_string(), path: raw_path });
        }

        let results_path = output_dir.join(DESEQ_RESULTS_FILE);
        let significant_path = output_dir.join(DESEQ_SIGNIFICANT_FILE);
        let summary = annotate_results(&raw_path, &symbols, project.pvalue_cutoff, &results_path, &significant_path)?;
        info!("{} of {} genes pass the significance filters", summary.significant, summary.genes);

        output.collect(ctx, project, ArtifactKind::DeseqOutput, &results_path, true)?;
        output.collect(ctx, project, ArtifactKind::DeseqSignificant, &significant_path, false)?;

        let pca_path = output_dir.join(PCA_FILE);
        let clustering_path = output_dir.join(CLUSTERING_FILE);
        match write_exploratory(&table, &design, &pca_path, &clustering_path) {
            Ok(()) => {
                output.collect(ctx, project, ArtifactKind::DeseqPca, &pca_path, false)?;
                output.collect(ctx, project, ArtifactKind::DeseqClustering, &clustering_path, false)?;
            }
            Err(e) => output.warn(format!("exploratory plots skipped: {}", e)),
        }
        Ok(output)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn table() -> CountsTable {
        CountsTable {
            genes: vec!["g1".into(), "g2".into(), "g3".into()],
            samples: vec!["ctrl1".into(), "ctrl2".into(), "heat1".into()],
            counts: array![[10.0, 12.0, 40.0], [0.0, 0.0, 0.0], [0.0, 0.0, 5.0]],
        }
    }

    #[test]
    fn test_read_counts_skips_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.tsv");
        fs::write(
            &path,
            "Geneid\tChr\tStart\tEnd\tStrand\tLength\tctrl1\theat1\ng1\tI\t1\t9\t+\t9\t3\t7\ng2\tI\t20\t29\t-\t10\t0\t1\n",
        )
        .unwrap();
        let table = read_counts(&path).unwrap();
        assert_eq!(table.samples, vec!["ctrl1", "heat1"]);
        assert_eq!(table.genes, vec!["g1", "g2"]);
        assert_eq!(table.counts, array![[3.0, 7.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_read_metadata_condition_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.csv");
        fs::write(&path, "sample,batch,Condition\nctrl1,a,control\n heat1 ,b,heat\n").unwrap();
        let rows = read_metadata(&path).unwrap();
        assert_eq!(
            rows,
            vec![("ctrl1".to_string(), "control".to_string()), ("heat1".to_string(), "heat".to_string())]
        );
    }

    #[test]
    fn test_no_shared_samples() {
        let metadata = vec![("other1".to_string(), "a".to_string()), ("other2".to_string(), "b".to_string())];
        let err = build_design(&table(), &metadata).unwrap_err();
        assert!(matches!(err, PipelineError::NoSharedSamples { counts_samples: 3, metadata_samples: 2 }));
        assert!(err.to_string().starts_with("No common samples"));
    }

    #[test]
    fn test_design_contrast_and_subset() {
        let metadata = vec![
            ("heat1".to_string(), "heat".to_string()),
            ("ctrl1".to_string(), "control".to_string()),
            ("ghost".to_string(), "control".to_string()),
        ];
        let design = build_design(&table(), &metadata).unwrap();
        assert_eq!(design.reference, "heat");
        assert_eq!(design.treatment, "control");
        assert_eq!(design.samples.len(), 2);

        let names: Vec<String> = design.samples.iter().map(|(s, _)| s.clone()).collect();
        let subset = table().subset(&names);
        assert_eq!(subset.samples, vec!["heat1", "ctrl1"]);
        // g2 is all zero; g3 is zero in ctrl1 but not heat1
        assert_eq!(subset.genes, vec!["g1", "g3"]);
        assert_eq!(subset.counts, array![[40.0, 10.0], [5.0, 0.0]]);
    }

    #[test]
    fn test_single_condition_rejected() {
        let metadata = vec![("ctrl1".to_string(), "control".to_string()), ("ctrl2".to_string(), "control".to_string())];
        assert!(matches!(build_design(&table(), &metadata), Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn test_annotate_results_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.tsv");
        fs::write(
            &raw,
            "gene_id\tbaseMean\tlog2FoldChange\tlfcSE\tstat\tpvalue\tpadj\n\
             g1\t150.0\t2.5\t0.3\t8.1\t1e-10\t1e-8\n\
             g2\t5.0\t3.0\t0.9\t3.0\t0.001\t0.01\n\
             g3\t300.0\t0.4\t0.1\t4.0\t0.0001\t0.001\n\
             g4\t80.0\t-1.5\t0.4\t-3.7\t0.0002\tNA\n\
             g5\t90.0\t-1.2\t0.3\t-4.0\t0.001\t0.02\n",
        )
        .unwrap();
        let symbols = HashMap::from([("g1".to_string(), "PAU8".to_string())]);
        let results = dir.path().join("results.csv");
        let significant = dir.path().join("significant.csv");
        let summary = annotate_results(&raw, &symbols, 0.05, &results, &significant).unwrap();
        assert_eq!(summary, ResultSummary { genes: 5, significant: 2 });

        let written = fs::read_to_string(&results).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next(),
            Some("gene_id,gene_symbol,baseMean,log2FoldChange,lfcSE,stat,pvalue,padj")
        );
        assert!(lines.next().unwrap().starts_with("g1,PAU8,"));
        assert!(lines.next().unwrap().starts_with("g2,Na,"));

        let hits = fs::read_to_string(&significant).unwrap();
        let ids: Vec<&str> = hits.lines().skip(1).map(|l| l.split(',').next().unwrap()).collect();
        assert_eq!(ids, vec!["g1", "g5"]);
    }

    #[test]
    fn test_exploratory_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let table = CountsTable {
            genes: vec!["g1".into(), "g2".into()],
            samples: vec!["ctrl1".into(), "ctrl2".into(), "heat1".into(), "heat2".into()],
            counts: array![[100.0, 110.0, 5.0, 4.0], [5.0, 6.0, 100.0, 90.0]],
        };
        let design = Design {
            samples: vec![
                ("ctrl1".into(), "control".into()),
                ("ctrl2".into(), "control".into()),
                ("heat1".into(), "heat".into()),
                ("heat2".into(), "heat".into()),
            ],
            reference: "control".into(),
            treatment: "heat".into(),
        };
        let pca_path = dir.path().join("pca.tsv");
        let clustering_path = dir.path().join("clusters.tsv");
        write_exploratory(&table, &design, &pca_path, &clustering_path).unwrap();

        let pca_text = fs::read_to_string(&pca_path).unwrap();
        assert_eq!(pca_text.lines().count(), 2 + 4);
        assert!(pca_text.contains("heat2\theat\t"));

        let clusters = fs::read_to_string(&clustering_path).unwrap();
        let rows: Vec<&str> = clusters.lines().collect();
        assert_eq!(rows.len(), 1 + 3);
        assert!(rows[3].ends_with("\t4"));
    }

    #[tokio::test]
    async fn test_missing_annotation_stops_before_de_tool() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;
        use crate::config::defs::RunConfig;
        use crate::config::references::ReferenceCatalog;
        use crate::config::settings::PipelineSettings;
        use crate::store::{ArtifactRegistry, MemoryStore, NewArtifact, NewProject, ProjectStore, SequencingLayout};

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("deseq2.ran");
        let tool = dir.path().join("run_deseq2");
        fs::write(&tool, format!("#!/bin/sh\ntouch '{}'\n", marker.display())).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let mut settings = PipelineSettings::default();
        settings.tools.deseq2 = tool.to_string_lossy().to_string();
        let references = ReferenceCatalog::builtin(&dir.path().join("refs"));
        let annotation = references.annotation("yeast").unwrap();
        let config = RunConfig { settings, references: Arc::new(references), threads: 1 };

        let store = MemoryStore::new();
        let project = store
            .create_project(NewProject {
                session_id: "s1".to_string(),
                name: "no annotation".to_string(),
                species: "yeast".to_string(),
                genome_reference: "Saccharomyces cerevisiae (R64-1-1)".to_string(),
                pipeline_version: "1.0".to_string(),
                sequencing_type: SequencingLayout::Single,
                pvalue_cutoff: 0.05,
            })
            .unwrap();
        let counts = dir.path().join("counts.tsv");
        fs::write(&counts, "Geneid\tctrl1\theat1\nYAL068C\t30\t70\n").unwrap();
        let metadata = dir.path().join("metadata.csv");
        fs::write(&metadata, "sample,condition\nctrl1,control\nheat1,heat\n").unwrap();
        let inputs = vec![
            store.register(project.id, NewArtifact::file(ArtifactKind::FeaturecountsCounts, &counts)).unwrap(),
            store.register(project.id, NewArtifact::file(ArtifactKind::DeseqMetadata, &metadata)).unwrap(),
        ];

        let ctx = StageContext { config: &config, registry: &store };
        let err = DifferentialExecutor
            .run(&ctx, &project, &inputs, &dir.path().join("deseq2"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { ref path } if *path == annotation));
        assert!(!marker.exists());
        assert!(store.query(project.id, &crate::store::ArtifactFilter::kind(ArtifactKind::DeseqOutput)).unwrap().is_empty());
    }
}

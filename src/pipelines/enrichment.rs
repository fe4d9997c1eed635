use std::collections::HashMap;
use std::fs;
use std::path::Path;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use crate::config::defs::{PipelineError, ENRICHMENT_FILE, ENRICHMENT_RAW_FILE, ENRICHMENT_TAG};
use crate::pipelines::{ensure_inputs_exist, StageContext, StageExecutor, StageOutput};
use crate::store::{Artifact, ArtifactKind, Project};
use crate::utils::command::enrichment::arg_generator;
use crate::utils::command::run_tool;

const TERM_COLUMN: &str = "Term";
const LINK_TERM_COLUMN: &str = "Term_Name";
const LINK_COLUMN: &str = "Link";

lazy_static! {
    static ref KEGG_ID: Regex = Regex::new(r"^(hsa|N|ath|osa|zma)\d{5}$").unwrap();
    static ref ONTOLOGY_ID: Regex = Regex::new(r"^(GO|HP):\d{7}$").unwrap();
}


/// Browser URL for a KEGG pathway or network, GO term or HPO term id.
fn term_link(id: &str) -> Option<String> {
    if KEGG_ID.is_match(id) {
        if id.starts_with('N') {
            Some(format!("https://www.genome.jp/entry/{}", id))
        } else {
            Some(format!("https://www.genome.jp/dbget-bin/www_bget?pathway:{}", id))
        }
    } else if ONTOLOGY_ID.is_match(id) {
        if id.starts_with("GO:") {
            Some(format!("https://www.ebi.ac.uk/QuickGO/term/{}", id))
        } else {
            Some(format!("https://next.monarchinitiative.org/{}", id))
        }
    } else {
        None
    }
}


/// (term name, link) for every GMT gene set whose id is recognised.
///
/// The id may sit in either of the first two columns; sets with no known id
/// are skipped.
pub fn gmt_links(path: &Path) -> Result<Vec<(String, String)>, PipelineError> {
    let raw = fs::read_to_string(path).map_err(|_| PipelineError::MissingInput { path: path.to_path_buf() })?;
    let mut links = Vec::new();
    let mut skipped = 0;
    for line in raw.lines() {
        let cols: Vec<&str> = line.trim().split('\t').collect();
        if cols.len() < 2 {
            continue;
        }
        let found = term_link(cols[0])
            .map(|link| (cols[1], link))
            .or_else(|| term_link(cols[1]).map(|link| (cols[0], link)));
        match found {
            Some((name, link)) => links.push((name.to_string(), link)),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("{}: skipped {} gene sets without a known id", path.display(), skipped);
    }
    Ok(links)
}


/// Writes the `Term_Name,Link` table for a GMT file. Returns the row count.
pub fn convert_gmt(gmt: &Path, out: &Path) -> Result<usize, PipelineError> {
    let links = gmt_links(gmt)?;
    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record([LINK_TERM_COLUMN, LINK_COLUMN])?;
    for (term, link) in &links {
        writer.write_record([term, link])?;
    }
    writer.flush()?;
    Ok(links.len())
}


/// Term name -> URL from a GO or KEGG link table (`Term_Name`, `Link`).
/// A `.gmt` gene set file is converted on the fly.
pub fn read_links(path: &Path) -> Result<HashMap<String, String>, PipelineError> {
    if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gmt")) {
        let mut links = HashMap::new();
        for (term, link) in gmt_links(path)? {
            links.entry(term).or_insert(link);
        }
        return Ok(links);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let term_col = headers.iter().position(|h| h == LINK_TERM_COLUMN);
    let link_col = headers.iter().position(|h| h == LINK_COLUMN);
    let (Some(term_col), Some(link_col)) = (term_col, link_col) else {
        return Err(PipelineError::InvalidInput(format!(
            "{} needs {} and {} columns",
            path.display(),
            LINK_TERM_COLUMN,
            LINK_COLUMN
        )));
    };
    let mut links = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if let (Some(term), Some(link)) = (record.get(term_col), record.get(link_col)) {
            links.entry(term.to_string()).or_insert_with(|| link.to_string());
        }
    }
    Ok(links)
}


/// Copies `raw` to `out` with a `Link` column right after `Term`.
pub fn merge_links(raw: &Path, links: &HashMap<String, String>, out: &Path) -> Result<usize, PipelineError> {
    let mut reader = csv::Reader::from_path(raw)?;
    let headers = reader.headers()?.clone();
    let term_col = headers
        .iter()
        .position(|h| h == TERM_COLUMN)
        .ok_or_else(|| PipelineError::InvalidInput(format!("{} has no {} column", raw.display(), TERM_COLUMN)))?;

    let mut header: Vec<&str> = headers.iter().collect();
    header.insert(term_col + 1, LINK_COLUMN);
    let mut writer = csv::Writer::from_path(out)?;
    writer.write_record(&header)?;

    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        let mut row: Vec<&str> = record.iter().collect();
        let link = record
            .get(term_col)
            .and_then(|t| links.get(t))
            .map(|l| l.as_str())
            .unwrap_or("");
        row.insert((term_col + 1).min(row.len()), link);
        writer.write_record(&row)?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}


/// External enrichment over the full DE table, with GO/KEGG links merged in.
pub struct EnrichmentExecutor;

impl StageExecutor for EnrichmentExecutor {
    const STAGE: &'static str = ENRICHMENT_TAG;

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        project: &Project,
        inputs: &[Artifact],
        output_dir: &Path,
    ) -> Result<StageOutput, PipelineError> {
        let results = inputs
            .iter()
            .rev()
            .find(|a| a.kind == ArtifactKind::DeseqOutput)
            .ok_or_else(|| PipelineError::InvalidInput("no deseq_output artifact available".to_string()))?;
        ensure_inputs_exist([results.path.as_path()])?;
        fs::create_dir_all(output_dir)?;

        let mut output = StageOutput::new(Self::STAGE);
        let raw_path = output_dir.join(ENRICHMENT_RAW_FILE);
        let args = arg_generator(&results.path, &project.species, project.pvalue_cutoff, &raw_path);
        info!("Running enrichment for {}", project.species);
        run_tool(ENRICHMENT_TAG, &ctx.config.tool(ENRICHMENT_TAG), &args).await?;
        if !raw_path.exists() {
            output.warn(format!("enrichment produced no table at {}", raw_path.display()));
            return Ok(output);
        }

        let reference = ctx.config.references.get(&project.species)?;
        let mut links = HashMap::new();
        for table in [&reference.go_links, &reference.kegg_links].into_iter().flatten() {
            let path = ctx.config.references.resolve(table);
            match read_links(&path) {
                Ok(found) => {
                    for (term, link) in found {
                        links.entry(term).or_insert(link);
                    }
                }
                Err(e) => output.warn(format!("link table {} unusable: {}", path.display(), e)),
            }
        }

        let merged = output_dir.join(ENRICHMENT_FILE);
        let rows = merge_links(&raw_path, &links, &merged)?;
        info!("Enrichment table has {} terms", rows);
        output.collect(ctx, project, ArtifactKind::EnrichmentOutput, &merged, false)?;
        Ok(output)
    }
}

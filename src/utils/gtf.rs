use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use crate::config::defs::PipelineError;
use crate::config::references::AnnotationFormat;

lazy_static! {
    static ref GTF_ATTRIBUTE: Regex = Regex::new(r#"(\S+)\s+"([^"]*)""#).unwrap();
}


fn gtf_attributes(raw: &str) -> HashMap<&str, &str> {
    GTF_ATTRIBUTE
        .captures_iter(raw)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect()
}


fn gff_pairs(raw: &str) -> Vec<(&str, &str)> {
    raw.split(';')
        .filter_map(|kv| kv.trim().split_once('='))
        .collect()
}


fn gff_attributes(raw: &str) -> HashMap<&str, &str> {
    gff_pairs(raw).into_iter().collect()
}


/// Features whose ids exons point at through `Parent`.
const EXON_PARENTS: &[&str] = &["gene", "mRNA", "tRNA", "rRNA", "ncRNA"];


/// Copies a GFF3 annotation, giving every exon a `gene=` attribute so exon
/// level counting can group by gene.
///
/// The name comes from the exon's parent: its `gene` or `Name` attribute, then
/// the name of the parent's own parent, then the parent's `ID`. Non-coding
/// transcripts usually only have the last. Returns how many exons were tagged.
pub fn preprocess_gff(input: &Path, output: &Path) -> Result<usize, PipelineError> {
    let raw = fs::read_to_string(input).map_err(|_| PipelineError::MissingInput { path: input.to_path_buf() })?;

    let mut names: HashMap<String, String> = HashMap::new();
    for line in raw.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 9 || !EXON_PARENTS.contains(&cols[2]) {
            continue;
        }
        let attrs = gff_attributes(cols[8]);
        let Some(id) = attrs.get("ID") else { continue };
        let name = attrs
            .get("gene")
            .or_else(|| attrs.get("Name"))
            .map(|n| n.to_string())
            .or_else(|| attrs.get("Parent").and_then(|p| names.get(*p)).cloned())
            .unwrap_or_else(|| id.to_string());
        names.insert(id.to_string(), name);
    }

    let mut out = BufWriter::new(File::create(output)?);
    let mut tagged = 0;
    let mut orphans = 0;
    for line in raw.lines() {
        let cols: Vec<&str> = line.split('\t').collect();
        if line.starts_with('#') || cols.len() < 9 || cols[2] != "exon" {
            writeln!(out, "{}", line)?;
            continue;
        }
        let mut pairs = gff_pairs(cols[8]);
        let parent = pairs
            .iter()
            .find(|(k, _)| *k == "Parent")
            .and_then(|(_, v)| v.split(',').next())
            .unwrap_or("");
        let Some(gene) = names.get(parent) else {
            orphans += 1;
            writeln!(out, "{}", line)?;
            continue;
        };
        pairs.retain(|(k, _)| *k != "gene");
        pairs.push(("gene", gene.as_str()));
        let attributes: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        writeln!(out, "{}\t{}", cols[..8].join("\t"), attributes.join(";"))?;
        tagged += 1;
    }
    out.flush()?;

    if orphans > 0 {
        warn!("{}: {} exons have no known parent and were left untagged", input.display(), orphans);
    }
    info!("Preprocessed annotation written to {}", output.display());
    Ok(tagged)
}


/// Gene id -> gene symbol from the annotation's attribute column.
///
/// GTF rows use `gene_name`; GFF3 rows use `Name` (or `gene`), with the id
/// taken from `id_attribute` or an `ID=gene:` prefix.
pub fn gene_symbols(path: &Path, format: AnnotationFormat, id_attribute: &str) -> Result<HashMap<String, String>, PipelineError> {
    let file = File::open(path).map_err(|_| PipelineError::MissingInput { path: path.to_path_buf() })?;
    let mut symbols = HashMap::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 9 {
            continue;
        }
        let (id, symbol) = match format {
            AnnotationFormat::Gtf => {
                let attrs = gtf_attributes(cols[8]);
                (attrs.get(id_attribute).copied(), attrs.get("gene_name").copied())
            }
            AnnotationFormat::Gff => {
                let attrs = gff_attributes(cols[8]);
                let id = attrs
                    .get(id_attribute)
                    .copied()
                    .or_else(|| attrs.get("ID").map(|v| v.trim_start_matches("gene:")));
                let symbol = attrs.get("Name").or_else(|| attrs.get("gene")).copied();
                (id, symbol)
            }
        };
        if let (Some(id), Some(symbol)) = (id, symbol) {
            symbols.entry(id.to_string()).or_insert_with(|| symbol.to_string());
        }
    }
    Ok(symbols)
}

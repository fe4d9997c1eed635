use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use flate2::read::MultiGzDecoder;
use lazy_static::lazy_static;
use seq_io::fastq::Reader as FastqReader;
use crate::config::defs::PipelineError;
use crate::store::{Artifact, ArtifactKind, SequencingLayout};
use crate::utils::file::{is_gzipped, strip_known_extensions};

/// Suffixes the trimmer appends to a sample's file names.
const STAGE_SUFFIXES: &[&'static str] = &["_trimmed", "_unpaired", "_paired"];
const LANE_CHUNK: &str = "001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTag {
    Forward,
    Reverse,
}

lazy_static! {
    static ref READ_TAGS: HashMap<&'static str, ReadTag> = {
        let mut m = HashMap::new();
        m.insert("R1", ReadTag::Forward);
        m.insert("R2", ReadTag::Reverse);
        m.insert("r1", ReadTag::Forward);
        m.insert("r2", ReadTag::Reverse);
        m.insert("READ1", ReadTag::Forward);
        m.insert("READ2", ReadTag::Reverse);
        m.insert("read1", ReadTag::Forward);
        m.insert("read2", ReadTag::Reverse);
        m
    };
}


/// Checks that a FASTQ file (plain or gzip) yields at least one well-formed record.
///
/// # Arguments
///
/// * `path` - FASTQ file.
///
/// # Returns
/// `InvalidFastqFormat` naming the file when no record can be read.
pub fn validate_fastq(path: &Path) -> Result<(), PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingInput { path: path.to_path_buf() });
    }
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if is_gzipped(path)? {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut fastq = FastqReader::new(reader);
    match fastq.next() {
        Some(Ok(_)) => Ok(()),
        Some(Err(e)) => Err(PipelineError::InvalidFastqFormat(format!("{}: {}", path.display(), e))),
        None => Err(PipelineError::InvalidFastqFormat(format!("{}: no records", path.display()))),
    }
}


/// File stem with compression and format extensions removed.
pub fn file_stem(path: &Path) -> String {
    strip_known_extensions(path)
}


/// Stem of a read artifact. Trimmer outputs lose the one stage suffix the
/// trimmer appended; input files keep their names exactly as uploaded.
pub fn read_stem(artifact: &Artifact) -> String {
    let stem = file_stem(&artifact.path);
    let produced = matches!(
        artifact.kind,
        ArtifactKind::TrimmomaticFastq | ArtifactKind::TrimmomaticFastqPaired | ArtifactKind::TrimmomaticFastqUnpaired
    );
    if !produced {
        return stem;
    }
    match STAGE_SUFFIXES.iter().find(|s| stem.len() > s.len() && stem.ends_with(*s)) {
        Some(suffix) => stem[..stem.len() - suffix.len()].to_string(),
        None => stem,
    }
}


/// Splits a trailing mate tag (`_R1`, `.R2`, `-read1`, optionally followed by
/// an Illumina `_001` chunk) off a stem.
pub fn split_read_tag(stem: &str) -> Option<(String, ReadTag)> {
    for delimiter in ['_', '.', '-'] {
        let parts: Vec<&str> = stem.split(delimiter).collect();
        let mut end = parts.len();
        if end >= 3 && parts[end - 1] == LANE_CHUNK {
            end -= 1;
        }
        if end < 2 {
            continue;
        }
        if let Some(tag) = READ_TAGS.get(parts[end - 1]) {
            let base = parts[..end - 1].join(&delimiter.to_string());
            if !base.is_empty() {
                return Some((base, *tag));
            }
        }
    }
    None
}


/// Removes every trailing mate tag, so applying it twice equals applying it once.
pub fn strip_read_tag(stem: &str) -> String {
    let mut current = stem.to_string();
    while let Some((base, _)) = split_read_tag(&current) {
        current = base;
    }
    current
}


/// Sample a file belongs to. Mate tags only count for paired projects.
pub fn sample_name(path: &Path, layout: SequencingLayout) -> String {
    sample_from_stem(file_stem(path), layout)
}

/// Like `sample_name`, but aware of the suffixes later stages add.
pub fn artifact_sample_name(artifact: &Artifact, layout: SequencingLayout) -> String {
    sample_from_stem(read_stem(artifact), layout)
}

fn sample_from_stem(stem: String, layout: SequencingLayout) -> String {
    match layout {
        SequencingLayout::Single => stem,
        SequencingLayout::Paired => strip_read_tag(&stem),
    }
}


#[derive(Debug, Clone, PartialEq)]
pub enum SampleReads {
    Single(Artifact),
    Paired { forward: Artifact, reverse: Artifact },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub reads: SampleReads,
}

impl Sample {
    pub fn artifacts(&self) -> Vec<&Artifact> {
        match &self.reads {
            SampleReads::Single(a) => vec![a],
            SampleReads::Paired { forward, reverse } => vec![forward, reverse],
        }
    }
}


/// Groups read files into samples, sorted by name. Paired layouts need
/// exactly one forward and one reverse file per sample.
///
/// # Arguments
///
/// * `layout` - Project sequencing layout.
/// * `artifacts` - Read files (original or trimmed).
///
/// # Returns
/// Samples, or `Pairing` describing the first file that cannot be paired.
pub fn group_samples(layout: SequencingLayout, artifacts: &[Artifact]) -> Result<Vec<Sample>, PipelineError> {
    match layout {
        SequencingLayout::Single => {
            let mut samples: BTreeMap<String, Sample> = BTreeMap::new();
            for artifact in artifacts {
                let name = artifact_sample_name(artifact, layout);
                if samples.contains_key(&name) {
                    return Err(PipelineError::Pairing(format!(
                        "Duplicate sample name {} ({})",
                        name,
                        artifact.path.display()
                    )));
                }
                samples.insert(name.clone(), Sample { name, reads: SampleReads::Single(artifact.clone()) });
            }
            Ok(samples.into_values().collect())
        }
        SequencingLayout::Paired => {
            let mut mates: BTreeMap<String, (Option<Artifact>, Option<Artifact>)> = BTreeMap::new();
            for artifact in artifacts {
                let stem = read_stem(artifact);
                let (_, tag) = split_read_tag(&stem).ok_or_else(|| {
                    PipelineError::Pairing(format!(
                        "{} has no _R1/_R2 mate tag",
                        artifact.path.display()
                    ))
                })?;
                let name = strip_read_tag(&stem);
                let slot = mates.entry(name.clone()).or_insert((None, None));
                let target = match tag {
                    ReadTag::Forward => &mut slot.0,
                    ReadTag::Reverse => &mut slot.1,
                };
                if target.is_some() {
                    return Err(PipelineError::Pairing(format!(
                        "Sample {} has more than one {} file",
                        name,
                        if tag == ReadTag::Forward { "R1" } else { "R2" }
                    )));
                }
                *target = Some(artifact.clone());
            }

            let mut samples = Vec::with_capacity(mates.len());
            for (name, pair) in mates {
                match pair {
                    (Some(forward), Some(reverse)) => {
                        samples.push(Sample { name, reads: SampleReads::Paired { forward, reverse } });
                    }
                    (Some(_), None) => {
                        return Err(PipelineError::Pairing(format!("Sample {} is missing its R2 file", name)));
                    }
                    (None, Some(_)) => {
                        return Err(PipelineError::Pairing(format!("Sample {} is missing its R1 file", name)));
                    }
                    (None, None) => {}
                }
            }
            Ok(samples)
        }
    }
}

/// Parsing of FastQC `fastqc_data.txt` reports into routing signals
use std::fs;
use std::path::{Path, PathBuf};
use crate::config::defs::{
    PipelineError, ADAPTER_HIGH_THRESHOLD, ADAPTER_PRESENCE_THRESHOLD, FASTQC_DATA_FILE,
    LOW_QUALITY_THRESHOLD,
};
use crate::utils::file::strip_known_extensions;

const PER_BASE_QUALITY_MODULE: &str = "Per base sequence quality";
const ADAPTER_CONTENT_MODULE: &str = "Adapter Content";
const END_MODULE: &str = ">>END_MODULE";


/// Verdict token as FastQC wrote it. Ordered so the worse verdict is larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

impl Verdict {
    pub fn parse(token: &str) -> Option<Verdict> {
        match token.trim().to_lowercase().as_str() {
            "pass" => Some(Verdict::Pass),
            "warn" => Some(Verdict::Warn),
            "fail" => Some(Verdict::Fail),
            _ => None,
        }
    }
}


/// Inclusive base-position range, as in FastQC's grouped rows (`10-14`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRange {
    pub start: u32,
    pub end: u32,
}


#[derive(Debug, Clone, PartialEq)]
pub struct QcSignal {
    pub per_base_quality: Verdict,
    /// Positions whose mean quality is below 20.
    pub low_quality_positions: Vec<PositionRange>,
    pub adapter_content: Verdict,
    /// Adapters whose peak percentage exceeds the presence threshold, with that peak.
    pub adapters: Vec<(String, f64)>,
}

impl QcSignal {
    pub fn needs_trimming(&self) -> bool {
        self.per_base_quality != Verdict::Pass || self.adapter_content != Verdict::Pass
    }

    pub fn has_high_adapter_content(&self) -> bool {
        self.adapters.iter().any(|(_, pct)| *pct > ADAPTER_HIGH_THRESHOLD)
    }

    /// Worst-of combination, used for the two mates of a pair.
    pub fn merge(&self, other: &QcSignal) -> QcSignal {
        let mut low_quality_positions = self.low_quality_positions.clone();
        for range in &other.low_quality_positions {
            if !low_quality_positions.contains(range) {
                low_quality_positions.push(*range);
            }
        }
        low_quality_positions.sort_by_key(|r| (r.start, r.end));

        let mut adapters = self.adapters.clone();
        for (name, pct) in &other.adapters {
            match adapters.iter_mut().find(|(n, _)| n == name) {
                Some(existing) => existing.1 = existing.1.max(*pct),
                None => adapters.push((name.clone(), *pct)),
            }
        }

        QcSignal {
            per_base_quality: self.per_base_quality.max(other.per_base_quality),
            low_quality_positions,
            adapter_content: self.adapter_content.max(other.adapter_content),
            adapters,
        }
    }
}


/// Where FastQC puts the extracted report for `input` under `out_dir`.
pub fn report_path(out_dir: &Path, input: &Path) -> PathBuf {
    out_dir
        .join(format!("{}_fastqc", strip_known_extensions(input)))
        .join(FASTQC_DATA_FILE)
}


fn malformed(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::MalformedReport { path: path.to_path_buf(), reason: reason.into() }
}


fn parse_position(raw: &str) -> Option<PositionRange> {
    match raw.split_once('-') {
        Some((start, end)) => Some(PositionRange {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
        }),
        None => {
            let pos = raw.trim().parse().ok()?;
            Some(PositionRange { start: pos, end: pos })
        }
    }
}


/// Parses the report text. Verdicts are taken from the module headers as-is.
///
/// # Arguments
///
/// * `path` - Report path, used in error messages only.
/// * `raw` - Report contents.
///
/// # Returns
/// The QC signal, or `MalformedReport` when a monitored module is absent or
/// carries an unknown verdict.
pub fn parse_qc_text(path: &Path, raw: &str) -> Result<QcSignal, PipelineError> {
    let mut quality: Option<Verdict> = None;
    let mut adapter: Option<Verdict> = None;
    let mut low_quality_positions = Vec::new();
    let mut adapter_names: Vec<String> = Vec::new();
    let mut adapter_peaks: Vec<f64> = Vec::new();
    let mut current: Option<&str> = None;

    for line in raw.lines() {
        if line.starts_with(END_MODULE) {
            current = None;
            continue;
        }
        if let Some(header) = line.strip_prefix(">>") {
            let mut fields = header.split('\t');
            let name = fields.next().unwrap_or("").trim();
            let token = fields.next().unwrap_or("");
            match name {
                PER_BASE_QUALITY_MODULE | ADAPTER_CONTENT_MODULE => {
                    let verdict = Verdict::parse(token)
                        .ok_or_else(|| malformed(path, format!("bad verdict '{}' for {}", token.trim(), name)))?;
                    if name == PER_BASE_QUALITY_MODULE {
                        quality = Some(verdict);
                        current = Some(PER_BASE_QUALITY_MODULE);
                    } else {
                        adapter = Some(verdict);
                        current = Some(ADAPTER_CONTENT_MODULE);
                    }
                }
                _ => current = None,
            }
            continue;
        }

        match current {
            Some(PER_BASE_QUALITY_MODULE) => {
                if line.starts_with('#') || line.trim().is_empty() {
                    continue;
                }
                let cols: Vec<&str> = line.split('\t').collect();
                if cols.len() < 2 {
                    return Err(malformed(path, format!("short quality row '{}'", line)));
                }
                let range = parse_position(cols[0])
                    .ok_or_else(|| malformed(path, format!("bad base position '{}'", cols[0])))?;
                let mean: f64 = cols[1]
                    .trim()
                    .parse()
                    .map_err(|_| malformed(path, format!("bad mean quality '{}'", cols[1])))?;
                if mean < LOW_QUALITY_THRESHOLD {
                    low_quality_positions.push(range);
                }
            }
            Some(ADAPTER_CONTENT_MODULE) => {
                let cols: Vec<&str> = line.split('\t').collect();
                if line.starts_with('#') {
                    adapter_names = cols.iter().skip(1).map(|c| c.trim().to_string()).collect();
                    adapter_peaks = vec![0.0; adapter_names.len()];
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
                for (i, value) in cols.iter().skip(1).enumerate() {
                    if let (Some(peak), Ok(v)) = (adapter_peaks.get_mut(i), value.trim().parse::<f64>()) {
                        *peak = peak.max(v);
                    }
                }
            }
            _ => {}
        }
    }

    let per_base_quality = quality.ok_or_else(|| malformed(path, format!("missing module '{}'", PER_BASE_QUALITY_MODULE)))?;
    let adapter_content = adapter.ok_or_else(|| malformed(path, format!("missing module '{}'", ADAPTER_CONTENT_MODULE)))?;
    let adapters = adapter_names
        .into_iter()
        .zip(adapter_peaks)
        .filter(|(_, peak)| *peak > ADAPTER_PRESENCE_THRESHOLD)
        .collect();

    Ok(QcSignal { per_base_quality, low_quality_positions, adapter_content, adapters })
}


pub fn parse_qc_report(path: &Path) -> Result<QcSignal, PipelineError> {
    let raw = fs::read_to_string(path).map_err(|e| malformed(path, e.to_string()))?;
    parse_qc_text(path, &raw)
}


#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "##FastQC\t0.12.1
>>Basic Statistics\tpass
#Measure\tValue
Filename\tctrl1.fastq.gz
>>END_MODULE
>>Per base sequence quality\twarn
#Base\tMean\tMedian\tLower Quartile\tUpper Quartile\t10th Percentile\t90th Percentile
1\t18.2\t19.0\t15.0\t21.0\t12.0\t23.0
2\t31.0\t32.0\t30.0\t33.0\t28.0\t34.0
10-14\t19.5\t20.0\t18.0\t22.0\t15.0\t24.0
>>END_MODULE
>>Per sequence quality scores\tpass
#Quality\tCount
30\t1000.0
>>END_MODULE
>>Adapter Content\tfail
#Position\tIllumina Universal Adapter\tNextera Transposase Sequence\tPolyA
1\t0.0\t0.0\t0.0
10-11\t0.25\t0.005\t0.02
>>END_MODULE
";

    #[test]
    fn test_parse_report() {
        let signal = parse_qc_text(Path::new("r.txt"), REPORT).unwrap();
        assert_eq!(signal.per_base_quality, Verdict::Warn);
        assert_eq!(signal.adapter_content, Verdict::Fail);
        assert_eq!(
            signal.low_quality_positions,
            vec![PositionRange { start: 1, end: 1 }, PositionRange { start: 10, end: 14 }]
        );
        assert_eq!(
            signal.adapters,
            vec![("Illumina Universal Adapter".to_string(), 0.25), ("PolyA".to_string(), 0.02)]
        );
        assert!(signal.needs_trimming());
        assert!(signal.has_high_adapter_content());
    }

    #[test]
    fn test_verdict_passthrough_without_recomputing() {
        // Low means alone do not flip a pass verdict.
        let raw = REPORT.replace("quality\twarn", "quality\tpass").replace("Content\tfail", "Content\tpass");
        let signal = parse_qc_text(Path::new("r.txt"), &raw).unwrap();
        assert!(!signal.needs_trimming());
        assert_eq!(signal.low_quality_positions.len(), 2);
    }

    #[test]
    fn test_missing_module_is_malformed() {
        let raw = ">>Per base sequence quality\tpass\n>>END_MODULE\n";
        let err = parse_qc_text(Path::new("r.txt"), raw).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedReport { .. }));
        assert!(err.to_string().contains("Adapter Content"));
    }

    #[test]
    fn test_bad_verdict_and_missing_file() {
        let raw = REPORT.replace("quality\twarn", "quality\tmaybe");
        assert!(parse_qc_text(Path::new("r.txt"), &raw).is_err());
        assert!(matches!(
            parse_qc_report(Path::new("/definitely/not/here/fastqc_data.txt")),
            Err(PipelineError::MalformedReport { .. })
        ));
    }

    #[test]
    fn test_merge_takes_worst() {
        let a = parse_qc_text(Path::new("a"), &REPORT.replace("Content\tfail", "Content\tpass")).unwrap();
        let mut b = a.clone();
        b.per_base_quality = Verdict::Pass;
        b.adapter_content = Verdict::Warn;
        b.adapters = vec![("PolyA".to_string(), 0.5)];
        let merged = a.merge(&b);
        assert_eq!(merged.per_base_quality, Verdict::Warn);
        assert_eq!(merged.adapter_content, Verdict::Warn);
        assert!(merged.adapters.contains(&("PolyA".to_string(), 0.5)));
    }

    #[test]
    fn test_report_path() {
        assert_eq!(
            report_path(Path::new("/out"), Path::new("/in/ctrl1_R1.fastq.gz")),
            PathBuf::from("/out/ctrl1_R1_fastqc/fastqc_data.txt")
        );
    }
}

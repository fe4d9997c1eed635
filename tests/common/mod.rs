#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use rnaseq_pipelines::config::defs::RunConfig;
use rnaseq_pipelines::config::references::ReferenceCatalog;
use rnaseq_pipelines::config::settings::{PipelineSettings, ToolPaths};
use rnaseq_pipelines::pipelines::events::{BroadcastPublisher, NotificationPublisher, StatusEvent};
use rnaseq_pipelines::pipelines::orchestrator::PipelineOrchestrator;
use rnaseq_pipelines::store::{MemoryStore, NewProject, ProjectStore, SequencingLayout};

const FASTQC_STUB: &str = r#"#!/bin/sh
out=""; input=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2;;
    --threads) shift 2;;
    --extract) shift;;
    *) input="$1"; shift;;
  esac
done
base=$(basename "$input"); base=${base%.gz}; base=${base%.fastq}; base=${base%.fq}
verdict=pass; first=34.0
case "$base" in *lowq*) verdict=warn; first=15.0;; esac
case "$base" in *_trimmed*) verdict=pass; first=34.0;; esac
mkdir -p "$out/${base}_fastqc"
: > "$out/${base}_fastqc.html"
: > "$out/${base}_fastqc.zip"
{
  printf '##FastQC\t0.12.1\n'
  printf '>>Basic Statistics\tpass\n'
  printf '>>END_MODULE\n'
  printf '>>Per base sequence quality\t%s\n' "$verdict"
  printf '#Base\tMean\tMedian\n'
  printf '1\t%s\t34.0\n' "$first"
  printf '2-4\t33.0\t34.0\n'
  printf '>>END_MODULE\n'
  printf '>>Adapter Content\tpass\n'
  printf '#Position\tIllumina Universal Adapter\tNextera Transposase Sequence\n'
  printf '1\t0.0\t0.0\n'
  printf '>>END_MODULE\n'
} > "$out/${base}_fastqc/fastqc_data.txt"
"#;

const TRIMMOMATIC_STUB: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/trimmomatic.calls"
mode="$1"; shift 4
if [ "$mode" = "SE" ]; then
  cp "$1" "$2"
else
  cp "$1" "$3"; : > "$4"; cp "$2" "$5"; : > "$6"
fi
"#;

const HISAT2_STUB: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/hisat2.calls"
printf '@HD\tVN:1.0\tSO:unsorted\n'
printf 'read1\t0\tI\t1810\t60\t4M\t*\t0\t0\tACGT\tIIII\n'
echo "1 reads; of these:" >&2
echo "100.00% overall alignment rate" >&2
"#;

const HISAT2_FAILING_STUB: &str = r#"#!/bin/sh
echo "Error: index not readable" >&2
exit 1
"#;

const SAMTOOLS_STUB: &str = r#"#!/bin/sh
sub="$1"; shift
case "$sub" in
  view)
    out=""
    while [ $# -gt 0 ]; do
      case "$1" in -o) out="$2"; shift 2;; *) shift;; esac
    done
    cat > "$out";;
  sort)
    out=""; in=""
    while [ $# -gt 0 ]; do
      case "$1" in -@) shift 2;; -o) out="$2"; shift 2;; *) in="$1"; shift;; esac
    done
    cp "$in" "$out";;
  index)
    : > "$1.bai";;
  *)
    echo "unknown subcommand $sub" >&2; exit 1;;
esac
"#;

const FEATURECOUNTS_STUB: &str = r##"#!/bin/sh
out=""; bams=""
while [ $# -gt 0 ]; do
  case "$1" in
    -T|-F|-t|-g|-a) shift 2;;
    -o) out="$2"; shift 2;;
    -p|--countReadPairs) shift;;
    *) bams="$bams $1"; shift;;
  esac
done
{
  echo "# Program:featureCounts v2.0.6; Command:\"featureCounts\""
  printf 'Geneid\tChr\tStart\tEnd\tStrand\tLength'
  for b in $bams; do printf '\t%s' "$b"; done
  printf '\n'
  g=0
  for gene in YAL068C YAL067C YAL066W; do
    g=$((g+1))
    printf '%s\tI\t%d\t%d\t+\t300' "$gene" $((g*1000)) $((g*1000+300))
    s=0
    for b in $bams; do s=$((s+1)); printf '\t%d' $((g*10 + s*7 + 5)); done
    printf '\n'
  done
} > "$out"
printf 'Status\tcounts\nAssigned\t42\n' > "$out.summary"
"##;

const DESEQ2_STUB: &str = r#"#!/bin/sh
counts=""; out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --counts) counts="$2"; shift 2;;
    --output) out="$2"; shift 2;;
    *) shift 2;;
  esac
done
printf 'gene_id\tbaseMean\tlog2FoldChange\tlfcSE\tstat\tpvalue\tpadj\n' > "$out"
n=0
tail -n +2 "$counts" | cut -f1 | while read -r gene; do
  n=$((n+1))
  if [ "$n" -eq 1 ]; then lfc=2.1; else lfc=0.2; fi
  printf '%s\t250.5\t%s\t0.3\t7.0\t0.00001\t0.0004\n' "$gene" "$lfc" >> "$out"
done
"#;

const ENRICHMENT_STUB: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in --output) out="$2"; shift 2;; *) shift 2;; esac
done
printf 'Category,Term,Genes,Adjusted P-value\nGO_BP,response to heat,PAU8,0.001\n' > "$out"
"#;

const GTF: &str = "#!genome-build R64-1-1\n\
I\tsgd\tgene\t1807\t2169\t.\t-\t.\tgene_id \"YAL068C\"; gene_name \"PAU8\";\n\
I\tsgd\texon\t1807\t2169\t.\t-\t.\tgene_id \"YAL068C\"; gene_name \"PAU8\";\n\
I\tsgd\tgene\t2480\t2707\t.\t+\t.\tgene_id \"YAL067W-A\";\n";

const FASTQ: &str = "@r1\nACGTACGTAC\n+\nIIIIIIIIII\n@r2\nTTGCAACGTA\n+\nIIIIIIIIII\n";


/// Forwards to a broadcast publisher and checks the store after every event:
/// the row must already carry the event's status, and a terminal row must not
/// still be marked running.
pub struct CheckingPublisher {
    store: Arc<MemoryStore>,
    pub inner: BroadcastPublisher,
    events: Mutex<Vec<StatusEvent>>,
    violations: Mutex<Vec<String>>,
}

impl CheckingPublisher {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }
}

impl NotificationPublisher for CheckingPublisher {
    fn publish(&self, event: StatusEvent) {
        let project = self.store.get_project(event.project_id).unwrap();
        if project.status != event.status {
            self.violations
                .lock()
                .unwrap()
                .push(format!("event {} published while row is {}", event.status, project.status));
        }
        if project.is_running && project.status.is_terminal() {
            self.violations
                .lock()
                .unwrap()
                .push(format!("project {} running in terminal status {}", project.id, project.status));
        }
        self.events.lock().unwrap().push(event.clone());
        self.inner.publish(event);
    }
}


#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureOptions {
    pub failing_aligner: bool,
    pub enrichment: bool,
}


pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<CheckingPublisher>,
    pub orchestrator: PipelineOrchestrator,
}

fn write_tool(bin: &Path, name: &str, body: &str) -> String {
    let path = bin.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

impl Fixture {
    pub fn new(options: FixtureOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let refs = dir.path().join("refs");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(refs.join("index")).unwrap();
        fs::create_dir_all(dir.path().join("reads")).unwrap();
        fs::write(refs.join("index").join("yeast.1.ht2"), b"index").unwrap();
        fs::write(refs.join("genes.gtf"), GTF).unwrap();
        fs::write(
            refs.join("go_links.csv"),
            "Term_Name,Link\nresponse to heat,https://amigo.geneontology.org/amigo/term/GO:0009408\n",
        )
        .unwrap();

        let tools = ToolPaths {
            fastqc: write_tool(&bin, "fastqc", FASTQC_STUB),
            trimmomatic: write_tool(&bin, "trimmomatic", TRIMMOMATIC_STUB),
            hisat2: if options.failing_aligner {
                write_tool(&bin, "hisat2", HISAT2_FAILING_STUB)
            } else {
                write_tool(&bin, "hisat2", HISAT2_STUB)
            },
            samtools: write_tool(&bin, "samtools", SAMTOOLS_STUB),
            featurecounts: write_tool(&bin, "featureCounts", FEATURECOUNTS_STUB),
            deseq2: write_tool(&bin, "run_deseq2", DESEQ2_STUB),
            enrichment: write_tool(&bin, "run_enrichment", ENRICHMENT_STUB),
        };

        let settings = PipelineSettings {
            media_root: dir.path().join("media"),
            references_root: refs.clone(),
            references_file: None,
            adapters_fasta: None,
            threads: 2,
            pending_pause_ms: 0,
            event_buffer: 64,
            enrichment: options.enrichment,
            tools,
        };
        let references = ReferenceCatalog::from_toml(
            &refs,
            r#"
            [species.yeast]
            genome_label = "Saccharomyces cerevisiae (R64-1-1)"
            hisat2_index = "index/yeast"
            annotation = "genes.gtf"
            annotation_format = "gtf"
            go_links = "go_links.csv"
            "#,
        )
        .unwrap();
        let config = Arc::new(RunConfig { settings, references: Arc::new(references), threads: 2 });

        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(CheckingPublisher {
            store: store.clone(),
            inner: BroadcastPublisher::new(64),
            events: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
        });
        let orchestrator = PipelineOrchestrator::new(config, store.clone(), store.clone(), publisher.clone());
        Fixture { dir, store, publisher, orchestrator }
    }

    pub fn write_fastq(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("reads").join(name);
        fs::write(&path, FASTQ).unwrap();
        path
    }

    pub fn write_metadata(&self, rows: &[(&str, &str)]) -> PathBuf {
        let path = self.dir.path().join("reads").join("metadata.csv");
        let mut raw = String::from("sample,condition\n");
        for (sample, condition) in rows {
            raw.push_str(&format!("{},{}\n", sample, condition));
        }
        fs::write(&path, raw).unwrap();
        path
    }

    /// Argument lines a logging stub tool was invoked with, in call order.
    pub fn tool_calls(&self, tool: &str) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("bin").join(format!("{}.calls", tool)))
            .map(|raw| raw.lines().map(|l| l.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn trimmomatic_calls(&self) -> Vec<String> {
        self.tool_calls("trimmomatic")
    }
}


pub fn new_project(name: &str, layout: SequencingLayout) -> NewProject {
    NewProject {
        session_id: "session-1".to_string(),
        name: name.to_string(),
        species: "yeast".to_string(),
        genome_reference: "Saccharomyces cerevisiae (R64-1-1)".to_string(),
        pipeline_version: "1.0".to_string(),
        sequencing_type: layout,
        pvalue_cutoff: 0.05,
    }
}

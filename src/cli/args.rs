use clap::{Parser, ValueEnum};
use crate::store::SequencingLayout;

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum Layout {
    #[default]
    Single,
    Paired,
}

impl From<Layout> for SequencingLayout {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Single => SequencingLayout::Single,
            Layout::Paired => SequencingLayout::Paired,
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rnaseq-pipelines", version = "0.1.1")]
pub struct Arguments {

    #[arg(short, long, help = "One of: rnaseq, status, artifacts, links, annotation")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long = "input", num_args = 1.., help = "Input FASTQ files (plain or gzipped); GMT or GFF3 files for links/annotation")]
    pub inputs: Vec<String>,

    #[arg(long, help = "Sample/condition table (CSV or TSV, first column is the sample name)")]
    pub metadata: Option<String>,

    #[arg(long, default_value = "human")]
    pub species: String,

    #[arg(long = "layout", default_value = "single", value_enum)]
    pub layout: Layout,

    #[arg(long, default_value_t = 0.05)]
    pub pvalue_cutoff: f64,

    #[arg(long, help = "Project name; defaults to the first input's sample name")]
    pub name: Option<String>,

    #[arg(long, default_value = "cli")]
    pub session: String,

    #[arg(long, default_value = "pipeline_store.json", help = "JSON file holding projects and artifacts")]
    pub store: String,

    #[arg(short = 'c', long = "config", help = "Pipeline settings (TOML)")]
    pub config: Option<String>,

    #[arg(long, help = "Overrides the thread count from the settings file")]
    pub threads: Option<usize>,

    #[arg(short = 'p', long = "project", help = "Project id for status/artifacts; reruns it with --module rnaseq")]
    pub project: Option<u64>,

    #[arg(long, default_value = "1.0")]
    pub pipeline_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rnaseq_arguments() {
        let args = Arguments::try_parse_from([
            "rnaseq-pipelines",
            "--module",
            "rnaseq",
            "-i",
            "ctrl_R1.fastq.gz",
            "ctrl_R2.fastq.gz",
            "--metadata",
            "samples.csv",
            "--layout",
            "paired",
            "--species",
            "yeast",
        ])
        .unwrap();
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(SequencingLayout::from(args.layout), SequencingLayout::Paired);
        assert_eq!(args.pvalue_cutoff, 0.05);
        assert_eq!(args.store, "pipeline_store.json");
    }

    #[test]
    fn test_module_is_required() {
        assert!(Arguments::try_parse_from(["rnaseq-pipelines", "-i", "a.fastq"]).is_err());
    }
}

/// Functions and structs for building command-line arguments and running the external tools

use std::process::Stdio;
use anyhow::{anyhow, Result};
use log::debug;
use tokio::process::{Child, Command};
use crate::config::defs::{
    PipelineError, DESEQ2_TAG, ENRICHMENT_TAG, FASTQC_TAG, FEATURECOUNTS_TAG, HISAT2_TAG,
    SAMTOOLS_TAG, TRIMMOMATIC_TAG,
};
use crate::utils::streams::{read_child_output_to_vec, spawn_stream_collector, ChildStream};


pub mod fastqc {
    use std::path::Path;

    pub fn arg_generator(input: &Path, out_dir: &Path, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--extract".to_string());
        args_vec.push("--threads".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-o".to_string());
        args_vec.push(out_dir.to_string_lossy().to_string());
        args_vec.push(input.to_string_lossy().to_string());
        args_vec
    }
}

pub mod trimmomatic {
    use std::path::{Path, PathBuf};

    /// Output files for a paired run, in Trimmomatic's positional order.
    pub struct PairedOutputs {
        pub forward_paired: PathBuf,
        pub forward_unpaired: PathBuf,
        pub reverse_paired: PathBuf,
        pub reverse_unpaired: PathBuf,
    }

    pub fn single_arg_generator(input: &Path, output: &Path, threads: usize, steps: &[String]) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("SE".to_string());
        args_vec.push("-threads".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-phred33".to_string());
        args_vec.push(input.to_string_lossy().to_string());
        args_vec.push(output.to_string_lossy().to_string());
        args_vec.extend(steps.iter().cloned());
        args_vec
    }

    pub fn paired_arg_generator(forward: &Path, reverse: &Path, outputs: &PairedOutputs, threads: usize, steps: &[String]) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("PE".to_string());
        args_vec.push("-threads".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-phred33".to_string());
        args_vec.push(forward.to_string_lossy().to_string());
        args_vec.push(reverse.to_string_lossy().to_string());
        for path in [
            &outputs.forward_paired,
            &outputs.forward_unpaired,
            &outputs.reverse_paired,
            &outputs.reverse_unpaired,
        ] {
            args_vec.push(path.to_string_lossy().to_string());
        }
        args_vec.extend(steps.iter().cloned());
        args_vec
    }
}

pub mod hisat2 {
    use std::path::Path;

    pub enum Hisat2Reads<'a> {
        Unpaired(&'a Path),
        Paired(&'a Path, &'a Path),
    }

    pub fn arg_generator(index: &Path, reads: &Hisat2Reads, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-p".to_string());
        args_vec.push(threads.to_string());
        args_vec.push("-x".to_string());
        args_vec.push(index.to_string_lossy().to_string());
        match reads {
            Hisat2Reads::Unpaired(file) => {
                args_vec.push("-U".to_string());
                args_vec.push(file.to_string_lossy().to_string());
            }
            Hisat2Reads::Paired(forward, reverse) => {
                args_vec.push("-1".to_string());
                args_vec.push(forward.to_string_lossy().to_string());
                args_vec.push("-2".to_string());
                args_vec.push(reverse.to_string_lossy().to_string());
            }
        }
        args_vec
    }
}

pub mod samtools {
    use crate::config::defs::SamtoolsSubcommand;

    /// Flags in command-line order; `None` values are bare flags or positionals.
    #[derive(Debug)]
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub subcommand_fields: Vec<(String, Option<String>)>,
    }

    pub fn arg_generator(config: &SamtoolsConfig, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(config.subcommand.as_str().to_string());
        if config.subcommand == SamtoolsSubcommand::Sort {
            args_vec.push("-@".to_string());
            args_vec.push(threads.to_string());
        }
        for (key, value) in config.subcommand_fields.iter() {
            args_vec.push(key.clone());
            if let Some(v) = value {
                args_vec.push(v.clone());
            }
        }
        args_vec
    }
}

pub mod featurecounts {
    use std::path::{Path, PathBuf};

    pub struct FeatureCountsConfig<'a> {
        pub annotation: &'a Path,
        pub feature_type: &'a str,
        pub id_attribute: &'a str,
        pub output: &'a Path,
        pub paired: bool,
        pub bams: &'a [PathBuf],
    }

    pub fn arg_generator(config: &FeatureCountsConfig, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-T".to_string());
        args_vec.push(threads.to_string());
        // featureCounts reads GFF3 through its GTF parser too
        args_vec.push("-F".to_string());
        args_vec.push("GTF".to_string());
        args_vec.push("-t".to_string());
        args_vec.push(config.feature_type.to_string());
        args_vec.push("-g".to_string());
        args_vec.push(config.id_attribute.to_string());
        args_vec.push("-a".to_string());
        args_vec.push(config.annotation.to_string_lossy().to_string());
        args_vec.push("-o".to_string());
        args_vec.push(config.output.to_string_lossy().to_string());
        if config.paired {
            args_vec.push("-p".to_string());
            args_vec.push("--countReadPairs".to_string());
        }
        for bam in config.bams {
            args_vec.push(bam.to_string_lossy().to_string());
        }
        args_vec
    }
}

pub mod deseq2 {
    use std::path::Path;

    pub struct Deseq2Config<'a> {
        pub counts: &'a Path,
        pub metadata: &'a Path,
        pub reference: &'a str,
        pub treatment: &'a str,
        pub output: &'a Path,
    }

    pub fn arg_generator(config: &Deseq2Config, threads: usize) -> Vec<String> {
        vec![
            "--counts".to_string(),
            config.counts.to_string_lossy().to_string(),
            "--metadata".to_string(),
            config.metadata.to_string_lossy().to_string(),
            "--reference".to_string(),
            config.reference.to_string(),
            "--treatment".to_string(),
            config.treatment.to_string(),
            "--output".to_string(),
            config.output.to_string_lossy().to_string(),
            "--threads".to_string(),
            threads.to_string(),
        ]
    }
}

pub mod enrichment {
    use std::path::Path;

    pub fn arg_generator(results: &Path, species: &str, pvalue_cutoff: f64, output: &Path) -> Vec<String> {
        vec![
            "--results".to_string(),
            results.to_string_lossy().to_string(),
            "--species".to_string(),
            species.to_string(),
            "--pvalue-cutoff".to_string(),
            pvalue_cutoff.to_string(),
            "--output".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}


/// Captured output of a finished external tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}


fn spawn_error(tag: &str, program: &str, e: std::io::Error) -> PipelineError {
    PipelineError::ToolExecution {
        tool: tag.to_string(),
        status: None,
        stderr: format!("Failed to spawn {}: {}. Is {} installed?", program, e, tag),
    }
}


/// Runs one external tool to completion with stdout and stderr captured.
///
/// # Arguments
///
/// * `tag` - Tool tag used in errors and logs.
/// * `program` - Executable name or path.
/// * `args` - Full argument list.
///
/// # Returns
/// Captured output, or `ToolExecution` carrying stderr on a non-zero exit.
///
pub async fn run_tool(tag: &str, program: &str, args: &[String]) -> Result<ToolOutput, PipelineError> {
    debug!("Running: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| spawn_error(tag, program, e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(PipelineError::ToolExecution {
            tool: tag.to_string(),
            status: output.status.code(),
            stderr,
        });
    }
    Ok(ToolOutput { stdout, stderr })
}


/// Kills and reaps children left behind when a pipe cannot be completed.
pub async fn abort_children(children: &mut [&mut Child]) {
    for child in children.iter_mut() {
        if let Err(e) = child.kill().await {
            debug!("Could not kill child {:?}: {}", child.id(), e);
        }
    }
}


/// One side of a two-process pipe.
pub struct PipeStage<'a> {
    pub tag: &'a str,
    pub program: &'a str,
    pub args: Vec<String>,
}


/// Runs `upstream | downstream` without an intermediate file. Stderr of both
/// sides is drained concurrently; the upstream failure wins when both fail.
///
/// # Returns
/// Stderr text of (upstream, downstream).
///
pub async fn pipe_tools(upstream: &PipeStage<'_>, downstream: &PipeStage<'_>) -> Result<(String, String), PipelineError> {
    debug!(
        "Running: {} {} | {} {}",
        upstream.program,
        upstream.args.join(" "),
        downstream.program,
        downstream.args.join(" ")
    );

    let mut up_child = Command::new(upstream.program)
        .args(&upstream.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(upstream.tag, upstream.program, e))?;

    let up_err = match spawn_stream_collector(&mut up_child, ChildStream::Stderr) {
        Ok(handle) => handle,
        Err(e) => {
            abort_children(&mut [&mut up_child]).await;
            return Err(e.into());
        }
    };
    let up_stdout: Stdio = match up_child.stdout.take().map(|out| -> std::io::Result<Stdio> { out.try_into() }) {
        Some(Ok(stdio)) => stdio,
        Some(Err(e)) => {
            abort_children(&mut [&mut up_child]).await;
            return Err(anyhow!("Failed to hand {} output to {}: {}", upstream.tag, downstream.tag, e).into());
        }
        None => {
            abort_children(&mut [&mut up_child]).await;
            return Err(anyhow!("{} stdout not piped", upstream.tag).into());
        }
    };

    let mut down_child = match Command::new(downstream.program)
        .args(&downstream.args)
        .stdin(up_stdout)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            abort_children(&mut [&mut up_child]).await;
            return Err(spawn_error(downstream.tag, downstream.program, e));
        }
    };
    let down_err = match spawn_stream_collector(&mut down_child, ChildStream::Stderr) {
        Ok(handle) => handle,
        Err(e) => {
            abort_children(&mut [&mut down_child, &mut up_child]).await;
            return Err(e.into());
        }
    };

    let (up_status, down_status) = tokio::join!(up_child.wait(), down_child.wait());
    let up_status = up_status?;
    let down_status = down_status?;
    let up_stderr = up_err.await.map_err(|e| anyhow!("{} stderr task failed: {}", upstream.tag, e))?;
    let down_stderr = down_err.await.map_err(|e| anyhow!("{} stderr task failed: {}", downstream.tag, e))?;

    if !up_status.success() {
        return Err(PipelineError::ToolExecution {
            tool: upstream.tag.to_string(),
            status: up_status.code(),
            stderr: up_stderr,
        });
    }
    if !down_status.success() {
        return Err(PipelineError::ToolExecution {
            tool: downstream.tag.to_string(),
            status: down_status.code(),
            stderr: down_stderr,
        });
    }
    Ok((up_stderr, down_stderr))
}


fn version_flag(tag: &str) -> Result<&'static str> {
    match tag {
        FASTQC_TAG | HISAT2_TAG | SAMTOOLS_TAG | DESEQ2_TAG | ENRICHMENT_TAG => Ok("--version"),
        TRIMMOMATIC_TAG => Ok("-version"),
        FEATURECOUNTS_TAG => Ok("-v"),
        _ => Err(anyhow!("Unknown tool: {}", tag)),
    }
}


/// Pulls the version token out of a `--version` banner: the last word of the
/// first non-empty line, without a leading `v`.
pub fn parse_version(lines: &[String]) -> Option<String> {
    let first_line = lines.iter().find(|l| !l.trim().is_empty())?;
    let token = first_line.split_whitespace().last()?;
    let version = token.trim_start_matches('v');
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}


pub async fn check_version(tag: &str, program: &str) -> Result<String> {
    let flag = version_flag(tag)?;
    let mut child = Command::new(program)
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", program, e, tag))?;

    let err_task = spawn_stream_collector(&mut child, ChildStream::Stderr)?;
    let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    child.wait().await?;
    let err_lines: Vec<String> = err_task.await?.lines().map(|l| l.to_string()).collect();

    // featureCounts prints its banner on stderr
    parse_version(&lines)
        .or_else(|| parse_version(&err_lines))
        .ok_or_else(|| anyhow!("No output from {} {}", program, flag))
}

// src/utils/streams.rs
use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// Reads a child's stdout or stderr to the end, line by line.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to drain.
///
/// # Returns
/// Vector of lines, without line terminators.
///
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut lines_out = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not piped"))?;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                lines_out.push(line);
            }
        }
        ChildStream::Stderr => {
            let stderr = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not piped"))?;
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                lines_out.push(line);
            }
        }
    }
    Ok(lines_out)
}


/// Drains a child stream on its own task so a chatty tool never blocks on a
/// full pipe while the caller waits on something else.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to drain.
///
/// # Returns
/// Handle resolving to the full (lossy UTF-8) contents.
///
pub fn spawn_stream_collector(child: &mut Child, stream: ChildStream) -> Result<JoinHandle<String>> {
    match stream {
        ChildStream::Stdout => {
            let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not piped"))?;
            Ok(tokio::spawn(collect_lossy(stdout)))
        }
        ChildStream::Stderr => {
            let stderr = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not piped"))?;
            Ok(tokio::spawn(collect_lossy(stderr)))
        }
    }
}


async fn collect_lossy<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        log::warn!("Failed to drain child stream: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

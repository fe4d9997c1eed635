use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

const COMPRESSION_EXTS: &[&'static str] = &["gz", "bz2"];
const STRIPPABLE_EXTS: &[&'static str] = &["gz", "bz2", "fastq", "fq", "bam", "sam", "sorted", "txt"];


pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Extension-derived format tag: `fastq`, `fastq.gz`, `bam`, `csv`...
/// Compression suffixes stay attached to the inner extension.
pub fn format_tag(path: &Path) -> String {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().to_lowercase(),
        None => return "unknown".to_string(),
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 2 {
        return "unknown".to_string();
    }
    let last = parts[parts.len() - 1];
    let inner = if parts.len() > 2 { Some(parts[parts.len() - 2]) } else { None };
    match (COMPRESSION_EXTS.contains(&last), inner) {
        (true, Some(inner)) => format!("{}.{}", canonical_ext(inner), last),
        _ => canonical_ext(last).to_string(),
    }
}

fn canonical_ext(ext: &str) -> &str {
    match ext {
        "fq" => "fastq",
        "fa" | "fna" => "fasta",
        other => other,
    }
}


/// File name with directory and known sequence/alignment extensions removed,
/// e.g. `/x/ctrl_R1.fastq.gz` -> `ctrl_R1`, `/x/ctrl.sorted.bam` -> `ctrl`.
pub fn strip_known_extensions(path: &Path) -> String {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    loop {
        let Some((stem, ext)) = name.rsplit_once('.') else { break };
        if stem.is_empty() || !STRIPPABLE_EXTS.contains(&ext.to_lowercase().as_str()) {
            break;
        }
        name = stem.to_string();
    }
    name
}


/// Size in bytes; directories are summed recursively.
pub fn path_size(path: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(path)?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut total = 0u64;
    for entry in fs::read_dir(path)? {
        total += path_size(&entry?.path())?;
    }
    Ok(total)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_format_tag() {
        assert_eq!(format_tag(Path::new("/a/ctrl1.fastq.gz")), "fastq.gz");
        assert_eq!(format_tag(Path::new("ctrl1.fq")), "fastq");
        assert_eq!(format_tag(Path::new("ctrl1.sorted.bam")), "bam");
        assert_eq!(format_tag(Path::new("x.bam.bai")), "bai");
        assert_eq!(format_tag(Path::new("README")), "unknown");
    }

    #[test]
    fn test_strip_known_extensions() {
        assert_eq!(strip_known_extensions(Path::new("/x/ctrl_R1.fastq.gz")), "ctrl_R1");
        assert_eq!(strip_known_extensions(Path::new("/x/ctrl.sorted.bam")), "ctrl");
        assert_eq!(strip_known_extensions(Path::new("lib.v2.fq")), "lib.v2");
    }

    #[test]
    fn test_gzip_detection_and_sizes() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let plain = dir.path().join("a.fastq");
        fs::write(&plain, b"@r\nA\n+\nI\n")?;
        let gz = dir.path().join("b.fastq.gz");
        let mut f = File::create(&gz)?;
        f.write_all(&[0x1f, 0x8b, 0x08])?;
        let empty = dir.path().join("empty.fastq");
        fs::write(&empty, b"")?;

        assert!(!is_gzipped(&plain)?);
        assert!(is_gzipped(&gz)?);
        assert!(!is_gzipped(&empty)?);
        assert_eq!(path_size(dir.path())?, 9 + 3);
        Ok(())
    }
}

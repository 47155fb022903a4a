//! On-disk artifact formats and writers: per-source summaries, per-directory
//! aggregates, and root documents.

pub mod aggregate;
pub mod summary;

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Extension appended to a source filename to form its summary path.
pub const SUMMARY_EXT: &str = "sum";

/// Extension appended to a summary filename to form its annex path.
pub const ANNEX_EXT: &str = "notes";

/// Fixed filename of the per-directory aggregate artifact.
pub const AGGREGATE_FILENAME: &str = "DIRSUM.md";

/// Sentinel identifying engine-owned aggregate artifacts. The exact bytes
/// are a compatibility commitment; changing them orphans every artifact
/// written by earlier versions.
pub const GENERATOR_MARKER: &str = "<!-- generated by aredoc -->";

/// Canonical sibling path of a source file's summary: `foo.kt` -> `foo.kt.sum`.
pub fn summary_path(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(SUMMARY_EXT);
    source.with_file_name(name)
}

/// Companion annex path of a summary: `foo.kt.sum` -> `foo.kt.sum.notes`.
pub fn annex_path(summary: &Path) -> PathBuf {
    let mut name = summary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(ANNEX_EXT);
    summary.with_file_name(name)
}

/// Inverse of [`summary_path`]: the source a summary artifact belongs to,
/// or `None` if the filename does not carry the summary extension.
pub fn source_for_summary(summary: &Path) -> Option<PathBuf> {
    let name = summary.file_name()?.to_string_lossy();
    let stem = name.strip_suffix(&format!(".{}", SUMMARY_EXT))?;
    Some(summary.with_file_name(stem))
}

/// Aggregate artifact path for a directory.
pub fn aggregate_path(dir: &Path) -> PathBuf {
    dir.join(AGGREGATE_FILENAME)
}

/// True if the first non-empty line of `content` is exactly the generator
/// marker, i.e. the file is engine-owned.
pub fn is_engine_owned(content: &str) -> bool {
    content
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l == GENERATOR_MARKER)
        .unwrap_or(false)
}

/// Write `content` to `path` through a scoped temp file in the same
/// directory, renamed into place on success. Parent directories are created
/// idempotently. A partial write never replaces an existing artifact.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    tmp.persist(path).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Root artifacts are owned by the generator outright: plain overwrite.
pub fn write_root(path: &Path, body: &str) -> Result<()> {
    let mut content = body.trim_end().to_string();
    content.push('\n');
    write_atomic(path, &content)
}

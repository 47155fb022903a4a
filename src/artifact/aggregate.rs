//! Per-directory aggregate artifacts with user-content preservation.
//!
//! Contract:
//! 1. Target missing            -> write fresh.
//! 2. First non-empty line is the generator marker -> overwrite.
//! 3. Anything else is user-authored -> move it to a `.local` sibling,
//!    then write marker + preserved content + horizontal rule + new body.

use std::path::{Path, PathBuf};

use tracing::info;

use super::{is_engine_owned, write_atomic, GENERATOR_MARKER};
use crate::error::{EngineError, Result};

/// Compose the engine-owned form of an aggregate: marker first, then body.
fn compose(body: &str) -> String {
    format!("{}\n\n{}\n", GENERATOR_MARKER, body.trim_end())
}

fn compose_preserving(preserved: &str, body: &str) -> String {
    format!(
        "{}\n\n{}\n---\n{}\n",
        GENERATOR_MARKER,
        preserved.trim_end(),
        body.trim_end()
    )
}

/// Sibling path with the stem suffixed `.local`, disambiguated numerically
/// when that name is already taken: `DIRSUM.md` -> `DIRSUM.local.md`,
/// `DIRSUM.local.1.md`, ...
fn local_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let candidate = path.with_file_name(format!("{}.local.{}", stem, ext));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1;
    loop {
        let candidate = path.with_file_name(format!("{}.local.{}.{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Write an aggregate artifact, preserving user-authored content.
///
/// Returns the `.local` path when existing content was preserved.
pub fn write_aggregate(path: &Path, body: &str) -> Result<Option<PathBuf>> {
    if !path.exists() {
        write_atomic(path, &compose(body))?;
        return Ok(None);
    }

    let existing = std::fs::read_to_string(path)?;
    if is_engine_owned(&existing) {
        write_atomic(path, &compose(body))?;
        return Ok(None);
    }

    // User-authored: keep their bytes intact under a `.local` sibling and
    // carry the content above the regenerated body.
    let local = local_sibling(path);
    std::fs::rename(path, &local).map_err(|e| EngineError::WriteError {
        path: local.clone(),
        source: e,
    })?;
    info!(
        "preserved user-authored {} as {}",
        path.display(),
        local.display()
    );
    write_atomic(path, &compose_preserving(&existing, body))?;
    Ok(Some(local))
}

/// Remove an aggregate artifact iff it carries the generator marker.
/// Returns true when a file was deleted.
pub fn remove_if_engine_owned(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let content = std::fs::read_to_string(path)?;
    if !is_engine_owned(&content) {
        return Ok(false);
    }
    std::fs::remove_file(path)?;
    Ok(true)
}

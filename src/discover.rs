//! Thin source discovery. The engine proper consumes a path list; this
//! walker exists so the binary has one. It deliberately stays small: hidden
//! entries, vendor directories, binary extensions, oversized files, and
//! engine-owned artifacts are skipped, everything else is a source.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::artifact::{AGGREGATE_FILENAME, ANNEX_EXT, SUMMARY_EXT};
use crate::config::{root_filename, DiscoverConfig};
use crate::error::{EngineError, Result};

pub fn discover_sources(project_root: &Path, config: &DiscoverConfig) -> Result<Vec<PathBuf>> {
    if !project_root.is_dir() {
        return Err(EngineError::DiscoveryError(format!(
            "project root is not a directory: {}",
            project_root.display()
        )));
    }

    let mut sources = Vec::new();
    let walker = WalkDir::new(project_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if entry.depth() == 0 {
                return true;
            }
            if name.starts_with('.') {
                return false;
            }
            if entry.file_type().is_dir() && config.vendor_dirs.iter().any(|v| v == &*name) {
                return false;
            }
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Unreadable root is fatal; deeper permission problems are not.
            Err(e) if e.depth() == 0 => {
                return Err(EngineError::DiscoveryError(e.to_string()))
            }
            Err(e) => {
                debug!("skipping unreadable subtree: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if is_engine_artifact(path) {
            continue;
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if config.binary_extensions.iter().any(|b| b == ext) {
                continue;
            }
        }
        match entry.metadata() {
            Ok(meta) if meta.len() > config.max_file_bytes => {
                debug!("skipping oversized file {}", path.display());
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("skipping unreadable entry {}: {}", path.display(), e);
                continue;
            }
        }
        sources.push(path.to_path_buf());
    }

    sources.sort();
    sources.dedup();
    Ok(sources)
}

/// Outputs of the engine itself never count as sources.
fn is_engine_artifact(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name == AGGREGATE_FILENAME {
        return true;
    }
    if name.ends_with(&format!(".{}", SUMMARY_EXT))
        || name.ends_with(&format!(".{}.{}", SUMMARY_EXT, ANNEX_EXT))
    {
        return true;
    }
    // DIRSUM.local.md and friends.
    if name.starts_with("DIRSUM.local.") {
        return true;
    }
    ["claude", "agents", "gemini"]
        .iter()
        .any(|t| root_filename(t) == Some(name.as_ref()))
}

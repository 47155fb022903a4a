//! Incremental-update planner: classify every discovered source against the
//! summary artifacts on disk, detect orphans, and compute which ancestor
//! directories need their aggregates refreshed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::artifact::{self, aggregate, summary};
use crate::error::Result;
use crate::util::checksum;

/// A rename reported by a version-control collaborator.
#[derive(Debug, Clone)]
pub struct RenamePair {
    pub old: PathBuf,
    pub new: PathBuf,
    /// 0.0 ..= 1.0; pairs below [`RENAME_SIMILARITY_MIN`] are ignored.
    pub similarity: f64,
}

const RENAME_SIMILARITY_MIN: f64 = 0.5;

#[derive(Debug, Default)]
pub struct UpdatePlan {
    /// Sources whose summary is missing or stale (added / modified).
    pub to_analyze: Vec<PathBuf>,
    /// Sources whose stored hash matches the current bytes.
    pub to_skip: Vec<PathBuf>,
    /// Summary artifact paths whose source is gone.
    pub orphans: Vec<PathBuf>,
    /// Ancestors of every analyzed/orphaned path, depth descending.
    pub affected_directories: Vec<PathBuf>,
}

impl UpdatePlan {
    pub fn is_noop(&self) -> bool {
        self.to_analyze.is_empty() && self.orphans.is_empty()
    }
}

/// Classify the current discovery result against on-disk artifacts.
pub fn plan_update(
    project_root: &Path,
    discovered: &[PathBuf],
    renames: &[RenamePair],
) -> Result<UpdatePlan> {
    let discovered: BTreeSet<PathBuf> = discovered.iter().cloned().collect();

    let mut to_analyze = Vec::new();
    let mut to_skip = Vec::new();
    for source in &discovered {
        let sum_path = artifact::summary_path(source);
        if !sum_path.exists() {
            to_analyze.push(source.clone());
            continue;
        }
        // An unreadable or unparseable header counts as stale.
        match summary::read_source_hash(&sum_path) {
            Some(stored) if stored == checksum::sha256_file(source)? => {
                to_skip.push(source.clone())
            }
            _ => to_analyze.push(source.clone()),
        }
    }

    let mut orphans: BTreeSet<PathBuf> = scan_orphans(project_root, &discovered);
    for rename in renames {
        if rename.similarity < RENAME_SIMILARITY_MIN {
            continue;
        }
        let old_summary = artifact::summary_path(&rename.old);
        if old_summary.exists() {
            debug!(
                "rename {} -> {} treated as orphan + reanalysis",
                rename.old.display(),
                rename.new.display()
            );
            orphans.insert(old_summary);
        }
    }

    let affected_directories =
        affected_dirs(project_root, to_analyze.iter().chain(orphans.iter()));

    Ok(UpdatePlan {
        to_analyze,
        to_skip,
        orphans: orphans.into_iter().collect(),
        affected_directories,
    })
}

/// Summary artifacts reachable from the root whose source left the
/// discovery set.
fn scan_orphans(project_root: &Path, discovered: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    let mut orphans = BTreeSet::new();
    for entry in WalkDir::new(project_root)
        .into_iter()
        .filter_entry(|e| e.file_name() != crate::config::ARE_DIR)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let Some(source) = artifact::source_for_summary(path) else {
            continue;
        };
        if !discovered.contains(&source) {
            orphans.insert(path.to_path_buf());
        }
    }
    orphans
}

/// Every ancestor directory of every given path, up to and including the
/// project root, sorted depth descending (ties lexicographic).
fn affected_dirs<'a>(
    project_root: &Path,
    paths: impl Iterator<Item = &'a PathBuf>,
) -> Vec<PathBuf> {
    let mut dirs = BTreeSet::new();
    for path in paths {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if !d.starts_with(project_root) {
                break;
            }
            dirs.insert(d.to_path_buf());
            if d == project_root {
                break;
            }
            dir = d.parent();
        }
    }
    let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
    dirs.sort_by(|a, b| {
        let da = a.components().count();
        let db = b.components().count();
        db.cmp(&da).then_with(|| a.cmp(b))
    });
    dirs
}

/// Delete orphaned summaries (and their annexes), then drop the aggregate
/// of any directory left with no discovered sources beneath it — but only
/// when the aggregate carries the generator marker.
pub fn cleanup_orphans(
    plan: &UpdatePlan,
    project_root: &Path,
    discovered: &[PathBuf],
) -> Result<usize> {
    let discovered: BTreeSet<&PathBuf> = discovered.iter().collect();
    let mut removed = 0;
    let mut emptied_dirs: BTreeSet<PathBuf> = BTreeSet::new();

    for orphan in &plan.orphans {
        if orphan.exists() {
            std::fs::remove_file(orphan)?;
            info!("removed orphaned summary {}", orphan.display());
            removed += 1;
        }
        let annex = artifact::annex_path(orphan);
        if annex.exists() {
            std::fs::remove_file(&annex)?;
            removed += 1;
        }
        if let Some(dir) = orphan.parent() {
            if dir.starts_with(project_root) {
                emptied_dirs.insert(dir.to_path_buf());
            }
        }
    }

    for dir in emptied_dirs {
        let still_populated = discovered.iter().any(|s| s.starts_with(&dir));
        if !still_populated && aggregate::remove_if_engine_owned(&artifact::aggregate_path(&dir))? {
            info!("removed aggregate of emptied directory {}", dir.display());
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::summary::{write_summary, SummaryArtifact, SummaryHeader};

    fn write_source_with_summary(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        let artifact = SummaryArtifact {
            header: SummaryHeader::new(checksum::sha256_bytes(content)),
            body: format!("summary of {}", rel),
        };
        write_summary(&artifact::summary_path(&path), &artifact).unwrap();
        path
    }

    #[test]
    fn first_run_analyzes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.kt");
        std::fs::write(&a, "fun main() {}").unwrap();
        let plan = plan_update(dir.path(), &[a.clone()], &[]).unwrap();
        assert_eq!(plan.to_analyze, vec![a]);
        assert!(plan.to_skip.is_empty());
        assert!(plan.orphans.is_empty());
    }

    #[test]
    fn modified_byte_lands_in_to_analyze() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write_source_with_summary(root, "src/a.kt", b"unchanged");
        let b = write_source_with_summary(root, "src/b.kt", b"original");
        std::fs::write(&b, b"originaX").unwrap();

        let plan = plan_update(root, &[a.clone(), b.clone()], &[]).unwrap();
        assert_eq!(plan.to_analyze, vec![b]);
        assert_eq!(plan.to_skip, vec![a]);

        // Affected: src/ and the root, deepest first.
        assert_eq!(
            plan.affected_directories,
            vec![root.join("src"), root.to_path_buf()]
        );
    }

    #[test]
    fn deleted_source_becomes_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write_source_with_summary(root, "src/a.kt", b"keep");
        let b = write_source_with_summary(root, "src/b.kt", b"gone");
        std::fs::remove_file(&b).unwrap();

        let plan = plan_update(root, &[a], &[]).unwrap();
        assert_eq!(plan.orphans, vec![artifact::summary_path(&b)]);
    }

    #[test]
    fn update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let a = write_source_with_summary(root, "src/a.kt", b"stable");
        let plan = plan_update(root, &[a.clone()], &[]).unwrap();
        assert!(plan.is_noop());
        let again = plan_update(root, &[a], &[]).unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn rename_pairs_orphan_the_old_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let old = write_source_with_summary(root, "src/old.kt", b"content");
        std::fs::remove_file(&old).unwrap();
        let new = root.join("src/new.kt");
        std::fs::write(&new, b"content").unwrap();

        let renames = vec![RenamePair {
            old: old.clone(),
            new: new.clone(),
            similarity: 0.9,
        }];
        let plan = plan_update(root, &[new.clone()], &renames).unwrap();
        assert!(plan.orphans.contains(&artifact::summary_path(&old)));
        assert!(plan.to_analyze.contains(&new));
    }

    #[test]
    fn low_similarity_renames_are_ignored_as_renames() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let old = root.join("src/old.kt");
        std::fs::create_dir_all(old.parent().unwrap()).unwrap();
        let renames = vec![RenamePair {
            old,
            new: root.join("src/new.kt"),
            similarity: 0.3,
        }];
        // Nothing on disk for the old path; plan must not invent orphans.
        let plan = plan_update(root, &[], &renames).unwrap();
        assert!(plan.orphans.is_empty());
    }

    #[test]
    fn cleanup_removes_summary_annex_and_emptied_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let gone = write_source_with_summary(root, "old/gone.kt", b"bye");
        std::fs::remove_file(&gone).unwrap();
        let summary = artifact::summary_path(&gone);
        std::fs::write(artifact::annex_path(&summary), "annex").unwrap();
        aggregate::write_aggregate(&artifact::aggregate_path(&root.join("old")), "dir body")
            .unwrap();

        let plan = plan_update(root, &[], &[]).unwrap();
        let removed = cleanup_orphans(&plan, root, &[]).unwrap();
        assert_eq!(removed, 3);
        assert!(!summary.exists());
        assert!(!artifact::aggregate_path(&root.join("old")).exists());
    }

    #[test]
    fn cleanup_spares_user_authored_aggregate_in_emptied_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let gone = write_source_with_summary(root, "old/gone.kt", b"bye");
        std::fs::remove_file(&gone).unwrap();
        let agg = artifact::aggregate_path(&root.join("old"));
        std::fs::write(&agg, "my own notes").unwrap();

        let plan = plan_update(root, &[], &[]).unwrap();
        cleanup_orphans(&plan, root, &[]).unwrap();
        assert!(agg.exists());
    }
}

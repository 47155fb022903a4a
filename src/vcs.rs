//! Optional version-control collaborator: rename pairs for the update
//! planner. Shells out to `git`; any failure (no git, not a repo, no
//! parent commit) degrades to "no renames known".

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::plan::update::RenamePair;

/// Rename pairs visible to git. With `include_uncommitted` the working tree
/// is compared against HEAD, so uncommitted moves count; without it only
/// the renames recorded by the last commit are reported.
pub fn rename_pairs(project_root: &Path, include_uncommitted: bool) -> Vec<RenamePair> {
    let range: &[&str] = if include_uncommitted {
        &["HEAD"]
    } else {
        &["HEAD~1", "HEAD"]
    };
    let output = Command::new("git")
        .arg("-C")
        .arg(project_root)
        .args(["diff", "--name-status", "--find-renames"])
        .args(range)
        .output();
    let output = match output {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            debug!(
                "git diff unavailable: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
            return Vec::new();
        }
        Err(e) => {
            debug!("git not invocable: {}", e);
            return Vec::new();
        }
    };
    parse_name_status(&String::from_utf8_lossy(&output.stdout), project_root)
}

/// Parse `--name-status` output, keeping only rename records:
/// `R<score>\told/path\tnew/path`.
fn parse_name_status(output: &str, project_root: &Path) -> Vec<RenamePair> {
    let mut pairs = Vec::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let Some(status) = fields.next() else { continue };
        let Some(score) = status.strip_prefix('R') else {
            continue;
        };
        let (Some(old), Some(new)) = (fields.next(), fields.next()) else {
            continue;
        };
        let similarity = score.parse::<f64>().map(|s| s / 100.0).unwrap_or(1.0);
        pairs.push(RenamePair {
            old: project_root.join(old),
            new: project_root.join(new),
            similarity,
        });
    }
    pairs
}

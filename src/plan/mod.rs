//! Plan builder: turn a discovery result into the three ordered task
//! sequences of an execution plan — file tasks, directory tasks in
//! deepest-first order, then root tasks.

pub mod update;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::ai::backend::PromptPair;
use crate::artifact;
use crate::config::root_filename;
use crate::error::{EngineError, Result};
use crate::prompt::PromptSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    File,
    Directory,
    Root,
}

/// Immutable unit of work. Prompts carry the task's preamble; the pipeline
/// appends context documents (source bytes, child artifacts) at execution.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub output: PathBuf,
    pub depends_on: BTreeSet<String>,
    pub prompts: PromptPair,
    pub meta: TaskMeta,
}

#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    /// File tasks: the source being summarized.
    pub source: Option<PathBuf>,
    /// Directory tasks: the directory itself.
    pub dir: Option<PathBuf>,
    /// Directory depth below the project root (root = 0).
    pub depth: usize,
    /// Directory tasks: sources directly inside.
    pub child_sources: Vec<PathBuf>,
    /// Directory tasks: immediate subdirectories with tasks of their own.
    pub child_dirs: Vec<PathBuf>,
    /// Root tasks: the assistant-family target name.
    pub root_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub project_root: PathBuf,
    pub file_tasks: Vec<Task>,
    /// Sorted by depth descending, ties lexicographic on path.
    pub directory_tasks: Vec<Task>,
    /// Sequential, last in the plan.
    pub root_tasks: Vec<Task>,
}

impl ExecutionPlan {
    pub fn task_count(&self) -> usize {
        self.file_tasks.len() + self.directory_tasks.len() + self.root_tasks.len()
    }

    pub fn labels(&self) -> Vec<String> {
        self.file_tasks
            .iter()
            .chain(self.directory_tasks.iter())
            .chain(self.root_tasks.iter())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Directory tasks grouped by depth, deepest group first. Groups run
    /// sequentially in Phase 2; tasks inside a group run in parallel.
    pub fn depth_groups(&self) -> Vec<Vec<&Task>> {
        let mut groups: BTreeMap<usize, Vec<&Task>> = BTreeMap::new();
        for task in &self.directory_tasks {
            groups.entry(task.meta.depth).or_default().push(task);
        }
        groups.into_values().rev().collect()
    }

    /// Rough dry-run estimate: one call per task, tokens ~ bytes / 4.
    pub fn estimate(&self) -> PlanEstimate {
        let mut tokens: u64 = 0;
        for task in &self.file_tasks {
            tokens += (task.prompts.system.len() + task.prompts.user.len()) as u64 / 4;
            if let Some(source) = &task.meta.source {
                if let Ok(meta) = std::fs::metadata(source) {
                    tokens += meta.len() / 4;
                }
            }
        }
        for task in self.directory_tasks.iter().chain(self.root_tasks.iter()) {
            tokens += (task.prompts.system.len() + task.prompts.user.len()) as u64 / 4;
        }
        PlanEstimate {
            ai_calls: self.task_count(),
            prompt_tokens: tokens,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanEstimate {
    pub ai_calls: usize,
    pub prompt_tokens: u64,
}

pub fn file_task_id(root: &Path, source: &Path) -> String {
    format!("file:{}", relative_display(root, source))
}

pub fn dir_task_id(root: &Path, dir: &Path) -> String {
    format!("dir:{}", relative_display(root, dir))
}

fn relative_display(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    if rel.as_os_str().is_empty() {
        ".".to_string()
    } else {
        rel.to_string_lossy().into_owned()
    }
}

fn depth_of(root: &Path, dir: &Path) -> usize {
    dir.strip_prefix(root)
        .map(|rel| rel.components().count())
        .unwrap_or(0)
}

/// Build the execution plan for `sources` under `project_root`.
///
/// Duplicates are collapsed. Every ancestor directory up to and including
/// the root gets exactly one directory task; a project with no sources still
/// plans the root directory task and the configured root tasks.
pub fn build_plan(
    project_root: &Path,
    sources: &[PathBuf],
    prompts: &dyn PromptSource,
    root_targets: &[String],
    structure: Option<&str>,
) -> Result<ExecutionPlan> {
    let sources: BTreeSet<PathBuf> = sources.iter().cloned().collect();

    // Directory -> (sources directly inside, immediate subdirectories).
    let mut dirs: BTreeMap<PathBuf, (Vec<PathBuf>, BTreeSet<PathBuf>)> = BTreeMap::new();
    dirs.entry(project_root.to_path_buf()).or_default();

    for source in &sources {
        let parent = source.parent().ok_or_else(|| {
            EngineError::DiscoveryError(format!("source has no parent: {}", source.display()))
        })?;
        if !parent.starts_with(project_root) {
            return Err(EngineError::DiscoveryError(format!(
                "source outside project root: {}",
                source.display()
            )));
        }
        dirs.entry(parent.to_path_buf())
            .or_default()
            .0
            .push(source.clone());

        // Materialize the ancestor chain up to the root.
        let mut dir = parent.to_path_buf();
        while dir != project_root {
            let up = dir.parent().expect("under project root").to_path_buf();
            dirs.entry(up.clone()).or_default().1.insert(dir.clone());
            dirs.entry(dir).or_default();
            dir = up;
        }
    }

    let file_tasks: Vec<Task> = sources
        .iter()
        .map(|source| {
            let rel = relative_display(project_root, source);
            Task {
                id: file_task_id(project_root, source),
                kind: TaskKind::File,
                output: artifact::summary_path(source),
                depends_on: BTreeSet::new(),
                prompts: prompts.file_prompts(&rel, structure),
                meta: TaskMeta {
                    source: Some(source.clone()),
                    ..Default::default()
                },
            }
        })
        .collect();

    let mut directory_tasks: Vec<Task> = dirs
        .iter()
        .map(|(dir, (files, subdirs))| {
            let mut depends_on: BTreeSet<String> = files
                .iter()
                .map(|f| file_task_id(project_root, f))
                .collect();
            depends_on.extend(subdirs.iter().map(|d| dir_task_id(project_root, d)));
            let rel = relative_display(project_root, dir);
            Task {
                id: dir_task_id(project_root, dir),
                kind: TaskKind::Directory,
                output: artifact::aggregate_path(dir),
                depends_on,
                prompts: prompts.directory_prompts(&rel, structure),
                meta: TaskMeta {
                    dir: Some(dir.clone()),
                    depth: depth_of(project_root, dir),
                    child_sources: files.clone(),
                    child_dirs: subdirs.iter().cloned().collect(),
                    ..Default::default()
                },
            }
        })
        .collect();

    // Deepest first; the depth-descending order is a topological order of
    // the directory DAG. Ties break lexicographically for determinism.
    directory_tasks.sort_by(|a, b| {
        b.meta
            .depth
            .cmp(&a.meta.depth)
            .then_with(|| a.meta.dir.cmp(&b.meta.dir))
    });

    let all_dir_ids: BTreeSet<String> = directory_tasks.iter().map(|t| t.id.clone()).collect();
    let root_tasks: Vec<Task> = root_targets
        .iter()
        .map(|target| {
            let filename = root_filename(target).ok_or_else(|| {
                EngineError::ConfigError(format!("unknown root target: {}", target))
            })?;
            Ok(Task {
                id: format!("root:{}", target),
                kind: TaskKind::Root,
                output: project_root.join(filename),
                depends_on: all_dir_ids.clone(),
                prompts: prompts.root_prompts(target, structure),
                meta: TaskMeta {
                    root_target: Some(target.clone()),
                    ..Default::default()
                },
            })
        })
        .collect::<Result<_>>()?;

    Ok(ExecutionPlan {
        project_root: project_root.to_path_buf(),
        file_tasks,
        directory_tasks,
        root_tasks,
    })
}

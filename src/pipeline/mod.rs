//! Pipeline runner: composes discovery, plan, pool, AI driver and writers
//! into the three-phase execution and produces the run summary.
//!
//! Phase 1 analyzes files through the pool. Phase 2 aggregates directories
//! in depth groups, deepest first, each group draining before the next
//! starts. Phase 3 synthesizes root documents sequentially. Finalizers
//! (telemetry, trace, validators) always run.

pub mod validate;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::ai::backend::{Backend, PromptPair};
use crate::ai::AiDriver;
use crate::artifact::{self, aggregate, summary, summary::SummaryArtifact};
use crate::config::{AreLayout, GlobalConfig};
use crate::discover::discover_sources;
use crate::error::{EngineError, Result};
use crate::observe::progress::ProgressEmitter;
use crate::observe::trace::{TraceEvent, Tracer};
use crate::observe::tracker::PlanTracker;
use crate::plan::{self, ExecutionPlan, Task};
use crate::plan::update::{cleanup_orphans, plan_update, RenamePair, UpdatePlan};
use crate::pool::{run_pool, PoolOptions, Settlement};
use crate::prompt::PromptSource;
use crate::telemetry::{
    self, now_rfc3339, sum_totals, FailureRecord, FileRef, RunLog, RunSummary, TelemetrySink,
};
use crate::util::checksum;
use self::validate::{validate_artifacts, ValidationTarget};

/// Prompt context never includes more than this many structure lines.
const STRUCTURE_LINE_CAP: usize = 400;

pub struct Engine {
    config: GlobalConfig,
    project_root: PathBuf,
    layout: AreLayout,
    backend: Arc<dyn Backend>,
    prompts: Arc<dyn PromptSource>,
    tracer: Arc<dyn Tracer>,
}

impl Engine {
    pub fn new(
        config: GlobalConfig,
        project_root: PathBuf,
        backend: Arc<dyn Backend>,
        prompts: Arc<dyn PromptSource>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let layout = AreLayout::new(&project_root);
        Self {
            config,
            project_root,
            layout,
            backend,
            prompts,
            tracer,
        }
    }

    pub fn layout(&self) -> &AreLayout {
        &self.layout
    }

    fn discover(&self) -> Result<Vec<PathBuf>> {
        self.tracer.emit(TraceEvent::DiscoveryStart {
            root: self.project_root.display().to_string(),
        });
        let sources = discover_sources(&self.project_root, &self.config.discover)?;
        self.tracer.emit(TraceEvent::DiscoveryEnd {
            files: sources.len(),
        });
        Ok(sources)
    }

    fn build_plan(&self, sources: &[PathBuf]) -> Result<ExecutionPlan> {
        let structure = structure_text(&self.project_root, sources);
        let plan = plan::build_plan(
            &self.project_root,
            sources,
            self.prompts.as_ref(),
            &self.config.output.root_targets,
            Some(&structure),
        )?;
        self.tracer.emit(TraceEvent::PlanCreated {
            file_tasks: plan.file_tasks.len(),
            directory_tasks: plan.directory_tasks.len(),
            root_tasks: plan.root_tasks.len(),
        });
        Ok(plan)
    }

    /// Plan without executing, for `--dry-run`.
    pub fn plan_generate(&self) -> Result<ExecutionPlan> {
        let sources = self.discover()?;
        self.build_plan(&sources)
    }

    /// Update classification without executing, for `--dry-run`.
    pub fn plan_update_only(&self, renames: &[RenamePair]) -> Result<UpdatePlan> {
        let sources = self.discover()?;
        plan_update(&self.project_root, &sources, renames)
    }

    /// Full three-phase generation over everything discovered.
    pub fn generate(&self) -> Result<RunSummary> {
        let sources = self.discover()?;
        let plan = self.build_plan(&sources)?;
        self.execute(plan, None, None, 0, "generate")
    }

    /// Incremental run: Phase 1 for changed sources, Phase 2 restricted to
    /// affected directories, Phase 3 for every root target.
    pub fn update(&self, renames: &[RenamePair]) -> Result<RunSummary> {
        let sources = self.discover()?;
        let update = plan_update(&self.project_root, &sources, renames)?;
        cleanup_orphans(&update, &self.project_root, &sources)?;
        info!(
            "update plan: {} to analyze, {} unchanged, {} orphans, {} affected directories",
            update.to_analyze.len(),
            update.to_skip.len(),
            update.orphans.len(),
            update.affected_directories.len()
        );

        if update.is_noop() {
            // Nothing changed; artifacts are already consistent.
            return Ok(RunSummary {
                files_skipped: update.to_skip.len(),
                ..Default::default()
            });
        }

        let plan = self.build_plan(&sources)?;
        let file_filter: BTreeSet<PathBuf> = update.to_analyze.iter().cloned().collect();
        let dir_filter: BTreeSet<PathBuf> =
            update.affected_directories.iter().cloned().collect();
        self.execute(
            plan,
            Some(file_filter),
            Some(dir_filter),
            update.to_skip.len(),
            "update",
        )
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    fn execute(
        &self,
        plan: ExecutionPlan,
        file_filter: Option<BTreeSet<PathBuf>>,
        dir_filter: Option<BTreeSet<PathBuf>>,
        files_skipped: usize,
        command: &'static str,
    ) -> Result<RunSummary> {
        let begin = Instant::now();
        let started = now_rfc3339();
        let concurrency = self.config.effective_concurrency();
        let fail_fast = self.config.engine.fail_fast;

        let telemetry_sink = Arc::new(TelemetrySink::new());
        let driver = AiDriver::new(
            self.backend.clone(),
            self.config.ai.clone(),
            telemetry_sink.clone(),
            self.tracer.clone(),
        );

        let file_tasks: Vec<&Task> = plan
            .file_tasks
            .iter()
            .filter(|t| match (&file_filter, &t.meta.source) {
                (Some(set), Some(source)) => set.contains(source),
                _ => true,
            })
            .collect();
        let dir_groups: Vec<Vec<&Task>> = plan
            .depth_groups()
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .filter(|t| match (&dir_filter, &t.meta.dir) {
                        (Some(set), Some(dir)) => set.contains(dir),
                        _ => true,
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect();
        let root_tasks: Vec<&Task> = plan.root_tasks.iter().collect();

        let total_tasks = file_tasks.len()
            + dir_groups.iter().map(|g| g.len()).sum::<usize>()
            + root_tasks.len();

        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let progress = ProgressEmitter::create(
            &self.layout.progress_dir().join(format!("progress-{}.log", stamp)),
            total_tasks,
            concurrency,
        )?;
        let planned_labels: Vec<String> = file_tasks
            .iter()
            .map(|t| t.id.clone())
            .chain(dir_groups.iter().flatten().map(|t| t.id.clone()))
            .chain(root_tasks.iter().map(|t| t.id.clone()))
            .collect();
        let tracker = PlanTracker::create(self.layout.plan_file(), planned_labels)?;

        // Both caches fill before the first artifact is overwritten and are
        // read-only afterwards.
        let mut source_cache: HashMap<PathBuf, Vec<u8>> = HashMap::new();
        let mut old_artifacts: HashMap<PathBuf, SummaryArtifact> = HashMap::new();
        for task in &file_tasks {
            let Some(source) = &task.meta.source else {
                continue;
            };
            match std::fs::read(source) {
                Ok(bytes) => {
                    source_cache.insert(source.clone(), bytes);
                }
                Err(e) => warn!("cannot preload {}: {}", source.display(), e),
            }
            if task.output.exists() {
                if let Ok(old) = summary::read_summary(&task.output) {
                    old_artifacts.insert(source.clone(), old);
                }
            }
        }

        let failures: Mutex<Vec<FailureRecord>> = Mutex::new(Vec::new());
        let observe = |settlement: &Settlement<()>| match &settlement.result {
            Ok(()) => {
                progress.task_succeeded(&settlement.label, settlement.duration_ms);
                tracker.mark_done(&settlement.label);
            }
            Err(e) => {
                progress.task_failed(
                    &settlement.label,
                    e.kind(),
                    &e.to_string(),
                    settlement.duration_ms,
                );
                failures.lock().unwrap().push(FailureRecord {
                    label: settlement.label.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        };

        // --- Phase 1: file analysis -------------------------------------

        let phase1_labels: Vec<String> = file_tasks.iter().map(|t| t.id.clone()).collect();
        let phase1_closures: Vec<_> = file_tasks
            .iter()
            .map(|task| {
                let driver = &driver;
                let source_cache = &source_cache;
                let old_artifacts = &old_artifacts;
                let progress = &progress;
                move || -> Result<()> {
                    progress.task_started(&task.id);
                    let source = task.meta.source.as_ref().expect("file task has source");
                    let bytes = match source_cache.get(source) {
                        Some(bytes) => bytes.clone(),
                        None => std::fs::read(source)?,
                    };
                    let hash = checksum::sha256_bytes(&bytes);

                    let mut user = task.prompts.user.clone();
                    user.push_str("\n```\n");
                    user.push_str(&String::from_utf8_lossy(&bytes));
                    user.push_str("\n```\n");
                    let pair = PromptPair {
                        system: task.prompts.system.clone(),
                        user,
                    };
                    let files = vec![FileRef {
                        path: source.clone(),
                        bytes: bytes.len() as u64,
                    }];
                    let response = driver.call(&pair, &task.id, files)?;

                    let generated = SummaryArtifact::from_generated_text(hash, &response.text);
                    if let Some(old) = old_artifacts.get(source) {
                        if old.header.source_hash == generated.header.source_hash {
                            debug!("{}: source unchanged, summary refreshed", task.id);
                        }
                    }
                    summary::write_summary(&task.output, &generated)?;
                    Ok(())
                }
            })
            .collect();

        let phase1 = run_pool(
            phase1_closures,
            &PoolOptions {
                concurrency,
                fail_fast,
                phase: "file-analysis",
                labels: &phase1_labels,
                tracer: self.tracer.as_ref(),
            },
            &|_, s| observe(s),
        );
        let files_processed = phase1.iter().filter(|s| s.result.is_ok()).count();
        let files_failed = phase1.len() - files_processed;

        let mut validation: Vec<ValidationTarget> = file_tasks
            .iter()
            .zip(phase1.iter())
            .filter(|(_, s)| s.result.is_ok())
            .map(|(task, _)| ValidationTarget::Summary {
                artifact: task.output.clone(),
                source: task.meta.source.clone().expect("file task has source"),
            })
            .collect();

        let abort_pipeline = fail_fast && files_failed > 0;
        let mut other_failed = 0;

        // --- Phase 2: directory aggregation, deepest group first --------

        if !abort_pipeline {
            for group in &dir_groups {
                let group_labels: Vec<String> = group.iter().map(|t| t.id.clone()).collect();
                let group_closures: Vec<_> = group
                    .iter()
                    .map(|task| {
                        let driver = &driver;
                        let progress = &progress;
                        let project_root = &self.project_root;
                        move || -> Result<()> {
                            progress.task_started(&task.id);
                            run_directory_task(task, driver, project_root)
                        }
                    })
                    .collect();

                let settled = run_pool(
                    group_closures,
                    &PoolOptions {
                        concurrency,
                        fail_fast,
                        phase: "directory-aggregation",
                        labels: &group_labels,
                        tracer: self.tracer.as_ref(),
                    },
                    &|_, s| observe(s),
                );
                let group_failed = settled.iter().filter(|s| s.result.is_err()).count();
                other_failed += group_failed;
                validation.extend(
                    group
                        .iter()
                        .zip(settled.iter())
                        .filter(|(_, s)| s.result.is_ok())
                        .map(|(task, _)| ValidationTarget::Aggregate {
                            artifact: task.output.clone(),
                        }),
                );
                if fail_fast && group_failed > 0 {
                    break;
                }
            }
        }

        // --- Phase 3: root synthesis, sequential ------------------------

        let phase2_ok = other_failed == 0;
        if !abort_pipeline && (!fail_fast || phase2_ok) {
            let root_labels: Vec<String> = root_tasks.iter().map(|t| t.id.clone()).collect();
            let all_dir_tasks = &plan.directory_tasks;
            let root_closures: Vec<_> = root_tasks
                .iter()
                .map(|task| {
                    let driver = &driver;
                    let progress = &progress;
                    let project_root = &self.project_root;
                    move || -> Result<()> {
                        progress.task_started(&task.id);
                        run_root_task(task, all_dir_tasks, driver, project_root)
                    }
                })
                .collect();

            let settled = run_pool(
                root_closures,
                &PoolOptions {
                    concurrency: 1,
                    fail_fast,
                    phase: "root-synthesis",
                    labels: &root_labels,
                    tracer: self.tracer.as_ref(),
                },
                &|_, s| observe(s),
            );
            other_failed += settled.iter().filter(|s| s.result.is_err()).count();
            validation.extend(
                root_tasks
                    .iter()
                    .zip(settled.iter())
                    .filter(|(_, s)| s.result.is_ok())
                    .map(|(task, _)| ValidationTarget::Root {
                        artifact: task.output.clone(),
                    }),
            );
        }

        // --- Finalization: always runs ----------------------------------

        let validator_findings = validate_artifacts(validation, self.tracer.as_ref());

        let entries = telemetry_sink.snapshot();
        let totals = sum_totals(&entries);
        let retries: u64 = entries.iter().map(|e| e.retries as u64).sum();
        let unique_files_read = entries
            .iter()
            .flat_map(|e| e.files.iter().map(|f| &f.path))
            .collect::<BTreeSet<_>>()
            .len();
        let duration_ms = begin.elapsed().as_millis() as u64;

        let run_log = RunLog {
            command: command.to_string(),
            started,
            ended: now_rfc3339(),
            duration_ms,
            files_processed,
            files_failed,
            files_skipped,
            totals: totals.clone(),
            entries: entries.clone(),
        };
        match telemetry::write_run_log(
            &self.layout,
            &run_log,
            self.config.output.run_log_retention,
        ) {
            Ok(path) => debug!("run log written to {}", path.display()),
            Err(e) => warn!("failed to persist run log: {}", e),
        }
        telemetry::prune_dir(
            &self.layout.trace_dir(),
            "trace-",
            self.config.output.trace_retention,
        );

        progress.finalize();
        tracker.finalize();
        self.tracer.finalize();

        Ok(RunSummary {
            files_processed,
            files_failed,
            files_skipped,
            tasks_failed_other: other_failed,
            ai_calls: entries.len(),
            totals,
            duration_ms,
            retries,
            unique_files_read,
            failures: failures.into_inner().unwrap(),
            validator_findings,
        })
    }
}

/// Remove engine-owned artifacts from a tree; user-authored files are
/// untouched. Needs no AI backend, so it lives outside [`Engine`].
pub fn clean_tree(project_root: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in WalkDir::new(project_root)
        .into_iter()
        .filter_entry(|e| e.file_name() != crate::config::ARE_DIR)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if artifact::source_for_summary(path).is_some() && summary::read_summary(path).is_ok() {
            std::fs::remove_file(path)?;
            removed += 1;
            let annex = artifact::annex_path(path);
            if annex.exists() {
                std::fs::remove_file(&annex)?;
                removed += 1;
            }
        } else if path.file_name().map(|n| n == artifact::AGGREGATE_FILENAME) == Some(true)
            && aggregate::remove_if_engine_owned(path)?
        {
            removed += 1;
        }
    }
    info!("clean removed {} artifacts", removed);
    Ok(removed)
}

/// Aggregate one directory from its child artifacts.
fn run_directory_task(task: &Task, driver: &AiDriver, project_root: &Path) -> Result<()> {
    // Every declared file dependency must have produced its artifact.
    let missing: Vec<PathBuf> = task
        .meta
        .child_sources
        .iter()
        .map(|s| artifact::summary_path(s))
        .filter(|p| !p.exists())
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::DependencyMissing {
            task: task.id.clone(),
            missing,
        });
    }

    let mut user = task.prompts.user.clone();
    let mut files = Vec::new();
    for source in &task.meta.child_sources {
        let path = artifact::summary_path(source);
        let child = summary::read_summary(&path)?;
        let rel = source
            .strip_prefix(project_root)
            .unwrap_or(source)
            .display()
            .to_string();
        user.push_str(&format!("\n## {}\n{}\n", rel, child.body));
        files.push(FileRef {
            path: path.clone(),
            bytes: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
        });
    }
    for subdir in &task.meta.child_dirs {
        let path = artifact::aggregate_path(subdir);
        if !path.exists() {
            // Subdirectory aggregate outside this update's affected set.
            continue;
        }
        let body = read_aggregate_body(&path)?;
        let rel = subdir
            .strip_prefix(project_root)
            .unwrap_or(subdir)
            .display()
            .to_string();
        user.push_str(&format!("\n## {}/\n{}\n", rel, body));
        files.push(FileRef {
            path: path.clone(),
            bytes: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
        });
    }

    let pair = PromptPair {
        system: task.prompts.system.clone(),
        user,
    };
    let response = driver.call(&pair, &task.id, files)?;
    aggregate::write_aggregate(&task.output, &response.text)?;
    Ok(())
}

/// Synthesize one root document from the aggregate hierarchy.
fn run_root_task(
    task: &Task,
    directory_tasks: &[Task],
    driver: &AiDriver,
    project_root: &Path,
) -> Result<()> {
    let mut user = task.prompts.user.clone();
    let mut files = Vec::new();
    // Shallowest first reads naturally for an overview.
    let mut ordered: Vec<&Task> = directory_tasks.iter().collect();
    ordered.sort_by_key(|t| t.meta.depth);
    for dir_task in ordered {
        let path = &dir_task.output;
        if !path.exists() {
            continue;
        }
        let body = read_aggregate_body(path)?;
        let rel = dir_task
            .meta
            .dir
            .as_ref()
            .and_then(|d| d.strip_prefix(project_root).ok())
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        user.push_str(&format!("\n## {}/\n{}\n", rel, body));
        files.push(FileRef {
            path: path.clone(),
            bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        });
    }

    let pair = PromptPair {
        system: task.prompts.system.clone(),
        user,
    };
    let response = driver.call(&pair, &task.id, files)?;
    artifact::write_root(&task.output, &response.text)?;
    Ok(())
}

/// Aggregate body without the marker line.
fn read_aggregate_body(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| *l != artifact::GENERATOR_MARKER)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string())
}

/// Flat relative listing fed into prompts as project context.
fn structure_text(project_root: &Path, sources: &[PathBuf]) -> String {
    let mut lines: Vec<String> = sources
        .iter()
        .take(STRUCTURE_LINE_CAP)
        .map(|s| {
            s.strip_prefix(project_root)
                .unwrap_or(s)
                .display()
                .to_string()
        })
        .collect();
    if sources.len() > STRUCTURE_LINE_CAP {
        lines.push(format!("... and {} more", sources.len() - STRUCTURE_LINE_CAP));
    }
    lines.join("\n")
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aredoc::ai::backend;
use aredoc::config::{AreLayout, GlobalConfig};
use aredoc::discover::discover_sources;
use aredoc::observe::trace::{FileTracer, NullTracer, TraceEvent, Tracer};
use aredoc::pipeline::{clean_tree, Engine};
use aredoc::plan;
use aredoc::plan::update::plan_update;
use aredoc::prompt::DefaultPrompts;
use aredoc::telemetry;
use aredoc::vcs;

#[derive(Parser)]
#[command(name = "aredoc", about = "AI-friendly codebase documentation generator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (bypasses layered lookup)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate documentation for the whole source tree
    Generate {
        /// Project root (defaults to the current directory)
        root: Option<PathBuf>,

        /// Worker count, 1-20 (default: auto-sized)
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,

        /// Stop dispatching new tasks after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Write an NDJSON lifecycle trace under .are/trace/
        #[arg(long)]
        trace: bool,

        /// Print the plan and estimates without invoking the AI
        #[arg(long)]
        dry_run: bool,
    },
    /// Refresh documentation for sources that changed since the last run
    Update {
        /// Project root (defaults to the current directory)
        root: Option<PathBuf>,

        /// Consider uncommitted renames when consulting version control
        #[arg(long)]
        include_uncommitted: bool,

        /// Write an NDJSON lifecycle trace under .are/trace/
        #[arg(long)]
        trace: bool,

        /// Print the update classification without invoking the AI
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove engine-owned artifacts, leaving user-authored files alone
    Clean {
        /// Project root (defaults to the current directory)
        root: Option<PathBuf>,
    },
    /// Tabulate persisted run logs
    Summary {
        /// Project root (defaults to the current directory)
        root: Option<PathBuf>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            // Startup failures: configuration, discovery, no backend.
            eprintln!("error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Generate {
            root,
            concurrency,
            fail_fast,
            trace,
            dry_run,
        } => {
            let project_root = resolve_root(root)?;
            let mut config = load_config(&cli.config, &project_root)?;
            if let Some(n) = concurrency {
                config.engine.concurrency = n;
            }
            config.engine.fail_fast |= fail_fast;
            config.engine.trace |= trace;
            config.validate().context("invalid configuration")?;

            if dry_run {
                let sources = discover_sources(&project_root, &config.discover)?;
                let plan = plan::build_plan(
                    &project_root,
                    &sources,
                    &DefaultPrompts,
                    &config.output.root_targets,
                    None,
                )?;
                print_plan(&plan);
                return Ok(0);
            }

            let backend = backend::select(&config.ai.backend)?;
            let tracer = make_tracer(&config, &project_root)?;
            tracer.emit(TraceEvent::ConfigLoaded {
                concurrency: config.effective_concurrency(),
                backend: backend.name().to_string(),
            });
            let engine = Engine::new(
                config,
                project_root,
                backend,
                Arc::new(DefaultPrompts),
                tracer,
            );
            let summary = engine.generate()?;
            summary.print();
            Ok(summary.exit_class())
        }

        Commands::Update {
            root,
            include_uncommitted,
            trace,
            dry_run,
        } => {
            let project_root = resolve_root(root)?;
            let mut config = load_config(&cli.config, &project_root)?;
            config.engine.trace |= trace;
            config.validate().context("invalid configuration")?;

            let renames = vcs::rename_pairs(&project_root, include_uncommitted);

            if dry_run {
                let sources = discover_sources(&project_root, &config.discover)?;
                let update = plan_update(&project_root, &sources, &renames)?;
                println!(
                    "would analyze {} file(s), skip {} (unchanged), remove {} orphan(s), refresh {} directorie(s)",
                    update.to_analyze.len(),
                    update.to_skip.len(),
                    update.orphans.len(),
                    update.affected_directories.len()
                );
                for path in &update.to_analyze {
                    println!("  analyze {}", path.display());
                }
                for path in &update.orphans {
                    println!("  orphan  {}", path.display());
                }
                return Ok(0);
            }

            let backend = backend::select(&config.ai.backend)?;
            let tracer = make_tracer(&config, &project_root)?;
            tracer.emit(TraceEvent::ConfigLoaded {
                concurrency: config.effective_concurrency(),
                backend: backend.name().to_string(),
            });
            let engine = Engine::new(
                config,
                project_root,
                backend,
                Arc::new(DefaultPrompts),
                tracer,
            );
            let summary = engine.update(&renames)?;
            summary.print();
            Ok(summary.exit_class())
        }

        Commands::Clean { root } => {
            let project_root = resolve_root(root)?;
            match clean_tree(&project_root) {
                Ok(removed) => {
                    println!("removed {} artifact(s)", removed);
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("clean failed: {}", e);
                    Ok(1)
                }
            }
        }

        Commands::Summary { root, json } => {
            let project_root = resolve_root(root)?;
            telemetry::print_run_logs(&AreLayout::new(&project_root), json)?;
            Ok(0)
        }
    }
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    root.canonicalize()
        .with_context(|| format!("project root not accessible: {}", root.display()))
}

fn load_config(explicit: &Option<PathBuf>, project_root: &PathBuf) -> Result<GlobalConfig> {
    GlobalConfig::load(explicit.as_deref(), project_root).context("failed to load config")
}

fn make_tracer(config: &GlobalConfig, project_root: &PathBuf) -> Result<Arc<dyn Tracer>> {
    if !config.engine.trace {
        return Ok(Arc::new(NullTracer));
    }
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let path = AreLayout::new(project_root)
        .trace_dir()
        .join(format!("trace-{}-{}.ndjson", stamp, std::process::id()));
    let tracer = FileTracer::create(&path)
        .with_context(|| format!("cannot open trace file {}", path.display()))?;
    Ok(Arc::new(tracer))
}

fn print_plan(plan: &plan::ExecutionPlan) {
    let estimate = plan.estimate();
    println!(
        "plan: {} file task(s), {} directory task(s), {} root task(s)",
        plan.file_tasks.len(),
        plan.directory_tasks.len(),
        plan.root_tasks.len()
    );
    println!(
        "estimated {} AI call(s), ~{} prompt tokens",
        estimate.ai_calls, estimate.prompt_tokens
    );
    for task in &plan.file_tasks {
        println!("  {}", task.id);
    }
    for task in &plan.directory_tasks {
        println!("  {}", task.id);
    }
    for task in &plan.root_tasks {
        println!("  {}", task.id);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aredoc::ai::backend::{AiResponse, Backend, ChildCaps, ClaudeBackend, PromptPair};
use aredoc::artifact::{self, summary, GENERATOR_MARKER};
use aredoc::config::GlobalConfig;
use aredoc::error::Result as EngineResult;
use aredoc::observe::trace::{FileTracer, NullTracer, Tracer};
use aredoc::pipeline::Engine;
use aredoc::prompt::DefaultPrompts;
use aredoc::util::checksum;

/// Stands in for a real AI CLI: consumes the prompt on stdin and answers
/// with Claude-shaped JSON. Prompts containing "poison" fail like a
/// misbehaving subprocess would.
struct StubBackend;

const STUB_SCRIPT: &str = r#"input=$(cat)
case "$input" in
  *poison*) echo 'stub backend refused this prompt' >&2; exit 1;;
esac
printf '%s\n' '{"result":"PURPOSE: stub purpose.\n\nStub body.","usage":{"input_tokens":3,"output_tokens":2,"cache_read_input_tokens":1,"cache_creation_input_tokens":0},"modelUsage":{"stub-model":{}}}'
"#;

impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }
    fn program(&self) -> String {
        "/bin/sh".to_string()
    }
    fn build_args(&self, _prompts: &PromptPair) -> Vec<String> {
        vec!["-c".to_string(), STUB_SCRIPT.to_string()]
    }
    fn env_overrides(&self, _caps: &ChildCaps) -> Vec<(String, String)> {
        Vec::new()
    }
    fn parse_response(&self, stdout: &str) -> EngineResult<AiResponse> {
        ClaudeBackend.parse_response(stdout)
    }
    fn install_hint(&self) -> &'static str {
        "stub: ships with the tests"
    }
}

fn test_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.engine.concurrency = 2;
    config.ai.timeout_ms = 30_000;
    config
}

fn engine_for(root: &Path) -> Engine {
    engine_with_tracer(root, Arc::new(NullTracer))
}

fn engine_with_tracer(root: &Path, tracer: Arc<dyn Tracer>) -> Engine {
    Engine::new(
        test_config(),
        root.to_path_buf(),
        Arc::new(StubBackend),
        Arc::new(DefaultPrompts),
        tracer,
    )
}

fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    for (rel, content) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
    }
    (dir, root)
}

#[test]
fn two_files_one_directory_full_run() {
    let (_guard, root) = project(&[("src/a.kt", "fun a() {}"), ("src/b.kt", "fun b() {}")]);
    let summary_result = engine_for(&root).generate().unwrap();

    assert_eq!(summary_result.files_processed, 2);
    assert_eq!(summary_result.files_failed, 0);
    assert_eq!(summary_result.exit_class(), 0);
    assert!(summary_result.ai_calls >= 2);
    assert!(
        summary_result.validator_findings.is_empty(),
        "findings: {:?}",
        summary_result.validator_findings
    );

    // Phase 1 artifacts with the hash round-trip invariant.
    for rel in ["src/a.kt", "src/b.kt"] {
        let source = root.join(rel);
        let artifact = summary::read_summary(&artifact::summary_path(&source)).unwrap();
        assert_eq!(
            artifact.header.source_hash,
            checksum::sha256_file(&source).unwrap()
        );
        assert_eq!(artifact.header.purpose.as_deref(), Some("stub purpose."));
        assert_eq!(artifact.body, "Stub body.");
    }

    // Phase 2 aggregates carry the marker, in src/ and at the root.
    for dir in [root.join("src"), root.clone()] {
        let content = std::fs::read_to_string(artifact::aggregate_path(&dir)).unwrap();
        assert!(content.starts_with(GENERATOR_MARKER));
    }

    // Phase 3 root documents, one per default target.
    assert!(root.join("CLAUDE.md").exists());
    assert!(root.join("AGENTS.md").exists());
}

#[test]
fn empty_project_produces_root_artifacts() {
    let (_guard, root) = project(&[]);
    let summary_result = engine_for(&root).generate().unwrap();

    assert_eq!(summary_result.files_processed, 0);
    assert_eq!(summary_result.exit_class(), 0);
    assert!(artifact::aggregate_path(&root).exists());
    assert!(root.join("CLAUDE.md").exists());
}

#[test]
fn user_authored_aggregate_is_preserved_byte_for_byte() {
    let (_guard, root) = project(&[("src/a.kt", "fun a() {}")]);
    let user_bytes = "# Hand-written notes\n\nDo not lose these.\n";
    std::fs::write(artifact::aggregate_path(&root.join("src")), user_bytes).unwrap();

    engine_for(&root).generate().unwrap();

    let local = root.join("src/DIRSUM.local.md");
    assert_eq!(std::fs::read_to_string(&local).unwrap(), user_bytes);

    let merged = std::fs::read_to_string(artifact::aggregate_path(&root.join("src"))).unwrap();
    assert!(merged.starts_with(GENERATOR_MARKER));
    assert!(merged.contains("Hand-written notes"));
    assert!(merged.contains("\n---\n"));
}

#[test]
fn failing_file_yields_partial_failure_and_dependency_missing() {
    let (_guard, root) = project(&[
        ("src/good.kt", "fun ok() {}"),
        ("src/bad.kt", "poison"),
    ]);
    let summary_result = engine_for(&root).generate().unwrap();

    assert_eq!(summary_result.files_processed, 1);
    assert_eq!(summary_result.files_failed, 1);
    assert_eq!(summary_result.exit_class(), 1);
    assert!(summary_result
        .failures
        .iter()
        .any(|f| f.kind == "ai-subprocess"));
    // src/'s aggregate cannot be built with bad.kt.sum missing.
    assert!(summary_result
        .failures
        .iter()
        .any(|f| f.kind == "dependency-missing"));
    assert!(!artifact::summary_path(&root.join("src/bad.kt")).exists());
    assert!(artifact::summary_path(&root.join("src/good.kt")).exists());
}

#[test]
fn all_failures_exit_class_two() {
    let (_guard, root) = project(&[("src/bad.kt", "poison")]);
    let summary_result = engine_for(&root).generate().unwrap();
    assert_eq!(summary_result.files_processed, 0);
    assert_eq!(summary_result.files_failed, 1);
    assert_eq!(summary_result.exit_class(), 2);
}

#[test]
fn trace_is_monotonic_and_phases_do_not_overlap() {
    let (_guard, root) = project(&[("src/a.kt", "fun a() {}"), ("lib/b.kt", "fun b() {}")]);
    let trace_path = root.join(".are/trace/trace-test.ndjson");
    let tracer = Arc::new(FileTracer::create(&trace_path).unwrap());
    engine_with_tracer(&root, tracer.clone()).generate().unwrap();
    tracer.finalize();

    let content = std::fs::read_to_string(&trace_path).unwrap();
    let events: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    // seq strictly increasing with no gaps.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event["seq"].as_u64().unwrap(), i as u64);
    }

    // Every Phase-1 completion precedes every Phase-2 pickup, and every
    // Phase-2 completion precedes every Phase-3 pickup.
    let last_done = |phase: &str| {
        events
            .iter()
            .enumerate()
            .filter(|(_, e)| e["event"] == "task:done" && e["phase"] == phase)
            .map(|(i, _)| i)
            .max()
    };
    let first_pickup = |phase: &str| {
        events
            .iter()
            .enumerate()
            .filter(|(_, e)| e["event"] == "task:pickup" && e["phase"] == phase)
            .map(|(i, _)| i)
            .min()
    };
    assert!(last_done("file-analysis").unwrap() < first_pickup("directory-aggregation").unwrap());
    assert!(last_done("directory-aggregation").unwrap() < first_pickup("root-synthesis").unwrap());
}

#[test]
fn run_log_is_persisted_with_token_totals() {
    let (_guard, root) = project(&[("src/a.kt", "fun a() {}")]);
    let engine = engine_for(&root);
    engine.generate().unwrap();

    let logs = aredoc::telemetry::read_run_logs(engine.layout()).unwrap();
    assert_eq!(logs.len(), 1);
    let log = &logs[0].1;
    assert_eq!(log.command, "generate");
    assert_eq!(log.files_processed, 1);
    assert!(log.totals.input > 0);
    assert!(!log.entries.is_empty());
    assert!(log.entries.iter().any(|e| e.model == "stub-model"));
}

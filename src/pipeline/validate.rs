//! Post-run quality validators. Non-fatal: findings go into the run
//! summary, never into the exit class.

use std::path::PathBuf;

use crate::artifact::{is_engine_owned, summary};
use crate::error::EngineError;
use crate::observe::trace::Tracer;
use crate::pool::{run_pool, PoolOptions};
use crate::util::checksum;

const VALIDATOR_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub enum ValidationTarget {
    /// Summary artifact plus the source it must agree with.
    Summary { artifact: PathBuf, source: PathBuf },
    Aggregate { artifact: PathBuf },
    Root { artifact: PathBuf },
}

fn check(target: &ValidationTarget) -> Vec<String> {
    let mut findings = Vec::new();
    match target {
        ValidationTarget::Summary { artifact, source } => {
            let parsed = match summary::read_summary(artifact) {
                Ok(parsed) => parsed,
                Err(e) => {
                    findings.push(format!("{}: unreadable summary ({})", artifact.display(), e));
                    return findings;
                }
            };
            if parsed.body.trim().is_empty() {
                findings.push(format!("{}: empty summary body", artifact.display()));
            }
            match checksum::sha256_file(source) {
                Ok(hash) if hash == parsed.header.source_hash => {}
                Ok(_) => findings.push(format!(
                    "{}: stored hash does not match {}",
                    artifact.display(),
                    source.display()
                )),
                Err(e) => findings.push(format!(
                    "{}: source unreadable ({})",
                    source.display(),
                    e
                )),
            }
        }
        ValidationTarget::Aggregate { artifact } => match std::fs::read_to_string(artifact) {
            Ok(content) if !is_engine_owned(&content) => {
                findings.push(format!("{}: missing generator marker", artifact.display()))
            }
            Ok(_) => {}
            Err(e) => findings.push(format!("{}: unreadable ({})", artifact.display(), e)),
        },
        ValidationTarget::Root { artifact } => match std::fs::read_to_string(artifact) {
            Ok(content) if content.trim().is_empty() => {
                findings.push(format!("{}: empty root document", artifact.display()))
            }
            Ok(_) => {}
            Err(e) => findings.push(format!("{}: unreadable ({})", artifact.display(), e)),
        },
    }
    findings
}

/// Run all validators through the pool and collect their findings.
pub fn validate_artifacts(targets: Vec<ValidationTarget>, tracer: &dyn Tracer) -> Vec<String> {
    let labels: Vec<String> = targets
        .iter()
        .map(|t| match t {
            ValidationTarget::Summary { artifact, .. }
            | ValidationTarget::Aggregate { artifact }
            | ValidationTarget::Root { artifact } => {
                format!("validate:{}", artifact.display())
            }
        })
        .collect();
    let tasks: Vec<_> = targets
        .into_iter()
        .map(|target| move || Ok::<Vec<String>, EngineError>(check(&target)))
        .collect();

    let settled = run_pool(
        tasks,
        &PoolOptions {
            concurrency: VALIDATOR_CONCURRENCY,
            fail_fast: false,
            phase: "validate",
            labels: &labels,
            tracer,
        },
        &|_, _| {},
    );

    settled
        .into_iter()
        .filter_map(|s| s.result.ok())
        .flatten()
        .collect()
}

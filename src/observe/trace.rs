//! NDJSON lifecycle trace: one JSON object per line, each augmented with
//! `{seq, ts, pid, elapsedMs}` before it reaches the file.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use super::WriteQueue;
use crate::error::Result;
use crate::telemetry::now_rfc3339;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    #[serde(rename = "config:loaded")]
    ConfigLoaded { concurrency: usize, backend: String },
    #[serde(rename = "discovery:start")]
    DiscoveryStart { root: String },
    #[serde(rename = "discovery:end")]
    DiscoveryEnd { files: usize },
    #[serde(rename = "plan:created")]
    PlanCreated {
        file_tasks: usize,
        directory_tasks: usize,
        root_tasks: usize,
    },
    #[serde(rename = "phase:start")]
    PhaseStart {
        phase: String,
        tasks: usize,
        concurrency: usize,
    },
    #[serde(rename = "phase:end")]
    PhaseEnd {
        phase: String,
        completed: usize,
        failed: usize,
    },
    #[serde(rename = "worker:start")]
    WorkerStart { phase: String, worker: usize },
    #[serde(rename = "worker:end")]
    WorkerEnd { phase: String, worker: usize },
    #[serde(rename = "task:pickup")]
    TaskPickup {
        phase: String,
        worker: usize,
        label: String,
    },
    #[serde(rename = "task:done")]
    TaskDone {
        phase: String,
        worker: usize,
        label: String,
        duration_ms: u64,
        ok: bool,
    },
    #[serde(rename = "subprocess:spawn")]
    SubprocessSpawn { label: String, pid: u32 },
    #[serde(rename = "subprocess:exit")]
    SubprocessExit {
        label: String,
        exit_code: i32,
        duration_ms: u64,
        timed_out: bool,
    },
    #[serde(rename = "ai:retry")]
    Retry {
        label: String,
        attempt: u32,
        delay_ms: u64,
    },
}

pub trait Tracer: Send + Sync {
    fn emit(&self, event: TraceEvent);
    /// Flush the queue and close the sink. Emissions after finalize are
    /// discarded silently.
    fn finalize(&self) {}
}

/// Selected when tracing is disabled: every call compiles down to nothing.
pub struct NullTracer;

impl Tracer for NullTracer {
    fn emit(&self, _event: TraceEvent) {}
}

pub struct FileTracer {
    queue: WriteQueue,
    file: Arc<Mutex<std::fs::File>>,
    seq: Arc<AtomicU64>,
    start: Instant,
    finalized: AtomicBool,
}

impl FileTracer {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(Self {
            queue: WriteQueue::new("trace"),
            file: Arc::new(Mutex::new(file)),
            seq: Arc::new(AtomicU64::new(0)),
            start: Instant::now(),
            finalized: AtomicBool::new(false),
        })
    }
}

impl Tracer for FileTracer {
    fn emit(&self, event: TraceEvent) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        let file = self.file.clone();
        let seq = self.seq.clone();
        let start = self.start;
        // seq is assigned inside the serialized writer so it is gap-free and
        // strictly increasing even when workers race to emit.
        self.queue.push(move || {
            let n = seq.fetch_add(1, Ordering::Relaxed);
            let mut value = match serde_json::to_value(&event) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => return,
            };
            value.insert("seq".to_string(), n.into());
            value.insert("ts".to_string(), now_rfc3339().into());
            value.insert("pid".to_string(), std::process::id().into());
            value.insert(
                "elapsedMs".to_string(),
                (start.elapsed().as_millis() as u64).into(),
            );
            if let Ok(line) = serde_json::to_string(&serde_json::Value::Object(value)) {
                let mut file = file.lock().unwrap();
                let _ = writeln!(file, "{}", line);
            }
        });
    }

    fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
        self.queue.close();
        if let Ok(file) = self.file.lock() {
            let _ = (&*file).sync_all();
        }
    }
}

impl Drop for FileTracer {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_gap_free_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let tracer = Arc::new(FileTracer::create(&path).unwrap());

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let tracer = tracer.clone();
                scope.spawn(move || {
                    for _ in 0..50 {
                        tracer.emit(TraceEvent::WorkerStart {
                            phase: "p".to_string(),
                            worker,
                        });
                    }
                });
            }
        });
        tracer.finalize();

        let content = std::fs::read_to_string(&path).unwrap();
        let seqs: Vec<u64> = content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["seq"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(seqs.len(), 400);
        assert_eq!(seqs, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn events_after_finalize_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let tracer = FileTracer::create(&path).unwrap();
        tracer.emit(TraceEvent::DiscoveryEnd { files: 1 });
        tracer.finalize();
        tracer.emit(TraceEvent::DiscoveryEnd { files: 2 });

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn events_carry_augmented_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.ndjson");
        let tracer = FileTracer::create(&path).unwrap();
        tracer.emit(TraceEvent::PhaseStart {
            phase: "file-analysis".to_string(),
            tasks: 3,
            concurrency: 2,
        });
        tracer.finalize();

        let content = std::fs::read_to_string(&path).unwrap();
        let v: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(v["event"], "phase:start");
        assert_eq!(v["seq"], 0);
        assert!(v["ts"].is_string());
        assert!(v["pid"].is_u64());
        assert!(v["elapsedMs"].is_u64());
    }
}

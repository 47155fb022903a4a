//! Human-readable progress lines, mirrored to the terminal and a log file.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use owo_colors::OwoColorize;

use super::WriteQueue;
use crate::error::Result;

/// ETA comes from a rolling window of recent task durations.
const ETA_WINDOW: usize = 10;
/// Hidden until this many completions have been recorded.
const ETA_MIN_SAMPLES: usize = 2;

struct ProgressState {
    total: usize,
    finished: usize,
    durations: VecDeque<u64>,
}

pub struct ProgressEmitter {
    queue: WriteQueue,
    file: Arc<Mutex<std::fs::File>>,
    state: Arc<Mutex<ProgressState>>,
    concurrency: usize,
}

impl ProgressEmitter {
    pub fn create(path: &Path, total: usize, concurrency: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        Ok(Self {
            queue: WriteQueue::new("progress"),
            file: Arc::new(Mutex::new(file)),
            state: Arc::new(Mutex::new(ProgressState {
                total,
                finished: 0,
                durations: VecDeque::with_capacity(ETA_WINDOW),
            })),
            concurrency: concurrency.max(1),
        })
    }

    /// A new phase contributes more tasks to the denominator.
    pub fn extend_total(&self, additional: usize) {
        self.state.lock().unwrap().total += additional;
    }

    pub fn task_started(&self, label: &str) {
        self.write_line(format!("start {}", label));
    }

    pub fn task_succeeded(&self, label: &str, duration_ms: u64) {
        let (finished, total, eta) = self.record(duration_ms);
        let mut line = format!(
            "[{}/{}] {} {} ({:.1}s)",
            finished,
            total,
            "done".green(),
            label,
            duration_ms as f64 / 1000.0
        );
        if let Some(eta) = eta {
            line.push_str(&format!("  eta {}s", eta / 1000));
        }
        self.write_line(line);
    }

    pub fn task_failed(&self, label: &str, kind: &str, message: &str, duration_ms: u64) {
        let (finished, total, _) = self.record(duration_ms);
        let line = format!(
            "[{}/{}] {} {} [{}] {}",
            finished,
            total,
            "fail".red(),
            label,
            kind,
            message
        );
        self.write_line(line);
    }

    pub fn finalize(&self) {
        self.queue.close();
    }

    fn record(&self, duration_ms: u64) -> (usize, usize, Option<u64>) {
        let mut state = self.state.lock().unwrap();
        state.finished += 1;
        if state.durations.len() == ETA_WINDOW {
            state.durations.pop_front();
        }
        state.durations.push_back(duration_ms);

        let eta = if state.durations.len() >= ETA_MIN_SAMPLES {
            let avg = state.durations.iter().sum::<u64>() / state.durations.len() as u64;
            let remaining = state.total.saturating_sub(state.finished) as u64;
            Some(avg * remaining / self.concurrency as u64)
        } else {
            None
        };
        (state.finished, state.total, eta)
    }

    fn write_line(&self, line: String) {
        let file = self.file.clone();
        self.queue.push(move || {
            println!("{}", line);
            let mut file = file.lock().unwrap();
            let _ = writeln!(file, "{}", line);
        });
    }
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_hidden_until_two_completions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.log");
        let emitter = ProgressEmitter::create(&path, 4, 1).unwrap();
        emitter.task_succeeded("a", 1000);
        emitter.task_succeeded("b", 1000);
        emitter.finalize();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(!lines[0].contains("eta"));
        assert!(lines[1].contains("eta"));
    }

    #[test]
    fn lines_are_counted_against_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.log");
        let emitter = ProgressEmitter::create(&path, 2, 1).unwrap();
        emitter.task_succeeded("a", 10);
        emitter.task_failed("b", "ai-timeout", "deadline exceeded", 10);
        emitter.finalize();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[1/2]"));
        assert!(content.contains("[2/2]"));
        assert!(content.contains("[ai-timeout]"));
    }
}

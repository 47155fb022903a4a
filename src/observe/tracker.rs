//! Markdown checkbox tracker: one checkbox per task, file rewritten through
//! the write queue on every completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::WriteQueue;
use crate::error::Result;

struct TrackerState {
    /// (label, ticked) in plan order.
    items: Vec<(String, bool)>,
    index: HashMap<String, usize>,
}

pub struct PlanTracker {
    queue: WriteQueue,
    path: PathBuf,
    state: Arc<Mutex<TrackerState>>,
}

impl PlanTracker {
    pub fn create(path: PathBuf, labels: Vec<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index = labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        let tracker = Self {
            queue: WriteQueue::new("plan"),
            path,
            state: Arc::new(Mutex::new(TrackerState {
                items: labels.into_iter().map(|l| (l, false)).collect(),
                index,
            })),
        };
        tracker.rewrite();
        Ok(tracker)
    }

    pub fn mark_done(&self, label: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(&i) = state.index.get(label) {
                state.items[i].1 = true;
            }
        }
        self.rewrite();
    }

    pub fn finalize(&self) {
        self.queue.close();
    }

    fn rewrite(&self) {
        let content = {
            let state = self.state.lock().unwrap();
            let mut out = String::from("# aredoc run plan\n\n");
            for (label, done) in &state.items {
                out.push_str(if *done { "- [x] " } else { "- [ ] " });
                out.push_str(label);
                out.push('\n');
            }
            out
        };
        let path = self.path.clone();
        self.queue.push(move || {
            let _ = std::fs::write(&path, content);
        });
    }
}

impl Drop for PlanTracker {
    fn drop(&mut self) {
        self.finalize();
    }
}

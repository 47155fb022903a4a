//! Bounded worker pool over a shared task cursor.
//!
//! N workers race to atomically pull the next task from a single cursor, so
//! skewed task durations never leave a worker idle while work remains. The
//! pool never throws: every task settles as success or failure, in input
//! order, and `on_complete` fires exactly once per task — including tasks a
//! fail-fast abort prevented from starting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::EngineError;
use crate::observe::trace::{TraceEvent, Tracer};

pub struct PoolOptions<'a> {
    pub concurrency: usize,
    pub fail_fast: bool,
    pub phase: &'a str,
    /// Display labels, parallel to the task sequence.
    pub labels: &'a [String],
    pub tracer: &'a dyn Tracer,
}

/// Settlement record for one task.
pub struct Settlement<T> {
    pub label: String,
    pub duration_ms: u64,
    pub result: Result<T, EngineError>,
}

/// Execute `tasks` with at most `options.concurrency` workers.
///
/// Returns one settlement per input task, in input order regardless of
/// completion order. On fail-fast, in-flight tasks run to completion and
/// never-started tasks settle with the `Skipped` sentinel.
pub fn run_pool<T, F>(
    tasks: Vec<F>,
    options: &PoolOptions<'_>,
    on_complete: &(dyn Fn(usize, &Settlement<T>) + Sync),
) -> Vec<Settlement<T>>
where
    T: Send,
    F: FnOnce() -> Result<T, EngineError> + Send,
{
    let total = tasks.len();
    let workers = options.concurrency.max(1).min(total);

    options.tracer.emit(TraceEvent::PhaseStart {
        phase: options.phase.to_string(),
        tasks: total,
        concurrency: workers,
    });

    let label_of = |i: usize| {
        options
            .labels
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("task-{}", i))
    };

    let slots: Vec<Mutex<Option<F>>> = tasks.into_iter().map(|t| Mutex::new(Some(t))).collect();
    let results: Vec<Mutex<Option<Settlement<T>>>> =
        (0..total).map(|_| Mutex::new(None)).collect();
    let cursor = AtomicUsize::new(0);
    let aborted = AtomicBool::new(false);

    let label_of = &label_of;
    std::thread::scope(|scope| {
        for worker in 0..workers {
            let slots = &slots;
            let results = &results;
            let cursor = &cursor;
            let aborted = &aborted;
            scope.spawn(move || {
                options.tracer.emit(TraceEvent::WorkerStart {
                    phase: options.phase.to_string(),
                    worker,
                });
                loop {
                    if aborted.load(Ordering::Acquire) {
                        break;
                    }
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= total {
                        break;
                    }
                    let task = slots[index]
                        .lock()
                        .unwrap()
                        .take()
                        .expect("task pulled twice");
                    let label = label_of(index);
                    options.tracer.emit(TraceEvent::TaskPickup {
                        phase: options.phase.to_string(),
                        worker,
                        label: label.clone(),
                    });

                    let begin = Instant::now();
                    let result = task();
                    let duration_ms = begin.elapsed().as_millis() as u64;

                    if result.is_err() && options.fail_fast {
                        aborted.store(true, Ordering::Release);
                    }
                    options.tracer.emit(TraceEvent::TaskDone {
                        phase: options.phase.to_string(),
                        worker,
                        label: label.clone(),
                        duration_ms,
                        ok: result.is_ok(),
                    });

                    let settlement = Settlement {
                        label,
                        duration_ms,
                        result,
                    };
                    on_complete(index, &settlement);
                    *results[index].lock().unwrap() = Some(settlement);
                }
                options.tracer.emit(TraceEvent::WorkerEnd {
                    phase: options.phase.to_string(),
                    worker,
                });
            });
        }
    });

    // Tasks the abort prevented from starting settle as skipped failures.
    let mut settled = Vec::with_capacity(total);
    for (index, slot) in results.into_iter().enumerate() {
        let settlement = match slot.into_inner().unwrap() {
            Some(s) => s,
            None => {
                let settlement = Settlement {
                    label: label_of(index),
                    duration_ms: 0,
                    result: Err(EngineError::Skipped),
                };
                on_complete(index, &settlement);
                settlement
            }
        };
        settled.push(settlement);
    }

    let completed = settled.iter().filter(|s| s.result.is_ok()).count();
    options.tracer.emit(TraceEvent::PhaseEnd {
        phase: options.phase.to_string(),
        completed,
        failed: total - completed,
    });
    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::trace::NullTracer;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    fn options<'a>(concurrency: usize, fail_fast: bool, labels: &'a [String]) -> PoolOptions<'a> {
        PoolOptions {
            concurrency,
            fail_fast,
            phase: "test",
            labels,
            tracer: &NullTracer,
        }
    }

    #[test]
    fn zero_tasks_returns_immediately() {
        let tasks: Vec<fn() -> Result<(), EngineError>> = Vec::new();
        let settled = run_pool(tasks, &options(4, false, &[]), &|_, _| {});
        assert!(settled.is_empty());
    }

    #[test]
    fn results_arrive_in_input_order() {
        // Early tasks sleep longer, so completion order inverts input order.
        let tasks: Vec<_> = (0..6u64)
            .map(|i| {
                move || {
                    std::thread::sleep(Duration::from_millis((6 - i) * 10));
                    Ok::<u64, EngineError>(i)
                }
            })
            .collect();
        let settled = run_pool(tasks, &options(6, false, &[]), &|_, _| {});
        let values: Vec<u64> = settled
            .into_iter()
            .map(|s| s.result.unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrency_bound_is_honored() {
        let in_flight = AtomicI64::new(0);
        let peak = AtomicI64::new(0);
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let in_flight = &in_flight;
                let peak = &peak;
                move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), EngineError>(())
                }
            })
            .collect();
        run_pool(tasks, &options(3, false, &[]), &|_, _| {});
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn fail_fast_skips_unstarted_tasks() {
        let executed = AtomicUsize::new(0);
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let executed = &executed;
                move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                    if i == 0 {
                        Err(EngineError::ParseError("bad".to_string()))
                    } else {
                        std::thread::sleep(Duration::from_millis(5));
                        Ok(())
                    }
                }
            })
            .collect();

        let completions = AtomicUsize::new(0);
        let settled = run_pool(tasks, &options(1, true, &[]), &|_, _| {
            completions.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(settled.len(), 10);
        assert_eq!(completions.load(Ordering::SeqCst), 10);
        // Single worker: the first task fails, everything after is skipped.
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            settled[1].result.as_ref().unwrap_err(),
            EngineError::Skipped
        ));
        assert_eq!(settled[1].result.as_ref().unwrap_err().kind(), "skipped");
    }

    #[test]
    fn every_task_runs_exactly_once() {
        let runs = AtomicUsize::new(0);
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let runs = &runs;
                move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), EngineError>(())
                }
            })
            .collect();
        run_pool(tasks, &options(8, false, &[]), &|_, _| {});
        assert_eq!(runs.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn labels_attach_to_settlements() {
        let labels: Vec<String> = vec!["alpha".into(), "beta".into()];
        let tasks: Vec<_> = (0..2)
            .map(|_| move || Ok::<(), EngineError>(()))
            .collect();
        let settled = run_pool(tasks, &options(2, false, &labels), &|_, _| {});
        assert_eq!(settled[0].label, "alpha");
        assert_eq!(settled[1].label, "beta");
    }
}

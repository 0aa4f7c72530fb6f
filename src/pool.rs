//! Concurrent execution of fetch tasks.
//!
//! Each task runs on its own worker thread. Results come back in submission
//! order regardless of completion order, and every failure mode of a worker
//! (error, panic, timeout) is turned into an [`Outcome::Failed`].

use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::fetch::{FetchTask, Outcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOptions {
    /// Upper bound on concurrently running tasks; unbounded when `None`.
    pub max_in_flight: Option<usize>,
    pub task_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPool {
    options: PoolOptions,
}

impl TaskPool {
    pub fn new(options: PoolOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// Runs `work` over every task and waits for all of them.
    ///
    /// The returned vector has one entry per task, in the order given.
    pub fn run_all<F>(&self, tasks: Vec<FetchTask>, work: Arc<F>) -> Vec<(FetchTask, Outcome)>
    where
        F: Fn(&FetchTask) -> Outcome + Send + Sync + 'static,
    {
        let total = tasks.len();
        let wave = self
            .options
            .max_in_flight
            .filter(|cap| *cap > 0)
            .unwrap_or(total.max(1));
        let mut results = Vec::with_capacity(total);
        let mut pending = tasks.into_iter().enumerate().peekable();

        while pending.peek().is_some() {
            let batch = pending.by_ref().take(wave).collect::<Vec<_>>();
            debug!(tasks = batch.len(), total, "starting task wave");
            let running = batch
                .into_iter()
                .map(|(index, task)| self.spawn(index, task, Arc::clone(&work)))
                .collect::<Vec<_>>();
            for running in running {
                results.push(self.join(running));
            }
        }
        results
    }

    fn spawn<F>(&self, index: usize, task: FetchTask, work: Arc<F>) -> Running
    where
        F: Fn(&FetchTask) -> Outcome + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        let worker_task = task.clone();
        let spawned = thread::Builder::new()
            .name(format!("fetch-{index}"))
            .spawn(move || {
                let outcome = work(&worker_task);
                // The receiver is gone only after a timeout.
                sender.send(outcome).ok();
            });
        match spawned {
            Ok(handle) => Running::Started {
                task,
                receiver,
                handle,
            },
            Err(err) => {
                let outcome = Outcome::failed(task.id(), format!("failed to start worker: {err}"));
                Running::Rejected { task, outcome }
            }
        }
    }

    fn join(&self, running: Running) -> (FetchTask, Outcome) {
        let (task, receiver, handle) = match running {
            Running::Rejected { task, outcome } => return (task, outcome),
            Running::Started {
                task,
                receiver,
                handle,
            } => (task, receiver, handle),
        };

        let received = match self.options.task_timeout {
            Some(timeout) => receiver.recv_timeout(timeout),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        let outcome = match received {
            Ok(outcome) => {
                handle.join().ok();
                outcome
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(item = task.id(), "task timed out; abandoning worker");
                let timeout = self.options.task_timeout.unwrap_or_default();
                Outcome::failed(task.id(), format!("timed out after {timeout:?}"))
            }
            Err(RecvTimeoutError::Disconnected) => match handle.join() {
                Err(payload) => {
                    Outcome::failed(task.id(), format!("worker panicked: {}", panic_message(payload.as_ref())))
                }
                Ok(()) => Outcome::failed(task.id(), "worker exited without a result"),
            },
        };
        (task, outcome)
    }
}

enum Running {
    Started {
        task: FetchTask,
        receiver: mpsc::Receiver<Outcome>,
        handle: thread::JoinHandle<()>,
    },
    Rejected {
        task: FetchTask,
        outcome: Outcome,
    },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use assert_matches::assert_matches;

    use super::*;
    use crate::catalog::CatalogItem;
    use crate::domain::FetchShape;
    use crate::fetch::{FetchFailure, PartialResult, TaskSource};
    use crate::grid::{CoordValues, GridArray};

    fn task(id: &str) -> FetchTask {
        FetchTask {
            source: TaskSource::Catalog(CatalogItem {
                id: id.to_string(),
                collection: None,
                properties: Default::default(),
                assets: Default::default(),
            }),
            shape: FetchShape::Item,
            variable: "t2m".to_string(),
            bbox: None,
            factor: 1.0,
            basin_id: None,
        }
    }

    fn fetched(task: &FetchTask) -> Outcome {
        Outcome::Fetched(PartialResult {
            source_id: task.id().to_string(),
            model: None,
            array: GridArray::from_vec(
                "t2m",
                vec![("time", CoordValues::Float(vec![0.0]))],
                vec![1.0],
            )
            .unwrap(),
        })
    }

    #[test]
    fn results_follow_submission_order() {
        let schedules: [[u64; 6]; 4] = [
            [50, 40, 30, 20, 10, 0],
            [0, 10, 20, 30, 40, 50],
            [30, 0, 50, 10, 40, 20],
            [20, 50, 0, 40, 10, 30],
        ];
        for delays in schedules {
            let tasks = (0..6).map(|i| task(&format!("item-{i}"))).collect::<Vec<_>>();
            let work = Arc::new(move |task: &FetchTask| {
                let index: usize = task.id().trim_start_matches("item-").parse().unwrap();
                thread::sleep(Duration::from_millis(delays[index]));
                fetched(task)
            });
            let results = TaskPool::default().run_all(tasks, work);
            let ids = results
                .iter()
                .map(|(_, outcome)| outcome.as_fetched().unwrap().source_id.clone())
                .collect::<Vec<_>>();
            assert_eq!(
                ids,
                vec!["item-0", "item-1", "item-2", "item-3", "item-4", "item-5"],
                "completion delays {delays:?}"
            );
        }
    }

    #[test]
    fn item_ids_with_nul_still_run() {
        let results = TaskPool::default().run_all(
            vec![task("ok"), task("bad\0id")],
            Arc::new(fetched),
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].0.id(), "bad\0id");
        assert_eq!(
            results[1].1.as_fetched().map(|part| part.source_id.as_str()),
            Some("bad\0id")
        );
    }

    #[test]
    fn panic_becomes_failure_without_losing_siblings() {
        let work = Arc::new(|task: &FetchTask| {
            if task.id() == "bad" {
                panic!("corrupt chunk");
            }
            fetched(task)
        });
        let results = TaskPool::default().run_all(vec![task("ok"), task("bad"), task("ok2")], work);
        assert_eq!(results.len(), 3);
        assert!(results[0].1.as_fetched().is_some());
        assert_matches!(
            &results[1].1,
            Outcome::Failed(FetchFailure { item_id, cause }) if item_id == "bad" && cause.contains("corrupt chunk")
        );
        assert!(results[2].1.as_fetched().is_some());
    }

    #[test]
    fn slow_task_times_out() {
        let pool = TaskPool::new(PoolOptions {
            max_in_flight: None,
            task_timeout: Some(Duration::from_millis(50)),
        });
        let work = Arc::new(|task: &FetchTask| {
            if task.id() == "slow" {
                thread::sleep(Duration::from_millis(500));
            }
            fetched(task)
        });
        let results = pool.run_all(vec![task("fast"), task("slow")], work);
        assert!(results[0].1.as_fetched().is_some());
        assert_matches!(&results[1].1, Outcome::Failed(failure) if failure.cause.contains("timed out"));
    }

    #[test]
    fn cap_limits_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_in, peak_in) = (Arc::clone(&running), Arc::clone(&peak));
        let work = Arc::new(move |task: &FetchTask| {
            let now = running_in.fetch_add(1, Ordering::SeqCst) + 1;
            peak_in.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            running_in.fetch_sub(1, Ordering::SeqCst);
            fetched(task)
        });
        let pool = TaskPool::new(PoolOptions {
            max_in_flight: Some(2),
            task_timeout: None,
        });
        let started = Instant::now();
        let results = pool.run_all((0..5).map(|i| task(&i.to_string())).collect(), work);
        assert_eq!(results.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn empty_input_yields_nothing() {
        let work = Arc::new(|task: &FetchTask| fetched(task));
        assert!(TaskPool::default().run_all(Vec::new(), work).is_empty());
    }
}

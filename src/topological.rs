//! Parallel execution of a task DAG in dependency order.
//!
//! A worker pool scans the remaining tasks for one whose prerequisites
//! have all completed, runs it, and wakes the pool. There is no
//! up-front topological sort; the task count is always tiny and the
//! scan is cheap. The reversed runner re-wires the same machinery to
//! run the DAG backwards for shutdown.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

#[async_trait]
pub trait Task: Send + Sync {
    /// Unique identity; duplicate keys reached through different edges
    /// are executed once.
    fn key(&self) -> String;

    async fn run(&self) -> Result<()>;

    /// Prerequisites: tasks that must complete before this one runs.
    fn deps(&self) -> Vec<Arc<dyn Task>>;

    /// How long this task took, for the critical-path report.
    fn duration(&self) -> Duration;

    /// When this task last started running. Tasks that were already
    /// running before the runner began are excluded from the critical
    /// path.
    fn start_time(&self) -> Instant;
}

struct RunState {
    tasks: Vec<Arc<dyn Task>>,
    completed: HashSet<String>,
    die: bool,
    err: Option<Error>,
}

pub struct Runner {
    started_at: Instant,
    tasks_by_key: HashMap<String, Arc<dyn Task>>,
    state: Mutex<RunState>,
    wakeup: Notify,
}

impl Runner {
    /// Build a runner over `roots` and everything transitively
    /// reachable through `deps`, de-duplicated by key.
    pub fn new(roots: Vec<Arc<dyn Task>>) -> Self {
        let tasks = transitive_closure(roots);
        let tasks_by_key = tasks
            .iter()
            .map(|task| (task.key(), Arc::clone(task)))
            .collect();
        Self {
            started_at: Instant::now(),
            tasks_by_key,
            state: Mutex::new(RunState {
                tasks,
                completed: HashSet::new(),
                die: false,
                err: None,
            }),
            wakeup: Notify::new(),
        }
    }

    /// Run everything. Returns the first task error; remaining workers
    /// stop scheduling new tasks but in-flight ones finish.
    pub async fn run(&self) -> Result<()> {
        let workers: Vec<_> = (0..num_cpus::get() * 2 + 1)
            .map(|_| self.worker())
            .collect();
        futures::future::join_all(workers).await;
        self.state.lock().await.err.take().map_or(Ok(()), Err)
    }

    async fn worker(&self) {
        let mut state = self.state.lock().await;
        while !state.tasks.is_empty() && !state.die {
            let ready_idx = state
                .tasks
                .iter()
                .position(|task| task.deps().iter().all(|d| state.completed.contains(&d.key())));
            let Some(idx) = ready_idx else {
                // Nothing runnable right now; park until a completion or
                // an error changes the picture. The notification is
                // registered before the lock is released, so a wakeup
                // in between cannot be lost.
                let mut notified = std::pin::pin!(self.wakeup.notified());
                notified.as_mut().enable();
                drop(state);
                notified.await;
                state = self.state.lock().await;
                continue;
            };
            let task = state.tasks.remove(idx);
            drop(state);

            let outcome = task.run().await;

            state = self.state.lock().await;
            match outcome {
                Ok(()) => {
                    state.completed.insert(task.key());
                    self.wakeup.notify_waiters();
                }
                Err(e) => {
                    // Only the first error is reported.
                    if state.err.is_none() {
                        state.err = Some(e);
                    }
                    state.die = true;
                    self.wakeup.notify_waiters();
                    break;
                }
            }
        }
    }

    /// Number of distinct tasks that ran to completion.
    pub async fn completed(&self) -> usize {
        self.state.lock().await.completed.len()
    }

    /// The slowest chain of tasks, costliest first. Tasks already
    /// running when this runner started carry no cost, so re-runs do
    /// not accumulate phantom time.
    pub async fn critical_path(&self) -> Vec<Arc<dyn Task>> {
        let state = self.state.lock().await;
        let all: Vec<Arc<dyn Task>> = state
            .completed
            .iter()
            .filter_map(|key| self.tasks_by_key.get(key).cloned())
            .collect();
        drop(state);

        let mut costs: HashMap<String, Duration> = HashMap::new();
        let mut path = Vec::new();
        let mut current = self.highest_cost(&all, &mut costs);
        while let Some(task) = current {
            path.push(Arc::clone(&task));
            current = self.highest_cost(&task.deps(), &mut costs);
        }
        path
    }

    fn highest_cost(
        &self,
        tasks: &[Arc<dyn Task>],
        costs: &mut HashMap<String, Duration>,
    ) -> Option<Arc<dyn Task>> {
        let mut highest: Option<Arc<dyn Task>> = None;
        let mut best = Duration::ZERO;
        for task in tasks {
            if task.start_time() < self.started_at {
                continue;
            }
            let cost = self.task_cost(task, costs);
            if cost > best {
                best = cost;
                highest = Some(Arc::clone(task));
            }
        }
        highest
    }

    fn task_cost(&self, task: &Arc<dyn Task>, costs: &mut HashMap<String, Duration>) -> Duration {
        if let Some(&cost) = costs.get(&task.key()) {
            return cost;
        }
        let dep_cost = self
            .highest_cost(&task.deps(), costs)
            .map(|dep| self.task_cost(&dep, costs))
            .unwrap_or(Duration::ZERO);
        let cost = task.duration() + dep_cost;
        costs.insert(task.key(), cost);
        cost
    }
}

fn transitive_closure(roots: Vec<Arc<dyn Task>>) -> Vec<Arc<dyn Task>> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    let mut queue: std::collections::VecDeque<Arc<dyn Task>> = roots.into();
    while let Some(task) = queue.pop_front() {
        if !seen.insert(task.key()) {
            continue;
        }
        for dep in task.deps() {
            queue.push_back(dep);
        }
        result.push(task);
    }
    result
}

/// A task whose edges have been flipped.
struct ReversedTask {
    inner: Arc<dyn Task>,
    reverse_deps: RwLock<Vec<Arc<dyn Task>>>,
}

#[async_trait]
impl Task for ReversedTask {
    fn key(&self) -> String {
        self.inner.key()
    }

    async fn run(&self) -> Result<()> {
        self.inner.run().await
    }

    fn deps(&self) -> Vec<Arc<dyn Task>> {
        self.reverse_deps.read().clone()
    }

    fn duration(&self) -> Duration {
        self.inner.duration()
    }

    fn start_time(&self) -> Instant {
        self.inner.start_time()
    }
}

/// Build a runner that executes the DAG in reverse order: a task runs
/// only after every task that depends on it has completed.
pub fn reversed_runner(roots: Vec<Arc<dyn Task>>) -> Runner {
    // Walk the forward graph, remembering for each task which tasks
    // point at it.
    let mut reverse_edges: HashMap<String, Vec<String>> = HashMap::new();
    let mut all_tasks: Vec<Arc<dyn Task>> = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: std::collections::VecDeque<Arc<dyn Task>> = roots.into();
    while let Some(task) = queue.pop_front() {
        if !seen.insert(task.key()) {
            continue;
        }
        for dep in task.deps() {
            reverse_edges
                .entry(dep.key())
                .or_default()
                .push(task.key());
            queue.push_back(dep);
        }
        all_tasks.push(task);
    }

    let reversed: HashMap<String, Arc<ReversedTask>> = all_tasks
        .iter()
        .map(|task| {
            (
                task.key(),
                Arc::new(ReversedTask {
                    inner: Arc::clone(task),
                    reverse_deps: RwLock::new(Vec::new()),
                }),
            )
        })
        .collect();

    for task in reversed.values() {
        if let Some(edges) = reverse_edges.get(&task.key()) {
            let deps: Vec<Arc<dyn Task>> = edges
                .iter()
                .filter_map(|key| reversed.get(key))
                .map(|t| Arc::clone(t) as Arc<dyn Task>)
                .collect();
            *task.reverse_deps.write() = deps;
        }
    }

    Runner::new(
        reversed
            .into_values()
            .map(|t| t as Arc<dyn Task>)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    struct RecordingTask {
        key: String,
        deps: Vec<Arc<dyn Task>>,
        finished_at: Arc<SyncMutex<Option<Instant>>>,
        started_at: Arc<SyncMutex<Option<Instant>>>,
        fail: bool,
    }

    impl RecordingTask {
        fn new(key: &str, deps: Vec<Arc<dyn Task>>) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                deps,
                finished_at: Arc::new(SyncMutex::new(None)),
                started_at: Arc::new(SyncMutex::new(None)),
                fail: false,
            })
        }

        fn failing(key: &str, deps: Vec<Arc<dyn Task>>) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                deps,
                finished_at: Arc::new(SyncMutex::new(None)),
                started_at: Arc::new(SyncMutex::new(None)),
                fail: true,
            })
        }

        fn finished(&self) -> Instant {
            self.finished_at.lock().expect("task ran")
        }
    }

    #[async_trait]
    impl Task for RecordingTask {
        fn key(&self) -> String {
            self.key.clone()
        }

        async fn run(&self) -> Result<()> {
            *self.started_at.lock() = Some(Instant::now());
            tokio::time::sleep(Duration::from_millis(2)).await;
            *self.finished_at.lock() = Some(Instant::now());
            if self.fail {
                return Err(Error::Config(format!("task {} failed", self.key)));
            }
            Ok(())
        }

        fn deps(&self) -> Vec<Arc<dyn Task>> {
            self.deps.clone()
        }

        fn duration(&self) -> Duration {
            Duration::from_millis(2)
        }

        fn start_time(&self) -> Instant {
            self.started_at.lock().expect("task ran")
        }
    }

    fn as_task(t: &Arc<RecordingTask>) -> Arc<dyn Task> {
        Arc::clone(t) as Arc<dyn Task>
    }

    #[tokio::test]
    async fn linear_chain_runs_in_order() {
        let first = RecordingTask::new("first", vec![]);
        let second = RecordingTask::new("second", vec![as_task(&first)]);
        let runner = Runner::new(vec![as_task(&second)]);
        runner.run().await.unwrap();
        assert!(first.finished() <= second.finished());
        assert_eq!(runner.completed().await, 2);
    }

    #[tokio::test]
    async fn diamond_runs_all_four_once() {
        let bottom = RecordingTask::new("bottom", vec![]);
        let left = RecordingTask::new("left", vec![as_task(&bottom)]);
        let right = RecordingTask::new("right", vec![as_task(&bottom)]);
        let top = RecordingTask::new("top", vec![as_task(&left), as_task(&right)]);
        let runner = Runner::new(vec![as_task(&top)]);
        runner.run().await.unwrap();

        assert_eq!(runner.completed().await, 4);
        assert!(bottom.finished() <= left.finished());
        assert!(bottom.finished() <= right.finished());
        assert!(left.finished() <= top.finished());
        assert!(right.finished() <= top.finished());
    }

    #[tokio::test]
    async fn reversed_diamond_runs_backwards() {
        let bottom = RecordingTask::new("bottom", vec![]);
        let left = RecordingTask::new("left", vec![as_task(&bottom)]);
        let right = RecordingTask::new("right", vec![as_task(&bottom)]);
        let top = RecordingTask::new("top", vec![as_task(&left), as_task(&right)]);
        let runner = reversed_runner(vec![as_task(&top)]);
        runner.run().await.unwrap();

        assert_eq!(runner.completed().await, 4);
        assert!(top.finished() <= left.finished());
        assert!(top.finished() <= right.finished());
        assert!(left.finished() <= bottom.finished());
        assert!(right.finished() <= bottom.finished());
    }

    #[tokio::test]
    async fn first_error_wins_and_dependents_do_not_run() {
        let bad = RecordingTask::failing("bad", vec![]);
        let blocked = RecordingTask::new("blocked", vec![as_task(&bad)]);
        let runner = Runner::new(vec![as_task(&blocked)]);
        let err = runner.run().await.unwrap_err();
        assert!(err.to_string().contains("task bad failed"));
        assert!(blocked.finished_at.lock().is_none());
    }

    #[tokio::test]
    async fn critical_path_spans_the_longest_chain() {
        let bottom = RecordingTask::new("bottom", vec![]);
        let mid = RecordingTask::new("mid", vec![as_task(&bottom)]);
        let top = RecordingTask::new("top", vec![as_task(&mid)]);
        let lone = RecordingTask::new("lone", vec![]);
        let runner = Runner::new(vec![as_task(&top), as_task(&lone)]);
        runner.run().await.unwrap();

        let path: Vec<String> = runner
            .critical_path()
            .await
            .iter()
            .map(|task| task.key())
            .collect();
        assert_eq!(path, vec!["top", "mid", "bottom"]);
    }

    #[tokio::test]
    async fn duplicate_keys_run_once() {
        let shared = RecordingTask::new("shared", vec![]);
        let a = RecordingTask::new("a", vec![as_task(&shared)]);
        let b = RecordingTask::new("b", vec![as_task(&shared)]);
        let runner = Runner::new(vec![as_task(&a), as_task(&b)]);
        runner.run().await.unwrap();
        assert_eq!(runner.completed().await, 3);
    }
}

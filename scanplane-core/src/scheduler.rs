//! Priority work queue with a pool of named processors.
//!
//! Processors are scanner identities. The scheduler never talks to them; it
//! pairs an idle processor with the oldest High task (then Low), marks the
//! task in flight and hands both to a [`TaskHandler`]. A handler that starts
//! background work answers [`TaskAction::Wait`] and the processor stays
//! occupied until [`TaskScheduler::task_done`] is called.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    High,
    #[default]
    Low,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::High => f.write_str("high"),
            TaskPriority::Low => f.write_str("low"),
        }
    }
}

/// Pure scheduling record. `key` is the uniqueness domain: at most one task
/// per key is queued or in flight at any time.
pub trait SchedulerTask: Clone + Send + Sync + fmt::Debug + 'static {
    fn key(&self) -> String;
    fn priority(&self) -> TaskPriority;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    /// Finished; release the processor.
    Done,
    /// Release the processor and queue the task again at the back.
    Requeue,
    /// Work continues elsewhere; keep the processor until `task_done`.
    Wait,
}

#[async_trait]
pub trait TaskHandler<T: SchedulerTask>: Send + Sync {
    /// Must return promptly. Blocking work belongs on a spawned task that
    /// reports back through [`TaskScheduler::task_done`].
    async fn handle(&self, task: T, processor: &str) -> TaskAction;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Queued keys, High first, in dispatch order.
    pub queued: Vec<String>,
    pub high: usize,
    pub low: usize,
    pub inflight: usize,
    pub processors: usize,
    pub idle_processors: usize,
}

struct InflightTask {
    processor: String,
}

struct SchedulerState<T> {
    high: VecDeque<T>,
    low: VecDeque<T>,
    /// Processor name to the key it is working on.
    processors: BTreeMap<String, Option<String>>,
    inflight: HashMap<String, InflightTask>,
}

impl<T: SchedulerTask> SchedulerState<T> {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            low: VecDeque::new(),
            processors: BTreeMap::new(),
            inflight: HashMap::new(),
        }
    }

    fn queue_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<T> {
        match priority {
            TaskPriority::High => &mut self.high,
            TaskPriority::Low => &mut self.low,
        }
    }

    fn is_queued(&self, key: &str) -> bool {
        self.high.iter().chain(self.low.iter()).any(|t| t.key() == key)
    }

    fn enqueue(&mut self, task: T, front: bool) {
        let queue = self.queue_mut(task.priority());
        if front {
            queue.push_front(task);
        } else {
            queue.push_back(task);
        }
    }

    fn release(&mut self, key: &str) -> bool {
        let Some(inflight) = self.inflight.remove(key) else {
            return false;
        };
        if let Some(slot) = self.processors.get_mut(&inflight.processor)
            && slot.as_deref() == Some(key)
        {
            *slot = None;
        }
        true
    }

    fn next_assignment(&mut self) -> Option<(T, String)> {
        let processor = self
            .processors
            .iter()
            .find(|(_, current)| current.is_none())
            .map(|(name, _)| name.clone())?;
        let task = self.high.pop_front().or_else(|| self.low.pop_front())?;
        let key = task.key();
        self.processors.insert(processor.clone(), Some(key.clone()));
        self.inflight.insert(
            key,
            InflightTask {
                processor: processor.clone(),
            },
        );
        Some((task, processor))
    }
}

impl<T> fmt::Debug for SchedulerState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerState")
            .field("high", &self.high.len())
            .field("low", &self.low.len())
            .field("processors", &self.processors.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

/// Cloneable handle; clones share one queue.
pub struct TaskScheduler<T> {
    name: &'static str,
    state: Arc<Mutex<SchedulerState<T>>>,
    notify: Arc<Notify>,
}

impl<T> Clone for TaskScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<T> fmt::Debug for TaskScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TaskScheduler");
        debug.field("name", &self.name);
        match self.state.try_lock() {
            Ok(state) => debug.field("state", &*state),
            Err(_) => debug.field("state", &"<locked>"),
        };
        debug.finish()
    }
}

impl<T: SchedulerTask> TaskScheduler<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(SchedulerState::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Drop every queued task, in-flight record and processor.
    pub async fn init(&self) {
        let mut state = self.state.lock().await;
        *state = SchedulerState::new();
    }

    pub async fn add_processor(&self, processor: &str) {
        let mut state = self.state.lock().await;
        if state.processors.contains_key(processor) {
            return;
        }
        state.processors.insert(processor.to_string(), None);
        drop(state);
        tracing::info!(target: "scan::queue", queue = self.name, processor, "processor added");
        self.notify.notify_one();
    }

    /// A task still running on the removed processor keeps its in-flight
    /// record until `task_done`.
    pub async fn del_processor(&self, processor: &str) {
        let mut state = self.state.lock().await;
        if state.processors.remove(processor).is_some() {
            tracing::info!(target: "scan::queue", queue = self.name, processor, "processor removed");
        }
    }

    /// Returns `false` when a task with the same key is already queued or in
    /// flight.
    pub async fn add_task(&self, task: T, front: bool) -> bool {
        let key = task.key();
        let mut state = self.state.lock().await;
        if state.inflight.contains_key(&key) || state.is_queued(&key) {
            tracing::trace!(target: "scan::queue", queue = self.name, key, "duplicate task ignored");
            return false;
        }
        let priority = task.priority();
        state.enqueue(task, front);
        drop(state);
        tracing::debug!(target: "scan::queue", queue = self.name, key, %priority, front, "task queued");
        self.notify.notify_one();
        true
    }

    /// Remove a task that has not been dispatched yet.
    pub async fn delete_task(&self, key: &str, priority: TaskPriority) -> bool {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(priority);
        match queue.iter().position(|t| t.key() == key) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop all queued tasks of a priority; in-flight tasks are untouched.
    pub async fn clear_task_queue(&self, priority: TaskPriority) -> usize {
        let mut state = self.state.lock().await;
        let queue = state.queue_mut(priority);
        let dropped = queue.len();
        queue.clear();
        tracing::debug!(target: "scan::queue", queue = self.name, %priority, dropped, "queue cleared");
        dropped
    }

    /// Finalize a task that answered [`TaskAction::Wait`].
    pub async fn task_done(&self, task: T, action: TaskAction) {
        let key = task.key();
        let mut state = self.state.lock().await;
        if !state.release(&key) {
            tracing::debug!(target: "scan::queue", queue = self.name, key, "task_done for unknown task");
        }
        if action == TaskAction::Requeue && !state.is_queued(&key) {
            state.enqueue(task, false);
        }
        drop(state);
        self.notify.notify_one();
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        let state = self.state.lock().await;
        state.inflight.contains_key(key) || state.is_queued(key)
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().await;
        SchedulerSnapshot {
            queued: state
                .high
                .iter()
                .chain(state.low.iter())
                .map(|t| t.key())
                .collect(),
            high: state.high.len(),
            low: state.low.len(),
            inflight: state.inflight.len(),
            processors: state.processors.len(),
            idle_processors: state.processors.values().filter(|v| v.is_none()).count(),
        }
    }

    async fn next_assignment(&self) -> Option<(T, String)> {
        self.state.lock().await.next_assignment()
    }

    async fn resolve(&self, task: T, action: TaskAction) {
        match action {
            TaskAction::Wait => {}
            TaskAction::Done | TaskAction::Requeue => self.task_done(task, action).await,
        }
    }

    /// Run the dispatch loop until `shutdown` fires.
    pub fn spawn_dispatcher(
        &self,
        handler: Arc<dyn TaskHandler<T>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                // Checked before popping so a shutdown never strands a task.
                while !shutdown.is_cancelled() {
                    let Some((task, processor)) = scheduler.next_assignment().await else {
                        break;
                    };
                    tracing::debug!(
                        target: "scan::queue",
                        queue = scheduler.name,
                        key = %task.key(),
                        processor,
                        "task dispatched"
                    );
                    let action = handler.handle(task.clone(), &processor).await;
                    scheduler.resolve(task, action).await;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(target: "scan::queue", queue = scheduler.name, "dispatcher shutting down");
                        break;
                    }
                    _ = scheduler.notify.notified() => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct TestTask {
        id: &'static str,
        priority: TaskPriority,
    }

    impl TestTask {
        fn high(id: &'static str) -> Self {
            Self {
                id,
                priority: TaskPriority::High,
            }
        }

        fn low(id: &'static str) -> Self {
            Self {
                id,
                priority: TaskPriority::Low,
            }
        }
    }

    impl SchedulerTask for TestTask {
        fn key(&self) -> String {
            self.id.to_string()
        }

        fn priority(&self) -> TaskPriority {
            self.priority
        }
    }

    struct RecordingHandler {
        action: TaskAction,
        tx: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl TaskHandler<TestTask> for RecordingHandler {
        async fn handle(&self, task: TestTask, processor: &str) -> TaskAction {
            let _ = self.tx.send((task.key(), processor.to_string()));
            self.action
        }
    }

    fn recording(action: TaskAction) -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingHandler { action, tx }), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("dispatch within timeout")
            .expect("handler alive")
    }

    #[tokio::test]
    async fn high_priority_and_front_insertion_order_dispatch() {
        let scheduler = TaskScheduler::new("test");
        assert!(scheduler.add_task(TestTask::low("l1"), false).await);
        assert!(scheduler.add_task(TestTask::high("h1"), false).await);
        assert!(scheduler.add_task(TestTask::high("h2"), true).await);
        assert!(scheduler.add_task(TestTask::low("l2"), false).await);

        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.queued, vec!["h2", "h1", "l1", "l2"]);

        let (handler, mut rx) = recording(TaskAction::Done);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn_dispatcher(handler, shutdown.clone());
        scheduler.add_processor("s1").await;

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(next(&mut rx).await.0);
        }
        assert_eq!(order, vec!["h2", "h1", "l1", "l2"]);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected_while_queued_or_inflight() {
        let scheduler = TaskScheduler::new("test");
        assert!(scheduler.add_task(TestTask::low("a"), false).await);
        assert!(!scheduler.add_task(TestTask::high("a"), false).await);

        let (handler, mut rx) = recording(TaskAction::Wait);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn_dispatcher(handler, shutdown.clone());
        scheduler.add_processor("s1").await;
        next(&mut rx).await;

        assert!(!scheduler.add_task(TestTask::low("a"), false).await);
        assert!(scheduler.is_pending("a").await);

        scheduler.task_done(TestTask::low("a"), TaskAction::Done).await;
        assert!(!scheduler.is_pending("a").await);
        assert!(scheduler.add_task(TestTask::low("a"), false).await);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn waiting_task_occupies_processor_until_done() {
        let scheduler = TaskScheduler::new("test");
        let (handler, mut rx) = recording(TaskAction::Wait);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn_dispatcher(handler, shutdown.clone());

        scheduler.add_processor("s1").await;
        scheduler.add_task(TestTask::low("a"), false).await;
        scheduler.add_task(TestTask::low("b"), false).await;

        assert_eq!(next(&mut rx).await, ("a".to_string(), "s1".to_string()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "b must wait for the busy processor");

        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.inflight, 1);
        assert_eq!(snapshot.idle_processors, 0);

        scheduler.task_done(TestTask::low("a"), TaskAction::Done).await;
        assert_eq!(next(&mut rx).await.0, "b");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn requeue_puts_task_at_the_back() {
        let scheduler = TaskScheduler::new("test");
        let (handler, mut rx) = recording(TaskAction::Wait);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn_dispatcher(handler, shutdown.clone());

        scheduler.add_task(TestTask::low("a"), false).await;
        scheduler.add_task(TestTask::low("b"), false).await;
        scheduler.add_processor("s1").await;

        assert_eq!(next(&mut rx).await.0, "a");
        scheduler.task_done(TestTask::low("a"), TaskAction::Requeue).await;
        assert_eq!(next(&mut rx).await.0, "b");
        scheduler.task_done(TestTask::low("b"), TaskAction::Done).await;
        assert_eq!(next(&mut rx).await.0, "a");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn nothing_dispatches_without_processors() {
        let scheduler = TaskScheduler::new("test");
        let (handler, mut rx) = recording(TaskAction::Done);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn_dispatcher(handler, shutdown.clone());

        scheduler.add_task(TestTask::high("a"), false).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        scheduler.add_processor("s1").await;
        assert_eq!(next(&mut rx).await.0, "a");

        scheduler.del_processor("s1").await;
        scheduler.add_task(TestTask::high("b"), false).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn delete_and_clear_only_touch_queued_tasks() {
        let scheduler = TaskScheduler::new("test");
        scheduler.add_task(TestTask::low("a"), false).await;
        scheduler.add_task(TestTask::low("b"), false).await;
        scheduler.add_task(TestTask::high("c"), false).await;

        assert!(!scheduler.delete_task("a", TaskPriority::High).await);
        assert!(scheduler.delete_task("a", TaskPriority::Low).await);
        assert!(!scheduler.delete_task("a", TaskPriority::Low).await);

        assert_eq!(scheduler.clear_task_queue(TaskPriority::Low).await, 1);
        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.queued, vec!["c"]);
        assert_eq!(snapshot.low, 0);
    }

    #[tokio::test]
    async fn shutdown_leaves_queued_tasks_in_place() {
        let scheduler = TaskScheduler::new("test");
        scheduler.add_processor("s1").await;
        scheduler.add_task(TestTask::low("a"), false).await;

        let (handler, mut rx) = recording(TaskAction::Done);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let handle = scheduler.spawn_dispatcher(handler, shutdown);
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.queued, vec!["a"]);
        assert_eq!(snapshot.inflight, 0);
        assert_eq!(snapshot.idle_processors, 1);
    }

    #[tokio::test]
    async fn one_dispatch_per_key_under_concurrent_adds() {
        let scheduler = TaskScheduler::new("test");
        let (handler, mut rx) = recording(TaskAction::Wait);
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn_dispatcher(handler, shutdown.clone());
        scheduler.add_processor("s1").await;
        scheduler.add_processor("s2").await;

        let mut joins = Vec::new();
        for _ in 0..16 {
            let scheduler = scheduler.clone();
            joins.push(tokio::spawn(async move {
                scheduler.add_task(TestTask::high("same"), false).await
            }));
        }
        let mut accepted = 0;
        for join in joins {
            if join.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        next(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.snapshot().await.idle_processors, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lidar_protocol::{Event, TaskId, TaskInfo};

use crate::error::LidarError;
use crate::remote::{RemoteChannel, RemoteError};

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write end of a task's event buffer. Held only by the executor; dropping
/// it tells a waiting subscriber no more events will arrive.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn push(&self, event: Event) {
        // The receiver lives as long as the registry entry. If the entry
        // was evicted nobody can read the event anyway.
        let _ = self.tx.send(event);
    }
}

/// Shared state of one task.
pub struct TaskState {
    pub id: TaskId,
    pub template: String,
    pub command: String,
    pub filename: Option<String>,
    created_at: SystemTime,
    cancel_requested: AtomicBool,
    completed: AtomicBool,
    completed_at: Mutex<Option<Instant>>,
    /// The open command channel, reachable from `close_channel` so it can be closed
    /// from outside the executor.
    channel: Mutex<Option<Box<dyn RemoteChannel>>>,
    pub(crate) events: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl TaskState {
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Set the cancellation flag. Never blocks; the executor notices the
    /// flag on its next poll and closes the channel itself. Returns `false`
    /// if cancellation was already requested.
    pub fn request_cancel(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::SeqCst);
        if first {
            info!(task_id = %self.id, "cancellation requested");
        }
        first
    }

    /// Close the open channel, if any. Blocks on remote I/O and waits for
    /// the executor's current poll, so call it from a blocking context.
    /// A failure is logged and returned; the executor retries the close.
    pub fn close_channel(&self) -> Option<Result<(), RemoteError>> {
        let result = lock(&self.channel).as_mut().map(|channel| channel.close());
        if let Some(Err(err)) = &result {
            warn!(task_id = %self.id, "closing channel on cancel failed: {err}");
        }
        result
    }

    pub(crate) fn attach_channel(&self, channel: Box<dyn RemoteChannel>) {
        *lock(&self.channel) = Some(channel);
    }

    /// Run `f` against the open channel. Returns `None` if no channel is
    /// attached.
    pub(crate) fn with_channel<R>(&self, f: impl FnOnce(&mut dyn RemoteChannel) -> R) -> Option<R> {
        lock(&self.channel).as_mut().map(|c| f(c.as_mut()))
    }

    pub(crate) fn detach_channel(&self) -> Option<Box<dyn RemoteChannel>> {
        lock(&self.channel).take()
    }

    /// Flip `completed` to true. Returns `false` if it already was.
    pub(crate) fn mark_completed(&self) -> bool {
        let mut completed_at = lock(&self.completed_at);
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *completed_at = Some(Instant::now());
        true
    }

    fn completed_before(&self, cutoff: Instant) -> bool {
        lock(&self.completed_at).is_some_and(|at| at <= cutoff)
    }

    pub fn to_info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            template: self.template.clone(),
            command: self.command.clone(),
            filename: self.filename.clone(),
            cancel_requested: self.is_cancel_requested(),
            completed: self.is_completed(),
            created_at_epoch_ms: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Table of tasks by id. Entries stay until [`TaskRegistry::evict_completed`]
/// removes them.
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Register a new task and return it together with the write end of its
    /// event buffer.
    pub fn create(
        &self,
        template: &str,
        command: String,
        filename: Option<String>,
    ) -> (Arc<TaskState>, EventSink) {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = Arc::new(TaskState {
            id: id.clone(),
            template: template.to_string(),
            command,
            filename,
            created_at: SystemTime::now(),
            cancel_requested: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            completed_at: Mutex::new(None),
            channel: Mutex::new(None),
            events: tokio::sync::Mutex::new(rx),
        });
        self.tasks.insert(id.clone(), Arc::clone(&task));
        debug!(task_id = %id, template, "task registered");
        (task, EventSink { tx })
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskState>> {
        self.tasks.get(task_id).map(|t| Arc::clone(t.value()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Request cancellation and return the task. Idempotent, and fine on
    /// completed tasks.
    pub fn cancel(&self, task_id: &str) -> Result<Arc<TaskState>, LidarError> {
        let task = self
            .get(task_id)
            .ok_or_else(|| LidarError::TaskNotFound(task_id.to_string()))?;
        task.request_cancel();
        Ok(task)
    }

    pub fn info(&self, task_id: &str) -> Result<TaskInfo, LidarError> {
        self.get(task_id)
            .map(|t| t.to_info())
            .ok_or_else(|| LidarError::TaskNotFound(task_id.to_string()))
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|t| t.value().to_info()).collect();
        tasks.sort_by_key(|t| t.created_at_epoch_ms);
        tasks
    }

    /// Drop completed tasks whose completion is at least `ttl` old. Running
    /// tasks are never evicted. Returns the number removed.
    pub fn evict_completed(&self, ttl: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(ttl) else {
            return 0;
        };
        let before = self.tasks.len();
        self.tasks.retain(|_, task| !task.completed_before(cutoff));
        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            info!(evicted, remaining = self.tasks.len(), "evicted completed tasks");
        }
        evicted
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::scripted::{ScriptedConnector, Step};
    use crate::remote::RemoteConnector;

    #[test]
    fn create_and_lookup() {
        let registry = TaskRegistry::new();
        let (task, _sink) = registry.create("lidar_test", "python lidar.py".to_string(), None);

        assert_eq!(registry.len(), 1);
        let found = registry.get(&task.id).unwrap();
        assert_eq!(found.command, "python lidar.py");
        assert!(!found.is_completed());
        assert!(!found.is_cancel_requested());
        assert_eq!(task.id.len(), 32);
    }

    #[test]
    fn cancel_unknown_task_is_not_found() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.cancel("missing"),
            Err(LidarError::TaskNotFound(_))
        ));
    }

    #[test]
    fn cancel_is_idempotent_and_ok_after_completion() {
        let registry = TaskRegistry::new();
        let (task, _sink) = registry.create("scan", "python scan.py".to_string(), None);

        registry.cancel(&task.id).unwrap();
        registry.cancel(&task.id).unwrap();
        assert!(task.is_cancel_requested());

        assert!(task.mark_completed());
        registry.cancel(&task.id).unwrap();
    }

    #[test]
    fn cancel_only_sets_the_flag() {
        let connector = ScriptedConnector::new(vec![Step::Hang]);
        let stats = connector.stats();
        let channel = connector.connect().unwrap().execute("python scan.py").unwrap();

        let registry = TaskRegistry::new();
        let (task, _sink) = registry.create("scan", "python scan.py".to_string(), None);
        task.attach_channel(channel);

        assert!(registry.cancel(&task.id).unwrap().is_cancel_requested());
        assert_eq!(stats.closes(), 0);

        assert!(matches!(task.close_channel(), Some(Ok(()))));
        assert_eq!(stats.closes(), 1);
    }

    #[test]
    fn close_channel_reports_errors_and_tolerates_no_channel() {
        let registry = TaskRegistry::new();
        let (task, _sink) = registry.create("scan", "python scan.py".to_string(), None);
        assert!(task.close_channel().is_none());

        let connector = ScriptedConnector::new(vec![Step::Hang])
            .with_close_error(RemoteError::Channel("socket gone".to_string()));
        task.attach_channel(connector.connect().unwrap().execute("python scan.py").unwrap());

        assert!(registry.cancel(&task.id).is_ok());
        assert!(matches!(task.close_channel(), Some(Err(RemoteError::Channel(_)))));
    }

    #[test]
    fn mark_completed_only_once() {
        let registry = TaskRegistry::new();
        let (task, _sink) = registry.create("lidar_test", "python lidar.py".to_string(), None);
        assert!(task.mark_completed());
        assert!(!task.mark_completed());
        assert!(task.is_completed());
    }

    #[test]
    fn eviction_skips_running_and_recent_tasks() {
        let registry = TaskRegistry::new();
        let (running, _s1) = registry.create("scan", "a".to_string(), None);
        let (done, _s2) = registry.create("scan", "b".to_string(), None);
        done.mark_completed();

        assert_eq!(registry.evict_completed(Duration::from_secs(3600)), 0);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.evict_completed(Duration::ZERO), 1);
        assert!(registry.get(&done.id).is_none());
        assert!(registry.get(&running.id).is_some());
    }

    #[test]
    fn info_reports_flags() {
        let registry = TaskRegistry::new();
        let (task, _sink) = registry.create(
            "scan",
            "python scan.py".to_string(),
            Some("scan_20240101_000000.txt".to_string()),
        );
        task.request_cancel();
        let info = registry.info(&task.id).unwrap();
        assert!(info.cancel_requested);
        assert!(!info.completed);
        assert_eq!(info.filename.as_deref(), Some("scan_20240101_000000.txt"));
        assert_eq!(registry.list().len(), 1);
    }
}

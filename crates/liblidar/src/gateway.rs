//! Consumer side of a task's event buffer.

use std::sync::Arc;

use lidar_protocol::Event;

use crate::registry::TaskState;

/// Reads one task's events in order until the task has completed and the
/// buffer is empty.
///
/// Only one drain makes progress at a time: a second drain on the same task
/// waits for the first to hand the buffer back between events. Events a
/// drain never returned stay buffered for the next subscriber.
pub struct EventDrain {
    task: Arc<TaskState>,
    finished: bool,
}

impl EventDrain {
    pub fn new(task: Arc<TaskState>) -> Self {
        Self {
            task,
            finished: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// Next event, or `None` once the stream has ended. Cancel-safe: an event
    /// is only removed from the buffer when it is returned.
    pub async fn next(&mut self) -> Option<Event> {
        if self.finished {
            return None;
        }
        let mut rx = self.task.events.lock().await;
        if self.task.is_completed() && rx.is_empty() {
            self.finished = true;
            return None;
        }
        match rx.recv().await {
            Some(event) => {
                if self.task.is_completed() && rx.is_empty() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// True once [`EventDrain::next`] has observed the end of the stream.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

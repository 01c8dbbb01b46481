//! Drives one remote command per task and turns what it observes into events.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lidar_protocol::Event;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{EventSink, TaskState};
use crate::remote::{RemoteChannel, RemoteConnector, RemoteError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const INTERRUPTED: &str = "[!] interrupted by user";

pub fn finished_text(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("[+] command finished (exit={code})"),
        None => "[+] command finished (exit=unknown)".to_string(),
    }
}

fn failed_text(reason: &str) -> String {
    format!("[!] task failed: {reason}")
}

fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

enum Progress {
    Running,
    Exited,
}

/// Push whatever one poll pair returns, then report whether the channel has
/// reached end of stream. Output still buffered at that point is drained
/// first.
fn poll_pair(channel: &mut dyn RemoteChannel, sink: &EventSink) -> Result<Progress, RemoteError> {
    if let Some(chunk) = channel.poll_stdout()? {
        sink.push(Event::stdout(decode(chunk)));
    }
    if let Some(chunk) = channel.poll_stderr()? {
        sink.push(Event::stderr(decode(chunk)));
    }
    if !channel.is_exit_ready() {
        return Ok(Progress::Running);
    }
    loop {
        let out = channel.poll_stdout()?;
        let err = channel.poll_stderr()?;
        if out.is_none() && err.is_none() {
            break;
        }
        if let Some(chunk) = out {
            sink.push(Event::stdout(decode(chunk)));
        }
        if let Some(chunk) = err {
            sink.push(Event::stderr(decode(chunk)));
        }
    }
    Ok(Progress::Exited)
}

/// Runs tasks on tokio's blocking pool.
#[derive(Clone)]
pub struct TaskExecutor {
    connector: Arc<dyn RemoteConnector>,
    poll_interval: Duration,
}

impl TaskExecutor {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            connector,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn connector(&self) -> Arc<dyn RemoteConnector> {
        Arc::clone(&self.connector)
    }

    pub fn spawn(&self, task: Arc<TaskState>, sink: EventSink) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.run(&task, sink))
    }

    /// Run `task` to completion on the current thread. Marks the task
    /// completed exactly once, after its last event.
    pub fn run(&self, task: &TaskState, sink: EventSink) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drive(task, &sink)));
        if let Err(payload) = outcome {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "executor panicked".to_string());
            error!(task_id = %task.id, "executor panicked: {reason}");
            sink.push(Event::stderr(format!("executor panicked: {reason}")));
            sink.push(Event::info(failed_text(&reason)));
        }

        drop(task.detach_channel());
        task.mark_completed();
        // Closing the sender wakes a waiting subscriber with end-of-stream.
        drop(sink);
        debug!(task_id = %task.id, "task completed");
    }

    fn drive(&self, task: &TaskState, sink: &EventSink) {
        if task.is_cancel_requested() {
            info!(task_id = %task.id, "cancelled before connecting");
            sink.push(Event::info(INTERRUPTED));
            return;
        }

        let mut session = match self.connector.connect() {
            Ok(session) => session,
            Err(err) => {
                warn!(task_id = %task.id, "{err}");
                fail(sink, &err);
                return;
            }
        };
        let channel = match session.execute(&task.command) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(task_id = %task.id, "{err}");
                fail(sink, &err);
                return;
            }
        };
        info!(task_id = %task.id, command = %task.command, "command started");
        task.attach_channel(channel);

        self.pump(task, sink);

        // The channel may borrow the session's transport.
        drop(task.detach_channel());
        drop(session);
    }

    fn pump(&self, task: &TaskState, sink: &EventSink) {
        loop {
            let progress = task.with_channel(|channel| poll_pair(channel, sink));
            match progress {
                None => {
                    // Only `run` detaches, so this is unreachable in practice.
                    sink.push(Event::info(failed_text("channel detached")));
                    return;
                }
                Some(Err(err)) => {
                    warn!(task_id = %task.id, "{err}");
                    fail(sink, &err);
                    return;
                }
                Some(Ok(Progress::Exited)) => {
                    // A close issued for the cancel also ends the stream, so
                    // the flag wins over whatever status the transport reports.
                    if task.is_cancel_requested() {
                        interrupt(task, sink);
                        return;
                    }
                    let code = task.with_channel(|channel| channel.exit_status()).flatten();
                    info!(task_id = %task.id, exit = ?code, "command finished");
                    sink.push(Event::info(finished_text(code)));
                    return;
                }
                Some(Ok(Progress::Running)) => {}
            }

            if task.is_cancel_requested() {
                interrupt(task, sink);
                return;
            }

            thread::sleep(self.poll_interval);
        }
    }
}

/// Close the channel if it is still open and end the stream as interrupted.
fn interrupt(task: &TaskState, sink: &EventSink) {
    if let Some(Err(err)) = task.with_channel(|channel| channel.close()) {
        warn!(task_id = %task.id, "close after cancel failed: {err}");
        sink.push(Event::info(format!("[!] closing remote channel failed: {err}")));
    }
    info!(task_id = %task.id, "command interrupted");
    sink.push(Event::info(INTERRUPTED));
}

fn fail(sink: &EventSink, err: &RemoteError) {
    sink.push(Event::stderr(err.to_string()));
    sink.push(Event::info(failed_text(&err.to_string())));
}

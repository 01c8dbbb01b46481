//! A remote client that plays back a fixed script. Test support only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{RemoteChannel, RemoteConnector, RemoteError, RemoteSession};

/// One scripted observation. Steps are consumed strictly in order: a poll
/// only returns data when the step at the front matches its stream.
#[derive(Debug, Clone)]
pub enum Step {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The command exits with this status.
    Exit(Option<i32>),
    /// The command never finishes on its own.
    Hang,
}

impl Step {
    pub fn out(text: &str) -> Self {
        Step::Stdout(text.as_bytes().to_vec())
    }

    pub fn err(text: &str) -> Self {
        Step::Stderr(text.as_bytes().to_vec())
    }
}

/// Counters shared by every session a [`ScriptedConnector`] hands out.
#[derive(Debug, Default)]
pub struct ScriptStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    commands: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
}

impl ScriptStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Vec<Step>,
    connect_error: Option<RemoteError>,
    connect_delay: Duration,
    poll_delay: Duration,
    close_error: Option<RemoteError>,
    files: HashMap<String, Vec<u8>>,
    transfer_error: Option<RemoteError>,
    stats: Arc<ScriptStats>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn failing(err: RemoteError) -> Self {
        Self {
            connect_error: Some(err),
            ..Self::default()
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Sleep inside every poll call.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_close_error(mut self, err: RemoteError) -> Self {
        self.close_error = Some(err);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), bytes.into());
        self
    }

    pub fn with_transfer_error(mut self, err: RemoteError) -> Self {
        self.transfer_error = Some(err);
        self
    }

    pub fn stats(&self) -> Arc<ScriptStats> {
        Arc::clone(&self.stats)
    }
}

impl RemoteConnector for ScriptedConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if !self.connect_delay.is_zero() {
            thread::sleep(self.connect_delay);
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        Ok(Box::new(ScriptedSession {
            connector: self.clone(),
        }))
    }
}

struct ScriptedSession {
    connector: ScriptedConnector,
}

impl RemoteSession for ScriptedSession {
    fn execute(&mut self, command: &str) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        if let Ok(mut commands) = self.connector.stats.commands.lock() {
            commands.push(command.to_string());
        }
        Ok(Box::new(ScriptedChannel {
            steps: self.connector.script.iter().cloned().collect(),
            poll_delay: self.connector.poll_delay,
            close_error: self.connector.close_error.clone(),
            closed: false,
            stats: Arc::clone(&self.connector.stats),
        }))
    }

    fn fetch_file(&mut self, remote_path: &str) -> Result<Vec<u8>, RemoteError> {
        if let Ok(mut fetched) = self.connector.stats.fetched.lock() {
            fetched.push(remote_path.to_string());
        }
        if let Some(err) = &self.connector.transfer_error {
            return Err(err.clone());
        }
        self.connector
            .files
            .get(remote_path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_path.to_string()))
    }
}

struct ScriptedChannel {
    steps: VecDeque<Step>,
    poll_delay: Duration,
    close_error: Option<RemoteError>,
    closed: bool,
    stats: Arc<ScriptStats>,
}

impl ScriptedChannel {
    fn pause(&self) {
        if !self.poll_delay.is_zero() {
            thread::sleep(self.poll_delay);
        }
    }
}

impl RemoteChannel for ScriptedChannel {
    fn poll_stdout(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        self.pause();
        if self.closed || !matches!(self.steps.front(), Some(Step::Stdout(_))) {
            return Ok(None);
        }
        match self.steps.pop_front() {
            Some(Step::Stdout(bytes)) => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    fn poll_stderr(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        self.pause();
        if self.closed || !matches!(self.steps.front(), Some(Step::Stderr(_))) {
            return Ok(None);
        }
        match self.steps.pop_front() {
            Some(Step::Stderr(bytes)) => Ok(Some(bytes)),
            _ => Ok(None),
        }
    }

    // A closed channel looks exited with status 0, which is what an SSH
    // channel reports after a local close.
    fn is_exit_ready(&mut self) -> bool {
        self.closed || matches!(self.steps.front(), None | Some(Step::Exit(_)))
    }

    fn exit_status(&mut self) -> Option<i32> {
        if self.closed {
            return Some(0);
        }
        match self.steps.front() {
            Some(Step::Exit(code)) => *code,
            _ => None,
        }
    }

    fn close(&mut self) -> Result<(), RemoteError> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.close_error {
            return Err(err.clone());
        }
        self.closed = true;
        Ok(())
    }
}

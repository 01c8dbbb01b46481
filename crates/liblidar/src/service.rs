//! Operations the HTTP layer exposes: submit, cancel, fetch, probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lidar_protocol::{TaskId, TaskInfo};
use tracing::{debug, info, warn};

use crate::error::LidarError;
use crate::executor::TaskExecutor;
use crate::gateway::EventDrain;
use crate::registry::TaskRegistry;
use crate::remote::{RemoteChannel, RemoteConfig, RemoteConnector, RemoteError};
use crate::template::{self, TemplateSet};

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub task_id: TaskId,
    pub filename: Option<String>,
}

/// Reject anything that could escape the artifact directory.
pub fn validate_filename(filename: &str) -> Result<(), LidarError> {
    let invalid = filename.trim().is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
        || filename.contains('\0');
    if invalid {
        return Err(LidarError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

pub struct TaskService {
    registry: Arc<TaskRegistry>,
    executor: TaskExecutor,
    templates: TemplateSet,
    remote: RemoteConfig,
}

impl TaskService {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        remote: RemoteConfig,
        templates: TemplateSet,
    ) -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new()),
            executor: TaskExecutor::new(connector),
            templates,
            remote,
        }
    }

    /// Build a service whose connector follows `remote.transport`.
    pub fn from_config(remote: RemoteConfig, templates: TemplateSet) -> Self {
        let connector = remote.connector();
        Self::new(connector, remote, templates)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.executor = self.executor.with_poll_interval(poll_interval);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// Validate, register and start a task. Returns as soon as the executor
    /// is spawned. Nothing is registered when validation fails.
    pub fn submit(
        &self,
        template_name: &str,
        params: &HashMap<String, String>,
    ) -> Result<Submission, LidarError> {
        let template = self.templates.get(template_name)?;
        let filename = template
            .artifact
            .then(|| template::artifact_filename(&chrono::Local::now()));
        let program = template.render(params, filename.as_deref())?;
        let command = self.remote.wrap_command(&program);

        let (task, sink) = self
            .registry
            .create(template_name, command, filename.clone());
        info!(task_id = %task.id, template = template_name, filename = ?filename, "task submitted");
        let task_id = task.id.clone();
        self.executor.spawn(task, sink);

        Ok(Submission { task_id, filename })
    }

    /// Flag the task for cancellation and close its channel on the blocking
    /// pool. Returns without waiting on the remote; the executor emits the
    /// interrupted event once it sees the flag.
    pub fn cancel(&self, task_id: &str) -> Result<(), LidarError> {
        let task = self.registry.cancel(task_id)?;
        if task.is_completed() {
            return Ok(());
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || task.close_channel());
            }
            Err(_) => debug!(task_id, "no runtime for out-of-band close; executor will close"),
        }
        Ok(())
    }

    pub fn task_info(&self, task_id: &str) -> Result<TaskInfo, LidarError> {
        self.registry.info(task_id)
    }

    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        self.registry.list()
    }

    /// Attach a consumer to a task's event stream.
    pub fn subscribe(&self, task_id: &str) -> Result<EventDrain, LidarError> {
        self.registry
            .get(task_id)
            .map(EventDrain::new)
            .ok_or_else(|| LidarError::TaskNotFound(task_id.to_string()))
    }

    pub fn evict_completed(&self, ttl: Duration) -> usize {
        self.registry.evict_completed(ttl)
    }

    /// Read a scan artifact over a fresh session. Task state is not touched.
    pub async fn fetch_artifact(&self, filename: &str) -> Result<Vec<u8>, LidarError> {
        validate_filename(filename)?;
        let remote_path = self.remote.artifact_path(filename);
        let connector = self.executor.connector();
        let limit = self.remote.connect_timeout() + self.remote.transfer_timeout();

        debug!(filename, remote_path = %remote_path, "fetching artifact");
        let job = tokio::task::spawn_blocking(move || {
            let mut session = connector.connect()?;
            session.fetch_file(&remote_path)
        });
        let result = match tokio::time::timeout(limit, job).await {
            Err(_) => Err(RemoteError::Transfer(format!(
                "no response within {}s",
                limit.as_secs()
            ))),
            Ok(Err(join)) => Err(RemoteError::Transfer(format!("transfer aborted: {join}"))),
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(bytes) => {
                info!(filename, bytes = bytes.len(), "artifact fetched");
                Ok(bytes)
            }
            Err(err) => {
                warn!(filename, "artifact fetch failed: {err}");
                Err(LidarError::from_fetch(filename, err))
            }
        }
    }

    /// Check that the device is reachable and its working directory exists.
    pub async fn probe(&self) -> Result<(), LidarError> {
        let connector = self.executor.connector();
        let command = format!(
            "cd {} && pwd",
            shell_escape::escape(self.remote.remote_dir.as_str().into())
        );
        let limit = self.remote.connect_timeout() * 2;

        let job = tokio::task::spawn_blocking(move || -> Result<Option<i32>, RemoteError> {
            let mut session = connector.connect()?;
            let mut channel = session.execute(&command)?;
            let code = wait_for_exit(channel.as_mut(), limit);
            let _ = channel.close();
            code
        });
        let code = match tokio::time::timeout(limit, job).await {
            Err(_) => Err(RemoteError::Connect("probe timed out".to_string())),
            Ok(Err(join)) => Err(RemoteError::Connect(format!("probe aborted: {join}"))),
            Ok(Ok(result)) => result,
        }
        .map_err(|err| LidarError::RemoteUnavailable(err.to_string()))?;

        match code {
            Some(0) => {
                debug!("probe ok");
                Ok(())
            }
            other => Err(LidarError::RemoteUnavailable(match other {
                Some(code) => format!("working directory check exited with {code}"),
                None => "working directory check did not report an exit status".to_string(),
            })),
        }
    }
}

fn wait_for_exit(
    channel: &mut dyn RemoteChannel,
    limit: Duration,
) -> Result<Option<i32>, RemoteError> {
    let deadline = std::time::Instant::now() + limit;
    loop {
        channel.poll_stdout()?;
        channel.poll_stderr()?;
        if channel.is_exit_ready() {
            return Ok(channel.exit_status());
        }
        if std::time::Instant::now() >= deadline {
            return Err(RemoteError::Channel("command did not exit".to_string()));
        }
        std::thread::sleep(crate::executor::DEFAULT_POLL_INTERVAL);
    }
}

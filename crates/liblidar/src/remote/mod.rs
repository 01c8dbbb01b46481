//! Remote session client.
//!
//! A [`RemoteConnector`] opens one [`RemoteSession`] per use. A session runs a
//! single command through a [`RemoteChannel`] or fetches a single file. All
//! calls are blocking-style and are only ever made from blocking execution
//! contexts; channel polls never wait for data.

pub mod local;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use local::LocalConnector;
pub use ssh::SshConnector;

/// Maximum number of bytes returned by a single channel poll.
pub const POLL_CHUNK_BYTES: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The host could not be reached, the handshake failed or
    /// authentication was refused.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The command channel broke while the command was running.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("transfer failed: {0}")]
    Transfer(String),
}

pub trait RemoteConnector: Send + Sync + 'static {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

pub trait RemoteSession: Send {
    /// Start `command` and return the channel bound to it.
    fn execute(&mut self, command: &str) -> Result<Box<dyn RemoteChannel>, RemoteError>;

    /// Read a whole file from the remote filesystem.
    fn fetch_file(&mut self, remote_path: &str) -> Result<Vec<u8>, RemoteError>;
}

pub trait RemoteChannel: Send {
    /// Next available stdout chunk, `None` when nothing is buffered.
    fn poll_stdout(&mut self) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Next available stderr chunk, `None` when nothing is buffered.
    fn poll_stderr(&mut self) -> Result<Option<Vec<u8>>, RemoteError>;

    /// True once the command has terminated and its exit status can be read.
    fn is_exit_ready(&mut self) -> bool;

    /// Exit status of a terminated command, `None` if it is unknown.
    fn exit_status(&mut self) -> Option<i32>;

    /// Abandon the command. Calling this more than once is harmless.
    fn close(&mut self) -> Result<(), RemoteError>;
}

/// How commands reach the device.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Ssh,
    /// Run commands on this machine. Used on the bench without the rig.
    Local,
}

/// Connection settings for the device.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Working directory of the device programs.
    pub remote_dir: String,
    /// Shell snippet that prepares the runtime environment; empty to skip.
    pub activate: String,
    pub connect_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    /// Expected SHA-256 host key fingerprint (hex). Any key is accepted when unset.
    pub host_key_sha256: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Ssh,
            host: "192.168.0.101".to_string(),
            port: 22,
            user: "vr".to_string(),
            password: String::new(),
            remote_dir: "/home/vr/Desktop/lidar".to_string(),
            activate: "source .venv/bin/activate".to_string(),
            connect_timeout_secs: 10,
            transfer_timeout_secs: 30,
            host_key_sha256: None,
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs.max(1))
    }

    /// Wrap a program invocation so it runs inside the remote working
    /// directory with the runtime environment activated.
    pub fn wrap_command(&self, program: &str) -> String {
        let mut parts = vec![format!("cd {}", shell_escape::escape(self.remote_dir.as_str().into()))];
        let activate = self.activate.trim();
        if !activate.is_empty() {
            parts.push(activate.to_string());
        }
        parts.push(program.to_string());
        parts.join(" && ")
    }

    /// Remote path of an artifact written by a scan.
    pub fn artifact_path(&self, filename: &str) -> String {
        format!(
            "{}/{}/{}",
            self.remote_dir.trim_end_matches('/'),
            lidar_protocol::ARTIFACT_DIR,
            filename
        )
    }

    /// Build the connector selected by `transport`.
    pub fn connector(&self) -> Arc<dyn RemoteConnector> {
        match self.transport {
            Transport::Ssh => Arc::new(SshConnector::new(self.clone())),
            Transport::Local => Arc::new(LocalConnector::new()),
        }
    }
}

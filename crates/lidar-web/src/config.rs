use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use liblidar::{CommandTemplate, RemoteConfig, Transport};
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[command(name = "lidar-web", version, about = "HTTP and WebSocket bridge to a remote LIDAR rig")]
pub struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/lidar/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Allowed CORS origin, repeatable. `*` allows any.
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,

    #[arg(long, env = "LIDAR_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "LIDAR_USER")]
    pub user: Option<String>,

    #[arg(long, env = "LIDAR_PASS", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, env = "LIDAR_REMOTE_PATH")]
    pub remote_dir: Option<String>,

    /// Run commands on this machine instead of over SSH.
    #[arg(long)]
    pub local: bool,

    #[arg(long, env = "LIDAR_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub listen: SocketAddr,
    pub allow_origins: Vec<String>,
    /// Bearer token required on every API call. Unset means open access.
    pub api_token: Option<String>,
    pub poll_interval_ms: u64,
    /// How long a completed task stays queryable.
    pub task_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub remote: RemoteConfig,
    /// Extra or replacement command templates.
    pub templates: BTreeMap<String, CommandTemplate>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            allow_origins: vec!["http://localhost:3000".to_string()],
            api_token: None,
            poll_interval_ms: 50,
            task_ttl_secs: 3600,
            sweep_interval_secs: 60,
            remote: RemoteConfig::default(),
            templates: BTreeMap::new(),
        }
    }
}

impl WebConfig {
    /// Load `path`, or the default config file if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = lidar_protocol::paths::config_file_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Command line and environment win over the file.
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if !cli.allow_origins.is_empty() {
            self.allow_origins = cli.allow_origins.clone();
        }
        if let Some(host) = &cli.host {
            self.remote.host = host.clone();
        }
        if let Some(user) = &cli.user {
            self.remote.user = user.clone();
        }
        if let Some(password) = &cli.password {
            self.remote.password = password.clone();
        }
        if let Some(dir) = &cli.remote_dir {
            self.remote.remote_dir = dir.clone();
        }
        if cli.local {
            self.remote.transport = Transport::Local;
        }
        if let Some(token) = &cli.api_token {
            self.api_token = Some(token.clone());
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

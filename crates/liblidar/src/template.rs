//! Named command lines with `{param}` placeholders.
//!
//! `{artifact}` is reserved: it is filled with the artifact filename computed
//! at submission time and is never taken from request parameters.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone};
use serde::Deserialize;

use crate::error::LidarError;

pub const ARTIFACT_PLACEHOLDER: &str = "artifact";

pub const LIDAR_TEST: &str = "lidar_test";
pub const ENGINE_TEST: &str = "engine_test";
pub const SCAN: &str = "scan";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub command: String,
    /// Whether the program writes a scan artifact.
    #[serde(default)]
    pub artifact: bool,
}

enum Piece<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn pieces(command: &str) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    let mut rest = command;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_param_name(&after[..close]) => {
                if open > 0 {
                    out.push(Piece::Literal(&rest[..open]));
                }
                out.push(Piece::Param(&after[..close]));
                rest = &after[close + 1..];
            }
            _ => {
                out.push(Piece::Literal(&rest[..=open]));
                rest = after;
            }
        }
    }
    if !rest.is_empty() {
        out.push(Piece::Literal(rest));
    }
    out
}

impl CommandTemplate {
    pub fn new(command: impl Into<String>, artifact: bool) -> Self {
        Self {
            command: command.into(),
            artifact,
        }
    }

    /// Parameter names the caller must supply, in first-use order.
    pub fn required_params(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for piece in pieces(&self.command) {
            if let Piece::Param(name) = piece {
                if name != ARTIFACT_PLACEHOLDER && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute parameters into the command line. Values are shell-quoted.
    /// A parameter that is absent or blank is a validation error.
    pub fn render(
        &self,
        params: &HashMap<String, String>,
        artifact: Option<&str>,
    ) -> Result<String, LidarError> {
        let missing: Vec<&str> = self
            .required_params()
            .into_iter()
            .filter(|name| params.get(*name).is_none_or(|v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(LidarError::MissingParameter(missing.join(", ")));
        }

        let mut rendered = String::with_capacity(self.command.len());
        for piece in pieces(&self.command) {
            match piece {
                Piece::Literal(text) => rendered.push_str(text),
                Piece::Param(ARTIFACT_PLACEHOLDER) => {
                    let name = artifact.ok_or_else(|| {
                        LidarError::MissingParameter(ARTIFACT_PLACEHOLDER.to_string())
                    })?;
                    rendered.push_str(&shell_escape::escape(name.into()));
                }
                Piece::Param(name) => {
                    let value = params.get(name).map(|v| v.trim()).unwrap_or_default();
                    rendered.push_str(&shell_escape::escape(value.into()));
                }
            }
        }
        Ok(rendered)
    }
}

/// Filename a scan started at `at` writes its point cloud to.
pub fn artifact_filename<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("scan_{}.txt", at.format("%Y%m%d_%H%M%S"))
}

/// The templates a server accepts, by name.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, CommandTemplate>,
}

impl TemplateSet {
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            LIDAR_TEST.to_string(),
            CommandTemplate::new("python lidar.py", false),
        );
        templates.insert(
            ENGINE_TEST.to_string(),
            CommandTemplate::new("python engine.py", false),
        );
        templates.insert(
            SCAN.to_string(),
            CommandTemplate::new(
                "python scan.py --scan_range {scan_range} --scan_step {scan_step} \
                 --lidar_duration {lidar_duration} --pulse_delay {pulse_delay} \
                 --filename scans/{artifact}",
                true,
            ),
        );
        Self { templates }
    }

    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Add or replace templates.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, CommandTemplate>) -> Self {
        self.templates.extend(overrides);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, template: CommandTemplate) {
        self.templates.insert(name.into(), template);
    }

    pub fn get(&self, name: &str) -> Result<&CommandTemplate, LidarError> {
        self.templates
            .get(name)
            .ok_or_else(|| LidarError::UnknownTemplate(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::builtin()
    }
}

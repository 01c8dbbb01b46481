pub mod paths;

use serde::{Deserialize, Serialize};

/// Unique identifier for a task.
pub type TaskId = String;

/// Subdirectory of the remote working directory that holds scan artifacts.
pub const ARTIFACT_DIR: &str = "scans";

/// Which stream an event came from.
///
/// The wire names are the short tags the browser log view switches on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "out")]
    Stdout,
    #[serde(rename = "err")]
    Stderr,
    #[serde(rename = "info")]
    Info,
}

/// One unit of relayed output, pushed to event stream subscribers.
///
/// `text` is a decoded fragment and is not guaranteed to end on a line
/// boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub text: String,
}

impl Event {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Stderr,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Info,
            text: text.into(),
        }
    }
}

/// Returned by every submit route.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Body of the stop route.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CancelRequest {
    pub task_id: TaskId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// Error body returned with every non-2xx response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TaskNotFound,
    UnknownTemplate,
    MissingParameter,
    InvalidFilename,
    ArtifactNotFound,
    TransferFailed,
    RemoteUnavailable,
    Unauthorized,
    InvalidRequest,
    ServerError,
}

/// Status snapshot of a task.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub template: String,
    pub command: String,
    pub filename: Option<String>,
    pub cancel_requested: bool,
    pub completed: bool,
    pub created_at_epoch_ms: u64,
}

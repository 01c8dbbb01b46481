use lidar_protocol::{ErrorCode, TaskId};
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum LidarError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("unknown task template: {0}")]
    UnknownTemplate(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("artifact transfer failed: {0}")]
    Transfer(String),

    #[error("remote host unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LidarError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            LidarError::TaskNotFound(_) => (ErrorCode::TaskNotFound, self.to_string()),
            LidarError::UnknownTemplate(_) => (ErrorCode::UnknownTemplate, self.to_string()),
            LidarError::MissingParameter(_) => (ErrorCode::MissingParameter, self.to_string()),
            LidarError::InvalidFilename(_) => (ErrorCode::InvalidFilename, self.to_string()),
            LidarError::ArtifactNotFound(_) => (ErrorCode::ArtifactNotFound, self.to_string()),
            LidarError::Transfer(_) => (ErrorCode::TransferFailed, self.to_string()),
            LidarError::RemoteUnavailable(_) => (ErrorCode::RemoteUnavailable, self.to_string()),
            LidarError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }

    /// Classify a failed artifact fetch.
    pub(crate) fn from_fetch(filename: &str, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(_) => LidarError::ArtifactNotFound(filename.to_string()),
            RemoteError::Connect(reason) => LidarError::RemoteUnavailable(reason),
            RemoteError::Channel(reason) | RemoteError::Transfer(reason) => {
                LidarError::Transfer(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_keep_not_found_distinct() {
        let err = LidarError::from_fetch(
            "scan_1.txt",
            RemoteError::NotFound("/srv/scans/scan_1.txt".to_string()),
        );
        assert!(matches!(err, LidarError::ArtifactNotFound(ref f) if f == "scan_1.txt"));
        assert_eq!(err.to_error_code().0, ErrorCode::ArtifactNotFound);

        let err = LidarError::from_fetch("scan_1.txt", RemoteError::Transfer("eof".to_string()));
        assert_eq!(err.to_error_code().0, ErrorCode::TransferFailed);
    }

    #[test]
    fn io_errors_are_sanitized() {
        let err = LidarError::Io(std::io::Error::other("/secret/path exploded"));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::ServerError);
        assert!(!message.contains("/secret"));
    }
}

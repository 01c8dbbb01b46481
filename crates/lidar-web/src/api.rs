use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use liblidar::template::{ENGINE_TEST, LIDAR_TEST, SCAN};
use liblidar::{LidarError, Submission};
use lidar_protocol::{CancelRequest, ErrorCode, ErrorResponse, OkResponse, SubmitResponse, TaskInfo};

use crate::AppState;

/// An error body plus the status it is sent with.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::TaskNotFound | ErrorCode::UnknownTemplate | ErrorCode::ArtifactNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::MissingParameter | ErrorCode::InvalidFilename | ErrorCode::InvalidRequest => {
                StatusCode::BAD_REQUEST
            }
            ErrorCode::TransferFailed | ErrorCode::RemoteUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<LidarError> for ApiError {
    fn from(err: LidarError) -> Self {
        let (code, message) = err.to_error_code();
        Self { code, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.message,
            code: self.code,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::new(ErrorCode::InvalidRequest, format!("invalid request body: {e}")))
}

/// Flatten a JSON object into template parameters. Strings, numbers and
/// booleans are accepted; null counts as absent.
pub fn params_from_body(body: &Bytes) -> ApiResult<HashMap<String, String>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    let object: Map<String, Value> = parse_body(body)?;
    let mut params = HashMap::with_capacity(object.len());
    for (name, value) in object {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(ApiError::new(
                    ErrorCode::InvalidRequest,
                    format!("parameter {name} must be a string, number or boolean"),
                ));
            }
        };
        params.insert(name, text);
    }
    Ok(params)
}

fn submit(state: &AppState, template: &str, body: &Bytes) -> ApiResult<Json<SubmitResponse>> {
    let params = params_from_body(body)?;
    let Submission { task_id, filename } = state.service.submit(template, &params)?;
    Ok(Json(SubmitResponse { task_id, filename }))
}

/// POST /api/lidar/tasks/{template}
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Path(template): Path<String>,
    body: Bytes,
) -> ApiResult<Json<SubmitResponse>> {
    submit(&state, &template, &body)
}

/// POST /api/lidar/test
pub async fn lidar_test(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<SubmitResponse>> {
    submit(&state, LIDAR_TEST, &body)
}

/// POST /api/lidar/engine_test
pub async fn engine_test(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<SubmitResponse>> {
    submit(&state, ENGINE_TEST, &body)
}

/// POST /api/lidar/start
pub async fn start_scan(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<SubmitResponse>> {
    submit(&state, SCAN, &body)
}

/// POST /api/lidar/stop
pub async fn stop(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<OkResponse>> {
    let req: CancelRequest = parse_body(&body)?;
    state.service.cancel(&req.task_id)?;
    Ok(Json(OkResponse::ok()))
}

/// GET /api/lidar/tasks
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskInfo>> {
    Json(state.service.list_tasks())
}

/// GET /api/lidar/tasks/{task_id}
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskInfo>> {
    Ok(Json(state.service.task_info(&task_id)?))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    filename: String,
}

/// GET /api/lidar/download?filename=
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let bytes = state.service.fetch_artifact(&query.filename).await?;
    // The name already passed filename validation, so only quotes need care.
    let disposition = format!(
        "attachment; filename=\"{}\"",
        query.filename.replace('"', "")
    );
    let disposition = HeaderValue::from_str(&disposition).map_err(|e| {
        warn!(filename = %query.filename, "bad content-disposition: {e}");
        ApiError::new(ErrorCode::InvalidFilename, "filename is not a valid header value")
    })?;
    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// POST /api/lidar/ping, also mounted as POST /api/lidar/connect for the
/// browser's connect button.
pub async fn ping(State(state): State<Arc<AppState>>) -> ApiResult<Json<OkResponse>> {
    state.service.probe().await?;
    Ok(Json(OkResponse::ok()))
}

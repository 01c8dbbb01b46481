use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use tracing::debug;

use lidar_protocol::Event;

use crate::AppState;

/// GET /api/lidar/ws/{task_id}
pub async fn ws_task(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| stream_task(socket, state, task_id))
}

async fn stream_task(socket: WebSocket, state: Arc<AppState>, task_id: String) {
    if let Err(err) = stream_task_inner(socket, state, &task_id).await {
        // Send failures mean the subscriber went away.
        debug!(task_id = %task_id, "event stream ended early: {err}");
    }
}

async fn send_event<S>(ws_tx: &mut S, event: &Event) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(event)?;
    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn close<S>(ws_tx: &mut S, reason: &'static str) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await?;
    Ok(())
}

async fn stream_task_inner(socket: WebSocket, state: Arc<AppState>, task_id: &str) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Ok(mut drain) = state.service.subscribe(task_id) else {
        send_event(&mut ws_tx, &Event::stderr("task not found")).await?;
        close(&mut ws_tx, "task not found").await?;
        return Ok(());
    };
    debug!(task_id, "subscriber attached");

    loop {
        tokio::select! {
            event = drain.next() => {
                let Some(event) = event else {
                    break;
                };
                send_event(&mut ws_tx, &event).await?;
            }
            msg = ws_rx.next() => {
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        debug!(task_id, "subscriber left");
                        return Ok(());
                    }
                    // Pings are answered by axum; anything else is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(task_id, "task drained, closing stream");
    close(&mut ws_tx, "task finished").await
}

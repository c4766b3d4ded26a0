use std::{sync::Arc, time::Duration};

use api::{auth::AuthContext, server::LxJson, sse::EventSender};
use api_core::error::AppApiError;
use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, State},
    response::Response,
};
use futures::stream::{self, Stream};
use http::{header, StatusCode};
use runtime::task::Task;
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

/// `POST /api/v1/tasks/:id/run` — starts a streaming LLM task expansion and
/// returns its progress as `text/event-stream`.
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(task_id): Path<Uuid>,
) -> Result<Response, AppApiError> {
    let (sender, receiver) = EventSender::channel(32);
    let pool = state.pool.clone();
    let runner = state.runner.clone();
    let workspace_id = ctx.universal_id;
    let user_id = ctx.user_id;
    let session_id = Uuid::new_v4();

    Task::spawn(format!("llm-task-run-{task_id}"), async move {
        if let Err(e) =
            llm_orchestrator::run_task(&pool, &runner, &sender, workspace_id, task_id, user_id, session_id)
                .await
        {
            tracing::error!(%task_id, error = %e, "llm task run failed");
        }
    })
    .detach();

    let body = Body::from_stream(sse_stream(receiver, state.sse_heartbeat_interval));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("static response parts are always valid");

    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ReorderTaskRequest {
    pub left_item_id: Option<Uuid>,
    pub right_item_id: Option<Uuid>,
}

/// `PATCH /api/v1/tasks/:id/reorder` — moves a subtask strictly between two
/// existing siblings (either bound may be omitted to mean "at that end").
pub async fn reorder_task(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(task_id): Path<Uuid>,
    LxJson(req): LxJson<ReorderTaskRequest>,
) -> Result<LxJson<serde_json::Value>, AppApiError> {
    llm_orchestrator::reorder_task(
        &state.pool,
        ctx.universal_id,
        task_id,
        req.left_item_id,
        req.right_item_id,
    )
    .await?;
    Ok(LxJson(serde_json::json!({ "reordered": true })))
}

/// Merges the parser's SSE frames with a periodic heartbeat comment so
/// intermediate proxies don't time out an idle connection while the LLM
/// runner is thinking.
fn sse_stream(
    rx: tokio::sync::mpsc::Receiver<api::sse::Frame>,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> {
    stream::unfold(
        (rx, tokio::time::interval(heartbeat)),
        move |(mut rx, mut tick)| async move {
            tokio::select! {
                biased;
                frame = rx.recv() => frame
                    .map(|frame| (Ok(Bytes::from(frame.0)), (rx, tick))),
                _ = tick.tick() => Some((Ok(Bytes::from_static(b": heartbeat\n\n")), (rx, tick))),
            }
        },
    )
}

//! Drives one `POST /api/v1/tasks/:id/run` request (C4) end to end: loads
//! the parent task, invokes the subprocess executor (C2), feeds its stdout
//! through the stream parser (C3) while forwarding events over SSE (C1),
//! then reparses the accumulated raw buffer to persist the generated
//! subtasks with exact-decimal sibling positions.

pub mod position;

use std::time::Duration;

use api::sse::{EventKind, EventSender};
use api_core::error::AppApiError;
use chrono::Utc;
use db::models::LlmTask;
use llm_exec::{Chunk, ExecError, ExecuteRequest, ReadMode};
use llm_parser::{ParseError, Parser as StreamParser, ParserEvent};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, warn};
use uuid::Uuid;

/// Parameters the caller (the `server` binary's route handler) supplies for
/// one task-expansion run. The program/args/model/temperature/timeout are
/// deployment configuration, not per-request state, but are threaded
/// through here rather than read from a global so this crate stays
/// free of any process-wide config singleton.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub model: String,
    pub temperature: f64,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("subprocess execution failed: {0}")]
    Execution(#[from] ExecError),
    #[error("{0} is not a sibling of the task being reordered")]
    NotASibling(Uuid),
}

impl From<OrchestratorError> for AppApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::TaskNotFound(id) => {
                AppApiError::not_found(format!("task {id} not found"))
            }
            OrchestratorError::Db(e) => AppApiError::transient(format!("database error: {e}")),
            OrchestratorError::Execution(e) => AppApiError::provider(format!("runner error: {e}")),
            OrchestratorError::NotASibling(id) => {
                AppApiError::validation(format!("{id} is not a sibling of the task being reordered"))
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct RunnerStdinPayload {
    prompt_name: String,
    variables: serde_json::Map<String, serde_json::Value>,
    model: String,
    temperature: f64,
    line_mode: bool,
    user_id: Uuid,
    session_id: Uuid,
}

/// One subtask recovered by the second-pass reparse, ready to persist.
#[derive(Clone, Debug, Eq, PartialEq)]
struct ParsedSubtask {
    number: u32,
    title: String,
    objective: Option<String>,
    deliverable: Option<String>,
}

/// Loads `task_id`, runs the configured LLM runner against it, streams
/// progress through `events`, and persists whatever subtasks the run
/// produced. Returns `Err` if the subprocess itself failed (timeout,
/// non-zero exit, spawn failure) — even then, any subtasks recovered from
/// the partial output are still persisted, matching the no-rollback-on-
/// second-pass-failure rule.
pub async fn run_task(
    pool: &PgPool,
    runner: &RunnerConfig,
    events: &EventSender,
    workspace_id: Uuid,
    task_id: Uuid,
    user_id: Uuid,
    session_id: Uuid,
) -> Result<(), OrchestratorError> {
    let task: LlmTask = sqlx::query_as(
        "SELECT * FROM llm_task WHERE id = $1 AND workspace_id = $2",
    )
    .bind(task_id)
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?
    .ok_or(OrchestratorError::TaskNotFound(task_id))?;

    let req = build_request(runner, &task, user_id, session_id);
    let (mut out_rx, mut err_rx, mut exec_err_rx, _handle) =
        llm_exec::execute_with_timeout(req, runner.timeout).await;

    let mut parser = StreamParser::new();
    let mut raw = String::new();
    let mut failure: Option<ExecError> = None;

    loop {
        tokio::select! {
            biased;
            Some(exec_err) = exec_err_rx.recv() => {
                error!(task_id = %task_id, error = %exec_err, "llm runner execution error");
                let _ = events.send_error(&exec_err).await;
                failure = Some(exec_err);
            }
            chunk = out_rx.recv() => match chunk {
                Some(Chunk::Line(line)) => {
                    raw.push_str(&line);
                    raw.push('\n');
                    let mut with_newline = line;
                    with_newline.push('\n');
                    for result in parser.feed(with_newline.as_bytes()) {
                        emit_parser_event(events, result).await;
                    }
                }
                Some(Chunk::Raw(bytes)) => {
                    raw.push_str(&String::from_utf8_lossy(&bytes));
                    for result in parser.feed(&bytes) {
                        emit_parser_event(events, result).await;
                    }
                }
                None if err_rx.is_closed() => break,
                None => {}
            },
            chunk = err_rx.recv() => match chunk {
                Some(Chunk::Line(line)) => warn!(task_id = %task_id, stderr = %line, "llm runner stderr"),
                Some(Chunk::Raw(bytes)) => {
                    warn!(task_id = %task_id, stderr = %String::from_utf8_lossy(&bytes), "llm runner stderr");
                }
                None if out_rx.is_closed() => break,
                None => {}
            },
            else => break,
        }
    }

    for result in parser.finalize() {
        emit_parser_event(events, result).await;
    }

    let subtasks = second_pass(&raw);
    let persisted = persist_subtasks(pool, workspace_id, task_id, &subtasks).await?;
    for (subtask, id) in subtasks.iter().zip(persisted.iter()) {
        let mut extra = serde_json::Map::new();
        extra.insert("number".to_owned(), json!(subtask.number));
        extra.insert("task_id".to_owned(), json!(id));
        let _ = events
            .send_with_fields(EventKind::TaskId, subtask.title.clone(), extra)
            .await;
    }

    let _ = events
        .send_complete(json!({ "subtask_count": subtasks.len() }))
        .await;

    if let Some(err) = failure {
        return Err(OrchestratorError::Execution(err));
    }
    Ok(())
}

/// Moves `task_id` to sit strictly between `left_item_id` and
/// `right_item_id` (either may be absent, meaning "at that end of the
/// group"). Both, if present, must already be siblings of `task_id` (same
/// `parent_id`, same workspace). Rebalances the whole sibling group when
/// the bisected gap collapses below [`position::MIN_GAP`].
pub async fn reorder_task(
    pool: &PgPool,
    workspace_id: Uuid,
    task_id: Uuid,
    left_item_id: Option<Uuid>,
    right_item_id: Option<Uuid>,
) -> Result<(), OrchestratorError> {
    let mut txn = pool.begin().await?;

    let parent_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT parent_id FROM llm_task WHERE id = $1 AND workspace_id = $2 FOR UPDATE",
    )
    .bind(task_id)
    .bind(workspace_id)
    .fetch_optional(&mut *txn)
    .await?
    .ok_or(OrchestratorError::TaskNotFound(task_id))?;

    // Everyone else in the same sibling group, in logical order.
    let siblings: Vec<(Uuid, Decimal)> = sqlx::query_as(
        "SELECT id, position FROM llm_task \
         WHERE workspace_id = $1 AND parent_id IS NOT DISTINCT FROM $2 AND id != $3 \
         ORDER BY position",
    )
    .bind(workspace_id)
    .bind(parent_id)
    .bind(task_id)
    .fetch_all(&mut *txn)
    .await?;

    let left_index = match left_item_id {
        Some(id) => {
            let idx = siblings
                .iter()
                .position(|(sid, _)| *sid == id)
                .ok_or(OrchestratorError::NotASibling(id))?;
            Some(idx)
        }
        None => None,
    };
    if let Some(id) = right_item_id {
        siblings
            .iter()
            .position(|(sid, _)| *sid == id)
            .ok_or(OrchestratorError::NotASibling(id))?;
    }

    let insert_at = left_index.map(|i| i + 1).unwrap_or(0);
    let left_pos = insert_at.checked_sub(1).and_then(|i| siblings.get(i)).map(|(_, p)| *p);
    let right_pos = siblings.get(insert_at).map(|(_, p)| *p);

    let needs_rebalance = matches!((left_pos, right_pos), (Some(l), Some(r)) if position::gap_too_small(l, r));

    if needs_rebalance {
        let mut ordered: Vec<Uuid> = siblings.iter().map(|(id, _)| *id).collect();
        ordered.insert(insert_at, task_id);
        let positions = position::rebalanced(ordered.len());
        for (id, pos) in ordered.iter().zip(positions.iter()) {
            sqlx::query("UPDATE llm_task SET position = $1, updated_at = now() WHERE id = $2")
                .bind(pos)
                .bind(id)
                .execute(&mut *txn)
                .await?;
        }
    } else {
        let new_position = position::between(left_pos, right_pos);
        sqlx::query("UPDATE llm_task SET position = $1, updated_at = now() WHERE id = $2")
            .bind(new_position)
            .bind(task_id)
            .execute(&mut *txn)
            .await?;
    }

    txn.commit().await?;
    Ok(())
}

fn build_request(
    runner: &RunnerConfig,
    task: &LlmTask,
    user_id: Uuid,
    session_id: Uuid,
) -> ExecuteRequest {
    let mut variables = serde_json::Map::new();
    variables.insert("title".to_owned(), json!(task.title));
    variables.insert("objective".to_owned(), json!(task.objective));
    variables.insert("deliverable".to_owned(), json!(task.deliverable));

    let payload = RunnerStdinPayload {
        prompt_name: "expand_task".to_owned(),
        variables,
        model: runner.model.clone(),
        temperature: runner.temperature,
        line_mode: true,
        user_id,
        session_id,
    };

    ExecuteRequest {
        program: runner.program.clone(),
        args: runner.args.clone(),
        env: Vec::new(),
        stdin_payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        out_mode: ReadMode::Line,
        err_mode: ReadMode::Line,
    }
}

async fn emit_parser_event(events: &EventSender, result: Result<ParserEvent, ParseError>) {
    let event = match result {
        Ok(event) => event,
        Err(e) => {
            let _ = events.send_error(&e).await;
            return;
        }
    };
    let sent = match event {
        ParserEvent::TaskStart { number, title } => {
            let mut extra = serde_json::Map::new();
            extra.insert("number".to_owned(), json!(number));
            events.send_with_fields(EventKind::TaskStart, title, extra).await
        }
        ParserEvent::TaskGoal { index, objective } => {
            let mut extra = serde_json::Map::new();
            extra.insert("index".to_owned(), json!(index));
            events.send_with_fields(EventKind::TaskGoal, objective, extra).await
        }
        ParserEvent::TaskDeliverable { index, deliverable } => {
            let mut extra = serde_json::Map::new();
            extra.insert("index".to_owned(), json!(index));
            events.send_with_fields(EventKind::TaskDeliverable, deliverable, extra).await
        }
        ParserEvent::TaskEnd(index) => events.send(EventKind::TaskEnd, index).await,
        ParserEvent::RedefineTitle(title) => events.send(EventKind::RedefineTitle, title).await,
        // The terminal `complete` event is the orchestrator's to send, once
        // persistence has actually happened — not the parser's mid-stream
        // signal that the textual stream reached a valid end.
        ParserEvent::Complete => Ok(()),
    };
    if let Err(e) = sent {
        warn!(error = %e, "failed to forward parser event over SSE");
    }
}

/// Re-runs the same engine over the fully accumulated buffer to recover a
/// strongly-typed subtask list, independent of however the first pass's
/// events were chunked across reads.
fn second_pass(raw: &str) -> Vec<ParsedSubtask> {
    let mut parser = StreamParser::new();
    let mut events = parser.feed(raw.as_bytes());
    events.extend(parser.finalize());

    let mut subtasks = Vec::new();
    let mut current: Option<ParsedSubtask> = None;
    for event in events {
        match event {
            Ok(ParserEvent::TaskStart { number, title }) => {
                if let Some(done) = current.take() {
                    subtasks.push(done);
                }
                current = Some(ParsedSubtask {
                    number,
                    title,
                    objective: None,
                    deliverable: None,
                });
            }
            Ok(ParserEvent::TaskGoal { index, objective }) => {
                if let Some(cur) = current.as_mut().filter(|c| c.number == index) {
                    cur.objective = Some(objective);
                }
            }
            Ok(ParserEvent::TaskDeliverable { index, deliverable }) => {
                if let Some(cur) = current.as_mut().filter(|c| c.number == index) {
                    cur.deliverable = Some(deliverable);
                }
            }
            Ok(ParserEvent::TaskEnd(index)) => {
                if current.as_ref().is_some_and(|c| c.number == index) {
                    subtasks.push(current.take().unwrap());
                }
            }
            Ok(ParserEvent::RedefineTitle(_)) | Ok(ParserEvent::Complete) => {}
            Err(e) => warn!(error = %e, "second-pass parse error, skipping line"),
        }
    }
    if let Some(done) = current.take() {
        subtasks.push(done);
    }
    subtasks
}

async fn persist_subtasks(
    pool: &PgPool,
    workspace_id: Uuid,
    parent_id: Uuid,
    subtasks: &[ParsedSubtask],
) -> Result<Vec<Uuid>, sqlx::Error> {
    if subtasks.is_empty() {
        return Ok(Vec::new());
    }

    let mut txn = pool.begin().await?;
    let mut max_position: Option<Decimal> = sqlx::query_scalar(
        "SELECT MAX(position) FROM llm_task WHERE parent_id = $1",
    )
    .bind(parent_id)
    .fetch_one(&mut *txn)
    .await?;

    let now = Utc::now();
    let mut ids = Vec::with_capacity(subtasks.len());
    for subtask in subtasks {
        let position = position::at_end(max_position);
        max_position = Some(position);
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO llm_task \
             (id, workspace_id, parent_id, number, title, objective, deliverable, position, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(parent_id)
        .bind(subtask.number as i32)
        .bind(&subtask.title)
        .bind(&subtask.objective)
        .bind(&subtask.deliverable)
        .bind(position)
        .bind(now)
        .execute(&mut *txn)
        .await?;
        ids.push(id);
    }
    txn.commit().await?;
    Ok(ids)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_pass_recovers_full_subtasks_from_raw_stream_text() {
        let raw = "<final_answer>\nTodo: T\nSub-Todos:\n1. A\n\
                    - Objective: O\n- Deliverable: D\n2. B\n\
                    - Objective: O2\n- Deliverable: D2\n</final_answer>\n";
        let subtasks = second_pass(raw);
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].number, 1);
        assert_eq!(subtasks[0].title, "A");
        assert_eq!(subtasks[0].objective.as_deref(), Some("O"));
        assert_eq!(subtasks[0].deliverable.as_deref(), Some("D"));
        assert_eq!(subtasks[1].number, 2);
    }

    #[test]
    fn second_pass_recovers_partial_subtask_from_truncated_stream() {
        let raw = "Sub-Todos:\n1. Only\n- Objective: O\n";
        let subtasks = second_pass(raw);
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].objective.as_deref(), Some("O"));
        assert_eq!(subtasks[0].deliverable, None);
    }

    #[test]
    fn second_pass_on_empty_buffer_yields_no_subtasks() {
        assert!(second_pass("").is_empty());
    }
}

//! HTTP JSON-RPC client for the Board Port (spec §4.C).
//!
//! Transport is grounded on `agentor-channels/src/slack.rs`
//! (`reqwest::Client`, `basic_auth`/`bearer_auth`, typed response structs);
//! the envelope and request/response correlation is grounded on
//! `agentor-mcp/src/client.rs` (`AtomicU64` id counter, one `request` call
//! per RPC).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use kb_core::domain::{Column, Task, TaskId};
use kb_core::{KbError, KbResult};

use crate::error::BoardError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, WireTask};

/// The Board operations the core depends on (spec §4.C). A trait so the
/// policy/reconciler tests can substitute an in-memory fake.
#[async_trait]
pub trait BoardPort: Send + Sync {
    async fn list_tasks(&self, columns: &[Column]) -> KbResult<Vec<Task>>;
    async fn get_task(&self, id: TaskId) -> KbResult<Task>;
    async fn move_task(&self, id: TaskId, column: Column) -> KbResult<()>;
    async fn set_position(&self, id: TaskId, position: i64) -> KbResult<()>;
    async fn add_tag(&self, id: TaskId, tag: &str) -> KbResult<()>;
    async fn remove_tag(&self, id: TaskId, tag: &str) -> KbResult<()>;
    /// Converge the task's tag set to exactly `tags`: add what's missing,
    /// remove what's extra. Never toggles (spec §4.C idempotence note).
    async fn set_tags(&self, id: TaskId, tags: &BTreeSet<String>) -> KbResult<()>;
    async fn post_comment(&self, id: TaskId, markdown: &str) -> KbResult<()>;
    async fn create_task(
        &self,
        column: Column,
        title: &str,
        description: &str,
        tags: &BTreeSet<String>,
    ) -> KbResult<TaskId>;
}

/// Live [`BoardPort`] talking JSON-RPC 2.0 over HTTP with Basic auth.
pub struct JsonRpcBoard {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
    call_timeout: Duration,
    retries: u32,
}

impl JsonRpcBoard {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_timing(base_url, user, password, Duration::from_secs(10), 2)
    }

    pub fn with_timing(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        call_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
            next_id: AtomicU64::new(1),
            call_timeout,
            retries,
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, BoardError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.call_once(&req).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt <= self.retries => {
                    warn!(method, attempt, error = %err, "board call failed, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(&self, req: &JsonRpcRequest) -> Result<serde_json::Value, BoardError> {
        let response = self
            .client
            .post(&self.base_url)
            .basic_auth(&self.user, Some(&self.password))
            .timeout(self.call_timeout)
            .json(req)
            .send()
            .await?;

        let body: JsonRpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(BoardError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        body.result
            .ok_or_else(|| BoardError::Malformed("response had neither result nor error".into()))
    }

    fn wire_to_task(wire: WireTask) -> Result<Task, BoardError> {
        let column = Column::from_board_title(&wire.column_title)
            .ok_or_else(|| BoardError::UnknownColumn(wire.column_title.clone()))?;
        Ok(Task {
            id: TaskId(wire.id),
            column,
            position: wire.position,
            title: wire.title,
            description: wire.description,
            tags: wire.tags.into_iter().collect(),
        })
    }
}

#[async_trait]
impl BoardPort for JsonRpcBoard {
    async fn list_tasks(&self, columns: &[Column]) -> KbResult<Vec<Task>> {
        let titles: Vec<&str> = columns.iter().map(|c| c.board_title()).collect();
        let result = self
            .call("listTasksByColumn", json!({ "columns": titles }))
            .await
            .map_err(KbError::from)?;
        let wire_tasks: Vec<WireTask> =
            serde_json::from_value(result).map_err(|e| KbError::Board(format!("bad listTasks payload: {e}")))?;
        let mut tasks = Vec::with_capacity(wire_tasks.len());
        for wire in wire_tasks {
            tasks.push(Self::wire_to_task(wire).map_err(KbError::from)?);
        }
        debug!(count = tasks.len(), "listed tasks from board");
        Ok(tasks)
    }

    async fn get_task(&self, id: TaskId) -> KbResult<Task> {
        let result = self
            .call("getTask", json!({ "task_id": id.0 }))
            .await
            .map_err(KbError::from)?;
        let wire: WireTask =
            serde_json::from_value(result).map_err(|e| KbError::Board(format!("bad getTask payload: {e}")))?;
        Self::wire_to_task(wire).map_err(KbError::from)
    }

    async fn move_task(&self, id: TaskId, column: Column) -> KbResult<()> {
        self.call(
            "moveTaskToColumn",
            json!({ "task_id": id.0, "column_title": column.board_title() }),
        )
        .await
        .map(|_| ())
        .map_err(KbError::from)
    }

    async fn set_position(&self, id: TaskId, position: i64) -> KbResult<()> {
        self.call("setTaskPosition", json!({ "task_id": id.0, "position": position }))
            .await
            .map(|_| ())
            .map_err(KbError::from)
    }

    async fn add_tag(&self, id: TaskId, tag: &str) -> KbResult<()> {
        self.call("addTaskTag", json!({ "task_id": id.0, "tag": tag }))
            .await
            .map(|_| ())
            .map_err(KbError::from)
    }

    async fn remove_tag(&self, id: TaskId, tag: &str) -> KbResult<()> {
        self.call("removeTaskTag", json!({ "task_id": id.0, "tag": tag }))
            .await
            .map(|_| ())
            .map_err(KbError::from)
    }

    async fn set_tags(&self, id: TaskId, tags: &BTreeSet<String>) -> KbResult<()> {
        let current = self.get_task(id).await?;
        for tag in tags.difference(&current.tags) {
            self.add_tag(id, tag).await?;
        }
        for tag in current.tags.difference(tags) {
            self.remove_tag(id, tag).await?;
        }
        Ok(())
    }

    async fn post_comment(&self, id: TaskId, markdown: &str) -> KbResult<()> {
        self.call("postComment", json!({ "task_id": id.0, "content": markdown }))
            .await
            .map(|_| ())
            .map_err(KbError::from)
    }

    async fn create_task(
        &self,
        column: Column,
        title: &str,
        description: &str,
        tags: &BTreeSet<String>,
    ) -> KbResult<TaskId> {
        let result = self
            .call(
                "createTask",
                json!({
                    "column_title": column.board_title(),
                    "title": title,
                    "description": description,
                    "tags": tags.iter().collect::<Vec<_>>(),
                }),
            )
            .await
            .map_err(KbError::from)?;
        let id = result
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| KbError::Board("createTask response missing integer id".into()))?;
        Ok(TaskId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn list_tasks_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": [
                    {"id": 7, "column_title": "Ready", "position": 0, "title": "t", "description": "", "tags": ["repo:server"]}
                ]
            })))
            .mount(&server)
            .await;

        let board = JsonRpcBoard::new(server.uri(), "orchestrator", "secret");
        let tasks = board.list_tasks(&[Column::Ready]).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, TaskId(7));
        assert_eq!(tasks[0].column, Column::Ready);
    }

    #[tokio::test]
    async fn rpc_error_surfaces_as_board_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32602, "message": "unknown task"}
            })))
            .mount(&server)
            .await;

        let board = JsonRpcBoard::new(server.uri(), "orchestrator", "secret");
        let err = board.get_task(TaskId(1)).await.unwrap_err();
        assert!(matches!(err, KbError::Board(_)));
    }
}

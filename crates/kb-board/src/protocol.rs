//! JSON-RPC 2.0 envelope types for the Board Port.
//!
//! Grounded on `agentor-mcp/src/protocol.rs` (`JsonRpcRequest`/
//! `JsonRpcResponse`/`JsonRpcError`), adapted from a stdio transport to an
//! HTTP one — the envelope shape is unchanged, only how it travels.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Wire shape of a task as the Board returns it from `getTask`/`getAllTasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTask {
    pub id: u64,
    pub column_title: String,
    pub position: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

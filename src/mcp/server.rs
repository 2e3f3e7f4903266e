//! JSON-RPC 2.0 server core for the MCP control surface.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::manager::JobManager;
use crate::worker::ArtifactStore;

use super::tools;

/// An incoming JSON-RPC request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Build a JSON-RPC result envelope.
pub fn json_rpc_result(id: Option<Value>, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// Build a JSON-RPC error envelope.
pub fn json_rpc_error(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

/// The MCP server: four job tools plus status/artifact resources.
pub struct McpServer {
    pub(crate) manager: Arc<JobManager>,
    pub(crate) artifacts: Arc<ArtifactStore>,
}

impl McpServer {
    pub fn new(manager: Arc<JobManager>, artifacts: Arc<ArtifactStore>) -> Self {
        Self { manager, artifacts }
    }

    /// Handle one request. Notifications (no id) produce no response.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<Value> {
        let id = request.id.clone();
        let is_notification = id.is_none();

        let response = match request.method.as_str() {
            "initialize" => json_rpc_result(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {
                        "name": "task-relay",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {"tools": {}, "resources": {}},
                }),
            ),
            "notifications/initialized" | "notifications/cancelled" => return None,
            "ping" => json_rpc_result(id, json!({})),
            "tools/list" => json_rpc_result(id, tools::tool_definitions()),
            "tools/call" => self.handle_tool_call(id, request.params).await,
            "resources/read" => self.handle_resource_read(id, request.params).await,
            other => json_rpc_error(id, -32601, &format!("Method not found: {other}")),
        };

        if is_notification {
            None
        } else {
            Some(response)
        }
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> Value {
        let Some(params) = params else {
            return json_rpc_error(id, -32602, "tools/call requires params");
        };
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        match tools::dispatch(self, name, arguments).await {
            Ok(result) => json_rpc_result(
                id,
                json!({
                    "content": [{
                        "type": "text",
                        "text": result.to_string(),
                    }],
                }),
            ),
            Err(message) => json_rpc_error(id, -32000, &message),
        }
    }

    async fn handle_resource_read(&self, id: Option<Value>, params: Option<Value>) -> Value {
        let uri = params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .unwrap_or("");

        match tools::read_resource(self, uri).await {
            Ok((mime, text)) => json_rpc_result(
                id,
                json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": mime,
                        "text": text,
                    }],
                }),
            ),
            Err(message) => json_rpc_error(id, -32002, &message),
        }
    }
}

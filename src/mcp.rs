//! MCP service: JSON-RPC 2.0 over whatever carries it (here, uplink frames
//! from the in-sandbox bridge). Handles the protocol lifecycle and hands
//! tools/call off to the dispatcher. Batches are supported; notifications
//! produce no response element, and an all-notification batch yields 202.

use std::collections::HashSet;

use crate::{execute_tool, is_known_tool, new_id, tool_definitions_json, ToolCtx};

pub(crate) const PROTOCOL_VERSION: &str = "2025-03-26";
pub(crate) const SESSION_HEADER: &str = "Mcp-Session-Id";

pub(crate) const PARSE_ERROR: i64 = -32700;
pub(crate) const INVALID_REQUEST: i64 = -32600;
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

pub(crate) struct McpReply {
    pub(crate) body: Option<serde_json::Value>,
    /// Session id allocated by an `initialize` in this exchange; the
    /// transport echoes it as the Mcp-Session-Id header.
    pub(crate) session_id: Option<String>,
    pub(crate) status: u16,
}

pub(crate) struct McpService {
    sessions: HashSet<String>,
}

impl McpService {
    pub(crate) fn new() -> McpService {
        McpService {
            sessions: HashSet::new(),
        }
    }

    /// Terminate a session (HTTP DELETE on the bridge surface). Best
    /// effort; unknown ids are fine.
    pub(crate) fn end_session(&mut self, session_id: Option<&str>) -> bool {
        match session_id {
            Some(id) => self.sessions.remove(id),
            None => false,
        }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One POSTed JSON-RPC payload: a single request or a batch array.
    pub(crate) fn handle_payload(
        &mut self,
        payload: &serde_json::Value,
        ctx: &mut ToolCtx,
    ) -> McpReply {
        if let Some(batch) = payload.as_array() {
            if batch.is_empty() {
                return McpReply {
                    body: Some(error_response(
                        serde_json::Value::Null,
                        INVALID_REQUEST,
                        "empty batch",
                    )),
                    session_id: None,
                    status: 200,
                };
            }
            let mut responses = Vec::new();
            let mut session_id = None;
            for msg in batch {
                let (response, allocated) = self.handle_one(msg, ctx);
                if let Some(response) = response {
                    responses.push(response);
                }
                session_id = session_id.or(allocated);
            }
            if responses.is_empty() {
                // nothing but notifications: acknowledge with no body
                return McpReply {
                    body: None,
                    session_id,
                    status: 202,
                };
            }
            return McpReply {
                body: Some(serde_json::Value::Array(responses)),
                session_id,
                status: 200,
            };
        }

        let (response, session_id) = self.handle_one(payload, ctx);
        match response {
            Some(body) => McpReply {
                body: Some(body),
                session_id,
                status: 200,
            },
            None => McpReply {
                body: None,
                session_id,
                status: 202,
            },
        }
    }

    /// One JSON-RPC message. Returns (response, allocated-session-id);
    /// notifications return no response.
    fn handle_one(
        &mut self,
        msg: &serde_json::Value,
        ctx: &mut ToolCtx,
    ) -> (Option<serde_json::Value>, Option<String>) {
        let Some(obj) = msg.as_object() else {
            return (
                Some(error_response(
                    serde_json::Value::Null,
                    INVALID_REQUEST,
                    "request must be an object",
                )),
                None,
            );
        };
        let id = obj.get("id").cloned().unwrap_or(serde_json::Value::Null);
        let has_id = !id.is_null();
        let method = obj.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let params = obj
            .get("params")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        match method {
            "initialize" => {
                let session_id = new_id();
                self.sessions.insert(session_id.clone());
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": PROTOCOL_VERSION,
                        "serverInfo": {
                            "name": "outpost",
                            "version": env!("CARGO_PKG_VERSION")
                        },
                        "capabilities": { "tools": {} }
                    }
                });
                (Some(response), Some(session_id))
            }

            "initialized" | "notifications/initialized" => (None, None),

            "ping" => (
                Some(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} })),
                None,
            ),

            "tools/list" => (
                Some(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "tools": tool_definitions_json() }
                })),
                None,
            ),

            "tools/call" => {
                let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
                if !is_known_tool(name) {
                    return (
                        Some(error_response(
                            id,
                            METHOD_NOT_FOUND,
                            &format!("unknown tool: {name}"),
                        )),
                        None,
                    );
                }
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                let response = match execute_tool(name, arguments, ctx) {
                    Ok(result) => serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [{ "type": "text", "text": result.output }],
                            "isError": result.is_error
                        }
                    }),
                    // handler failures are tool results, not protocol errors
                    Err(message) => serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "content": [{ "type": "text", "text": message }],
                            "isError": true
                        }
                    }),
                };
                (Some(response), None)
            }

            _ => {
                if !has_id {
                    // unknown notification: drop silently
                    return (None, None);
                }
                (
                    Some(error_response(
                        id,
                        METHOD_NOT_FOUND,
                        &format!("method not found: {method}"),
                    )),
                    None,
                )
            }
        }
    }
}

pub(crate) fn error_response(
    id: serde_json::Value,
    code: i64,
    message: &str,
) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

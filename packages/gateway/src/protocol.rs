//! JSON wire protocol spoken over the browser WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server → client events, fanned out to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Text {
        content: String,
    },
    ToolStart {
        tool: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        input: Value,
    },
    ToolEnd {
        tool: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        output: String,
    },
    PermissionRequest {
        id: String,
        tool: String,
        input: Value,
        description: String,
    },
    SessionState {
        state: String,
    },
    Cost {
        #[serde(rename = "totalUsd")]
        total_usd: f64,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_string())
    }
}

/// Client → server messages parsed from inbound text frames.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Message { content: String },
    PermissionResponse { id: String, allow: bool },
    Interrupt,
}

//! Session/Command/Result/StreamEvent/AuthContext data model. Serialization
//! is the wire format agreed between the session manager, command queue,
//! executor stream endpoint, executor result sink, and executor agent —
//! values stored in the keyed store are this JSON, opaque to the store
//! itself.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub cluster_id: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub ttl_deadline: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Get,
    Describe,
    Logs,
    Events,
    Top,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Get => "get",
            CommandType::Describe => "describe",
            CommandType::Logs => "logs",
            CommandType::Events => "events",
            CommandType::Top => "top",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub cluster_id: String,
    pub session_id: Option<Uuid>,
    pub command_type: CommandType,
    pub args: Vec<String>,
    pub timeout_ms: u64,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultStatus {
    Success,
    Failed,
    Timeout,
    Error,
}

/// Produced by the executor agent, consumed exactly once by the command
/// queue. Carries both split `stdout`/`stderr` and a combined `output`
/// field (stdout and stderr joined with a newline) so callers that want a
/// single blob don't have to reconstruct it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    pub return_code: i32,
    pub status: ResultStatus,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl CommandResult {
    pub fn combine_output(stdout: &str, stderr: &str) -> String {
        if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n{stderr}")
        }
    }

    pub fn timeout(command_id: Uuid) -> Self {
        CommandResult {
            command_id,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            output: String::new(),
            return_code: -1,
            status: ResultStatus::Timeout,
            executed_at: Utc::now(),
            execution_time_ms: 0,
        }
    }
}

/// A single part of a message. Accepts both `{text}` and `{kind:"text",
/// text}` shapes on input; normalizes to the latter on output and
/// internally.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Tagged { kind: String, text: String },
    Bare { text: String },
}

impl MessagePart {
    pub fn text(&self) -> &str {
        match self {
            MessagePart::Tagged { text, .. } => text,
            MessagePart::Bare { text } => text,
        }
    }

    pub fn normalized(&self) -> MessagePart {
        MessagePart::Tagged {
            kind: "text".to_string(),
            text: self.text().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub role: String,
    pub parts: Vec<MessagePart>,
}

/// Tagged variant with an exhaustively enumerated `kind` discriminant and
/// typed sub-records per variant. Unknown `kind` values must be ignored by
/// clients — enforced on the reading side by `#[serde(tag = "kind")]`'s own
/// forward-incompatibility (an unrecognized tag simply fails to
/// deserialize into this enum; this type is only ever produced here, never
/// parsed from an external agent).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamEvent {
    StatusUpdate {
        context_id: String,
        seq: Option<u64>,
        state: String,
        message: Option<String>,
        #[serde(rename = "final")]
        is_final: bool,
    },
    ArtifactUpdate {
        context_id: String,
        seq: Option<u64>,
        artifact_id: String,
        parts: Vec<MessagePart>,
    },
    ToolCall {
        context_id: String,
        seq: Option<u64>,
        tool: String,
        parameters: serde_json::Value,
    },
    ToolResponse {
        context_id: String,
        seq: Option<u64>,
        content: serde_json::Value,
    },
    Thinking {
        context_id: String,
        seq: Option<u64>,
        content: String,
    },
}

impl StreamEvent {
    pub fn context_id(&self) -> &str {
        match self {
            StreamEvent::StatusUpdate { context_id, .. }
            | StreamEvent::ArtifactUpdate { context_id, .. }
            | StreamEvent::ToolCall { context_id, .. }
            | StreamEvent::ToolResponse { context_id, .. }
            | StreamEvent::Thinking { context_id, .. } => context_id,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::StatusUpdate { is_final: true, .. })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    BearerToken,
}

/// Built-in scope vocabulary the dispatcher and agent protocol binding
/// check permissions against.
pub mod scopes {
    pub const DEBUG_READ: &str = "debug:read";
    pub const DEBUG_EXECUTE: &str = "debug:execute";
    pub const A2A_INVOKE: &str = "a2a:invoke";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthContext {
    pub identity: String,
    pub method: AuthMethod,
    pub permissions: HashSet<String>,
}

impl AuthContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.permissions.iter().any(|p| p == scope || p == "*")
    }
}

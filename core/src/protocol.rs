//! Wire types exchanged with the chat caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::ActionInvocation;
use crate::prompt::Role;

/// A tool call as the model emitted it. Serialized in the OpenAI
/// `{id, type, function: {name, arguments}}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireToolCall", into = "WireToolCall")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn to_invocation(&self) -> ActionInvocation {
        ActionInvocation::new(&self.id, &self.name, &self.arguments)
    }

    /// Arguments as JSON when they parse, otherwise the raw text.
    pub fn arguments_value(&self) -> Value {
        serde_json::from_str(&self.arguments)
            .unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        Self {
            id: wire.id,
            name: wire.function.name,
            arguments: wire.function.arguments,
        }
    }
}

impl From<ToolCall> for WireToolCall {
    fn from(call: ToolCall) -> Self {
        Self {
            id: call.id,
            kind: function_type(),
            function: WireFunction {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

/// One message of the conversation, OpenAI chat-completions style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn with_content(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_content(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_content(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_content(Role::Assistant, content)
    }

    /// The assistant turn that requested `calls`; text is dropped when empty.
    pub fn assistant_tool_calls(content: String, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: (!content.is_empty()).then_some(content),
            name: None,
            tool_call_id: None,
            tool_calls: calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_content(Role::Tool, content)
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// A function the model may call, as sent to the model. Also the shape of
/// the caller-implemented tools carried on a [`ChatRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tools implemented by the caller; calls to them are handed back.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default, alias = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

fn default_stream() -> bool {
    true
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            stream: true,
            thread_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request or an action call was malformed.
    Validation,
    /// The model or an action's backend failed.
    Upstream,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Upstream => write!(f, "upstream"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// One element of a streamed reply. A run ends with exactly one `Done` or
/// one `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Text {
        content: String,
    },
    ActionExecution {
        id: String,
        name: String,
        arguments: Value,
    },
    ActionResult {
        id: String,
        name: String,
        result: String,
    },
    ClientToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Done,
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ActionExecution { .. } => "action_execution",
            Self::ActionResult { .. } => "action_result",
            Self::ClientToolCall { .. } => "client_tool_call",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// A whole reply, for callers that asked for `stream: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub message: ChatMessage,
    #[serde(default)]
    pub action_results: Vec<ActionOutcome>,
    #[serde(default)]
    pub client_tool_calls: Vec<ToolCall>,
}

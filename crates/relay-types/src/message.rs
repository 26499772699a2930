use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One JSON object framed out of the agent's stdout stream.
///
/// Only the `type` discriminant and, for tool events, the nested `part`
/// object are interpreted. Every other field is carried through untouched,
/// so the message serializes back to exactly the object that was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamMessage {
    fields: Map<String, Value>,
}

impl StreamMessage {
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// The `type` discriminant, if the object carries one.
    pub fn kind(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }

    /// Typed view of the `type` discriminant.
    pub fn message_kind(&self) -> MessageKind {
        self.kind().map(MessageKind::from).unwrap_or(MessageKind::Unknown)
    }

    pub fn is_tool_event(&self) -> bool {
        matches!(
            self.message_kind(),
            MessageKind::ToolCall | MessageKind::ToolUse | MessageKind::ToolResult
        )
    }

    /// The nested `part` object of tool events.
    pub fn part(&self) -> Option<ToolPart<'_>> {
        self.fields
            .get("part")
            .and_then(Value::as_object)
            .map(|part| ToolPart { part })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Borrowed view over the `part` object of a tool event.
#[derive(Debug, Clone, Copy)]
pub struct ToolPart<'a> {
    part: &'a Map<String, Value>,
}

impl<'a> ToolPart<'a> {
    pub fn tool(&self) -> Option<&'a str> {
        self.part.get("tool").and_then(Value::as_str)
    }

    pub fn input(&self) -> Option<&'a Value> {
        self.part.get("input")
    }

    pub fn output(&self) -> Option<&'a Value> {
        self.part.get("output")
    }
}

/// Known agent stream discriminants. Anything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    StepStart,
    Text,
    ToolCall,
    ToolUse,
    ToolResult,
    StepFinish,
    Error,
    Other(String),
    Unknown,
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "step_start" => Self::StepStart,
            "text" => Self::Text,
            "tool_call" => Self::ToolCall,
            "tool_use" => Self::ToolUse,
            "tool_result" => Self::ToolResult,
            "step_finish" => Self::StepFinish,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

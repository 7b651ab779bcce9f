use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Kind of a normalized stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// Cumulative text for a message that is still being written.
    ContentDelta,
    /// Cumulative text that closes a message (or a tool, when final).
    Completion,
    /// The agent started a remote tool.
    ToolCall,
    /// Output produced by a running tool.
    ToolOutput,
    /// An error reported by the agent.
    Error,
}

impl StreamEventKind {
    /// Parses the `kind` field of a wire event.
    pub fn from_wire(kind: &str) -> Result<Self, ProtocolError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "message" | "content_delta" => Ok(Self::ContentDelta),
            "completion" => Ok(Self::Completion),
            "tool_call" | "tool" => Ok(Self::ToolCall),
            "tool_output" => Ok(Self::ToolOutput),
            "error" => Ok(Self::Error),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }

    /// Returns the canonical wire name.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::ContentDelta => "message",
            Self::Completion => "completion",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Name and arguments of a remote tool call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub args: String,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }

    /// Recovers a tool name and arguments from free-form call content.
    ///
    /// Accepts `Tool: <name>\nArguments: <args>` and `<name>: <args>`.
    pub fn parse(content: &str) -> Self {
        let content = content.trim();
        let mut name = None;
        let mut args = None;
        for line in content.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Tool:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("Arguments:") {
                args = Some(rest.trim().to_string());
            }
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            return Self::new(name, args.unwrap_or_default());
        }

        match content.split_once(':') {
            Some((head, tail))
                if !head.trim().is_empty() && !head.trim().contains(char::is_whitespace) =>
            {
                Self::new(head.trim(), tail.trim())
            }
            _ => Self::new("unknown", content),
        }
    }
}

/// One normalized unit received from the transport.
///
/// `content` is cumulative for its `message_id`, never a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub message_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub sender_name: String,
    pub is_final: bool,
    pub error_text: Option<String>,
    pub tool: Option<ToolInvocation>,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind, message_id: impl Into<String>) -> Self {
        Self {
            kind,
            message_id: message_id.into(),
            session_id: None,
            content: String::new(),
            sender_name: String::new(),
            is_final: false,
            error_text: None,
            tool: None,
        }
    }

    pub fn delta(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(StreamEventKind::ContentDelta, message_id).with_content(content)
    }

    pub fn completion(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Completion, message_id)
            .with_content(content)
            .finished()
    }

    pub fn tool_call(
        message_id: impl Into<String>,
        name: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        let tool = ToolInvocation::new(name, args);
        let content = format!("Tool: {}\nArguments: {}", tool.name, tool.args);
        Self::new(StreamEventKind::ToolCall, message_id)
            .with_content(content)
            .with_tool(tool)
    }

    pub fn tool_output(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(StreamEventKind::ToolOutput, message_id).with_content(content)
    }

    pub fn error(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(StreamEventKind::Error, message_id)
            .with_content(text.clone())
            .with_error(text)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_sender(mut self, sender_name: impl Into<String>) -> Self {
        self.sender_name = sender_name.into();
        self
    }

    pub fn with_error(mut self, error_text: impl Into<String>) -> Self {
        self.error_text = Some(error_text.into());
        self
    }

    pub fn with_tool(mut self, tool: ToolInvocation) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Marks this event as the last one for its message id.
    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Returns the tool name and arguments, parsing `content` if needed.
    pub fn invocation(&self) -> ToolInvocation {
        match &self.tool {
            Some(tool) => tool.clone(),
            None => ToolInvocation::parse(&self.content),
        }
    }

    /// Returns the structured error text, falling back to content.
    pub fn error_message(&self) -> &str {
        self.error_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(&self.content)
    }
}

/// JSON event shape accepted from transports that emit whole events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

impl TryFrom<WireEvent> for StreamEvent {
    type Error = ProtocolError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let kind = StreamEventKind::from_wire(&wire.kind)?;
        if wire.message_id.trim().is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{kind} event without message_id"
            )));
        }
        Ok(Self {
            kind,
            message_id: wire.message_id,
            session_id: wire.session_id.filter(|id| !id.trim().is_empty()),
            content: wire.content,
            sender_name: wire.sender_name.unwrap_or_default(),
            is_final: wire.is_final,
            error_text: wire.error.filter(|e| !e.trim().is_empty()),
            tool: None,
        })
    }
}

/// Kind of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMessageType {
    Text,
    ToolInit,
    ToolOutput,
    ToolComplete,
    Error,
}

/// One transcript entry as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub message_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_user: bool,
    #[serde(rename = "type")]
    pub kind: DisplayMessageType,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl DisplayMessage {
    /// A message typed by the local user. Always final.
    pub fn user(sender_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: format!("user-{}", uuid::Uuid::new_v4()),
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_user: true,
            kind: DisplayMessageType::Text,
            is_final: true,
        }
    }

    /// An entry produced by the remote agent.
    pub fn agent(
        message_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        kind: DisplayMessageType,
        is_final: bool,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_user: false,
            kind,
            is_final,
        }
    }
}

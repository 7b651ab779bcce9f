use serde_json::Value;

use crate::errors::ProtocolError;
use crate::event::{StreamEvent, StreamEventKind, WireEvent};

const SYSTEM_SENDER: &str = "System";

/// Splits a byte stream into complete lines across chunk boundaries.
#[derive(Default)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line_bytes[..idx]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Returns a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        self.buf.clear();
        (!rest.trim().is_empty()).then_some(rest)
    }
}

/// Maps data-stream parts of one exchange to normalized events.
///
/// Text parts are accumulated so every emitted text event carries the
/// cumulative content.
pub(crate) struct PartMapper {
    text_id: String,
    session_id: String,
    text: String,
    finished: bool,
}

impl PartMapper {
    pub fn new(exchange_id: uuid::Uuid, session_id: impl Into<String>) -> Self {
        Self {
            text_id: format!("text-{exchange_id}"),
            session_id: session_id.into(),
            text: String::new(),
            finished: false,
        }
    }

    /// Whether a finish part with a reason has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Maps one line. `Ok(None)` for parts that carry nothing to show.
    pub fn map_line(&mut self, line: &str) -> Result<Option<StreamEvent>, ProtocolError> {
        let line = line.trim_end();
        if line.starts_with('{') {
            return self.map_json_event(line).map(Some);
        }
        let bytes = line.as_bytes();
        if bytes.len() < 3 || bytes[1] != b':' {
            return Err(ProtocolError::Malformed(truncate(line)));
        }
        let payload = &line[2..];
        match bytes[0] {
            b'0' => {
                let text: String = parse_payload(payload, "text")?;
                self.text.push_str(&text);
                let event = StreamEvent::delta(self.text_id.clone(), self.text.clone());
                Ok(Some(self.stamp(event)))
            }
            b'9' => {
                let part: Value = parse_payload(payload, "tool call")?;
                let name = part
                    .get("toolName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::Malformed("tool call without toolName".into()))?;
                let args = part.get("args").map(render_value).unwrap_or_default();
                let id = tool_call_id(&part);
                let event = StreamEvent::tool_call(id, name, args).with_sender(SYSTEM_SENDER);
                Ok(Some(self.stamp(event)))
            }
            b'a' => {
                let part: Value = parse_payload(payload, "tool result")?;
                let result = part
                    .get("result")
                    .filter(|v| !v.is_null())
                    .map(render_value)
                    .filter(|s| !s.trim().is_empty())
                    .or_else(|| {
                        part.get("output")
                            .and_then(Value::as_str)
                            .map(ToOwned::to_owned)
                    })
                    .unwrap_or_default();
                if result.trim().is_empty() {
                    return Ok(None);
                }
                let event = StreamEvent::tool_output(tool_call_id(&part), result)
                    .with_sender(SYSTEM_SENDER)
                    .finished();
                Ok(Some(self.stamp(event)))
            }
            b'3' => {
                let message: String = parse_payload(payload, "error")?;
                let event = StreamEvent::error(format!("error-{}", uuid::Uuid::new_v4()), message)
                    .with_sender(SYSTEM_SENDER)
                    .finished();
                Ok(Some(self.stamp(event)))
            }
            b'd' => {
                let part: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
                let reason = part
                    .get("finishReason")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if reason.is_empty() {
                    return Ok(None);
                }
                self.finished = true;
                let event = StreamEvent::completion(self.text_id.clone(), self.text.clone());
                Ok(Some(self.stamp(event)))
            }
            b'2' | b'8' | b'e' | b'f' | b'g' | b'b' | b'c' | b'j' | b'k' => Ok(None),
            other => Err(ProtocolError::UnknownKind(format!(
                "data stream part '{}'",
                other as char
            ))),
        }
    }

    fn map_json_event(&mut self, line: &str) -> Result<StreamEvent, ProtocolError> {
        let wire: WireEvent = serde_json::from_str(line)
            .map_err(|e| ProtocolError::Malformed(format!("invalid event JSON: {e}")))?;
        let mut event = StreamEvent::try_from(wire)?;
        if event.session_id.is_none() {
            event.session_id = Some(self.session_id.clone());
        }
        if event.kind == StreamEventKind::Completion && event.is_final {
            self.finished = true;
        }
        Ok(event)
    }

    fn stamp(&self, event: StreamEvent) -> StreamEvent {
        event.with_session(self.session_id.clone())
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &str,
    what: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_str(payload)
        .map_err(|e| ProtocolError::Malformed(format!("invalid {what} part: {e}")))
}

fn tool_call_id(part: &Value) -> String {
    part.get("toolCallId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(line: &str) -> String {
    const MAX: usize = 80;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

use std::collections::HashMap;

use agentchat_engine::{DisplayMessage, DisplayMessageType, ToolCallStats, ToolInvocation};

const PREVIEW_CHARS: usize = 160;

#[derive(Default)]
struct Printed {
    chars: usize,
    kind: Option<DisplayMessageType>,
    finished: bool,
}

/// Turns successive transcript snapshots into terminal output.
///
/// Text entries are printed incrementally; tool and error entries print one
/// line per state change.
#[derive(Default)]
pub struct TranscriptPrinter {
    printed: HashMap<String, Printed>,
    tool_names: HashMap<String, String>,
    open_line: Option<String>,
}

impl TranscriptPrinter {
    pub fn render(&mut self, messages: &[DisplayMessage]) -> String {
        let mut out = String::new();
        for message in messages.iter().filter(|m| !m.is_user) {
            match message.kind {
                DisplayMessageType::Text => self.render_text(message, &mut out),
                DisplayMessageType::ToolOutput => {}
                _ => self.render_event(message, &mut out),
            }
        }
        out
    }

    /// Forgets everything printed so far.
    pub fn clear(&mut self) {
        self.printed.clear();
        self.tool_names.clear();
        self.open_line = None;
    }

    fn render_text(&mut self, message: &DisplayMessage, out: &mut String) {
        let id = &message.message_id;
        let entry = self.printed.entry(id.clone()).or_default();
        if entry.finished {
            return;
        }
        let suffix: String = message.content.chars().skip(entry.chars).collect();
        if !suffix.is_empty() {
            if self.open_line.as_deref() != Some(id.as_str()) {
                if self.open_line.is_some() {
                    out.push('\n');
                }
                out.push_str(&format!("{}: ", message.sender_name));
                self.open_line = Some(id.clone());
            }
            out.push_str(&suffix);
            entry.chars += suffix.chars().count();
        }
        if message.is_final {
            entry.finished = true;
            if self.open_line.as_deref() == Some(id.as_str()) {
                out.push('\n');
                self.open_line = None;
            }
        }
    }

    fn render_event(&mut self, message: &DisplayMessage, out: &mut String) {
        let id = &message.message_id;
        let entry = self.printed.entry(id.clone()).or_default();
        if entry.kind == Some(message.kind) {
            return;
        }
        entry.kind = Some(message.kind);
        if self.open_line.take().is_some() {
            out.push('\n');
        }

        let line = match message.kind {
            DisplayMessageType::ToolInit => {
                let invocation = ToolInvocation::parse(&message.content);
                let line = format!("[tool] {} {}", invocation.name, preview(&invocation.args));
                self.tool_names.insert(id.clone(), invocation.name);
                line
            }
            DisplayMessageType::ToolComplete => {
                format!("[done] {}: {}", self.tool_name(id), preview(&message.content))
            }
            DisplayMessageType::Error => match self.tool_names.get(id) {
                Some(name) => format!("[failed] {name}: {}", preview(&message.content)),
                None => format!("[error] {}", message.content.trim()),
            },
            DisplayMessageType::Text | DisplayMessageType::ToolOutput => return,
        };
        out.push_str(line.trim_end());
        out.push('\n');
    }

    fn tool_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.tool_names.get(id).map(String::as_str).unwrap_or(id)
    }
}

pub fn format_stats(stats: &ToolCallStats) -> String {
    format!(
        "tools: {} total, {} active, {} completed, {} failed",
        stats.total, stats.active, stats.completed, stats.failed
    )
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

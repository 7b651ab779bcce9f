use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// Decides whether a piece of tool output signals failure.
pub type ErrorClassifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Case-insensitive `error` / `failed` substring check.
pub fn default_error_classifier(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("error") || lower.contains("failed")
}

/// Lifecycle state of a remote tool call. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Starting,
    Running,
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Lifecycle record for one remote tool invocation.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub message_id: String,
    pub name: String,
    pub args: String,
    pub status: ToolStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: String,
    pub error_text: Option<String>,
    pub retry_count: u32,
    failure_pending: bool,
    finished_at: Option<Instant>,
}

impl ToolExecution {
    fn new(message_id: &str, name: &str, args: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            name: name.to_string(),
            args: args.to_string(),
            status: ToolStatus::Starting,
            start_time: Utc::now(),
            end_time: None,
            output: String::new(),
            error_text: None,
            retry_count: 0,
            failure_pending: false,
            finished_at: None,
        }
    }

    /// Whether an error signal has been seen for a still-running tool.
    pub fn failure_pending(&self) -> bool {
        self.failure_pending
    }

    /// Wall-clock duration, once the tool has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Aggregate counters for a session's tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCallStats {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ToolCallStats {
    /// `active == total - completed - failed`.
    pub fn is_consistent(&self) -> bool {
        self.total
            .checked_sub(self.completed + self.failed)
            .is_some_and(|open| open == self.active)
    }
}

/// What a tracker call did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTransition {
    /// A new record was created.
    Started,
    /// The record moved to (or stayed in) `Running`.
    Running,
    /// The record reached a terminal state.
    Finished(ToolStatus),
    /// The event did not change the record.
    Ignored,
}

/// Per-session tool state machine and statistics.
#[derive(Clone)]
pub struct ToolTracker {
    records: HashMap<String, ToolExecution>,
    /// Ids that reached a terminal state. Survives eviction.
    finished: HashSet<String>,
    stats: ToolCallStats,
    classifier: ErrorClassifier,
}

impl Default for ToolTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolTracker")
            .field("records", &self.records.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ToolTracker {
    pub fn new() -> Self {
        Self::with_classifier(Arc::new(default_error_classifier))
    }

    /// Creates a tracker that uses `classifier` to detect failing output.
    pub fn with_classifier(classifier: ErrorClassifier) -> Self {
        Self {
            records: HashMap::new(),
            finished: HashSet::new(),
            stats: ToolCallStats::default(),
            classifier,
        }
    }

    /// Records a `ToolCall`. Repeated calls for a known id are ignored.
    pub fn on_call(&mut self, message_id: &str, name: &str, args: &str) -> ToolTransition {
        if self.is_known(message_id) {
            debug!(message_id, "duplicate tool call ignored");
            return ToolTransition::Ignored;
        }
        self.insert(message_id, name, args);
        info!(message_id, tool = name, "tool started");
        ToolTransition::Started
    }

    /// Records `ToolOutput` content.
    ///
    /// Output for an unknown id implicitly creates the record so the
    /// counters stay balanced. `error_text` is a structured error field.
    pub fn on_output(
        &mut self,
        message_id: &str,
        content: &str,
        error_text: Option<&str>,
        is_final: bool,
    ) -> ToolTransition {
        if self.finished.contains(message_id) && !self.records.contains_key(message_id) {
            debug!(message_id, "output for evicted tool ignored");
            return ToolTransition::Ignored;
        }
        if !self.records.contains_key(message_id) {
            debug!(message_id, "tool output without prior call");
            self.insert(message_id, "unknown", "");
        }
        let classifier = Arc::clone(&self.classifier);
        let Some(record) = self.records.get_mut(message_id) else {
            return ToolTransition::Ignored;
        };
        if record.status.is_terminal() {
            return ToolTransition::Ignored;
        }
        if record.status == ToolStatus::Starting {
            record.status = ToolStatus::Running;
        }
        if content.len() >= record.output.len() {
            record.output = content.to_string();
        }
        let structured = error_text.filter(|e| !e.trim().is_empty());
        if structured.is_some() || classifier(content) {
            record.failure_pending = true;
            if let Some(text) = structured {
                record.error_text = Some(text.to_string());
            }
        }
        if is_final {
            return self.finish(message_id);
        }
        ToolTransition::Running
    }

    /// Sets the failure flag without finishing the tool.
    pub fn flag_failure(&mut self, message_id: &str, error_text: &str) -> bool {
        match self.records.get_mut(message_id) {
            Some(record) if !record.status.is_terminal() => {
                record.failure_pending = true;
                record.error_text = Some(error_text.to_string());
                true
            }
            _ => false,
        }
    }

    /// Moves a tool to its terminal state.
    ///
    /// Ends `Failed` when the failure flag is set, `Completed` otherwise.
    pub fn finish(&mut self, message_id: &str) -> ToolTransition {
        let Some(record) = self.records.get_mut(message_id) else {
            return ToolTransition::Ignored;
        };
        if record.status.is_terminal() {
            return ToolTransition::Ignored;
        }
        let status = if record.failure_pending {
            ToolStatus::Failed
        } else {
            ToolStatus::Completed
        };
        record.status = status;
        record.end_time = Some(Utc::now());
        record.finished_at = Some(Instant::now());
        self.finished.insert(message_id.to_string());

        self.stats.active = self.stats.active.saturating_sub(1);
        match status {
            ToolStatus::Failed => self.stats.failed += 1,
            _ => self.stats.completed += 1,
        }
        info!(message_id, tool = %record.name, ?status, "tool finished");
        ToolTransition::Finished(status)
    }

    /// Fails a tool that can no longer complete.
    pub fn abandon(&mut self, message_id: &str, reason: &str) -> ToolTransition {
        if !self.flag_failure(message_id, reason) {
            return ToolTransition::Ignored;
        }
        self.finish(message_id)
    }

    /// Removes terminal records older than `grace`.
    ///
    /// Counters are unaffected, and evicted ids keep ignoring redelivered
    /// events.
    pub fn evict_expired(&mut self, now: Instant, grace: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| match record.finished_at {
            Some(done) => now.saturating_duration_since(done) < grace,
            None => true,
        });
        let evicted = before - self.records.len();
        if evicted > 0 {
            debug!(evicted, "evicted finished tool records");
        }
        evicted
    }

    pub fn get(&self, message_id: &str) -> Option<&ToolExecution> {
        self.records.get(message_id)
    }

    /// Whether a live record exists for the id.
    pub fn is_tracked(&self, message_id: &str) -> bool {
        self.records.contains_key(message_id)
    }

    /// Whether the id was ever seen as a tool, including evicted ones.
    pub fn is_known(&self, message_id: &str) -> bool {
        self.records.contains_key(message_id) || self.finished.contains(message_id)
    }

    /// Ids of tools that have not reached a terminal state.
    pub fn active_ids(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.message_id.clone())
            .collect()
    }

    /// Live records ordered by start time.
    pub fn snapshot(&self) -> Vec<ToolExecution> {
        let mut records: Vec<ToolExecution> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        records
    }

    pub fn stats(&self) -> ToolCallStats {
        self.stats
    }

    /// Drops every record and resets the counters.
    pub fn clear(&mut self) {
        self.records.clear();
        self.finished.clear();
        self.stats = ToolCallStats::default();
    }

    fn insert(&mut self, message_id: &str, name: &str, args: &str) {
        self.records.insert(
            message_id.to_string(),
            ToolExecution::new(message_id, name, args),
        );
        self.stats.total += 1;
        self.stats.active += 1;
    }
}

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::HistoryError;
use crate::event::DisplayMessage;

const DEFAULT_MAX_ENTRIES: usize = 50;
const HISTORY_FILE_NAME: &str = "chat_sessions.json";

/// One persisted conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub messages: Vec<DisplayMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub total_messages: usize,
    #[serde(default)]
    pub total_tools_used: u64,
}

/// JSON file holding the most recent conversations.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// `AGENTCHAT_HISTORY_PATH`, else `<config dir>/agentchat/chat_sessions.json`.
    pub fn from_env() -> Result<Self, HistoryError> {
        match std::env::var("AGENTCHAT_HISTORY_PATH") {
            Ok(path) if !path.trim().is_empty() => Ok(Self::new(path)),
            _ => Self::default_location(),
        }
    }

    pub fn default_location() -> Result<Self, HistoryError> {
        let dir = dirs::config_dir()
            .map(|dir| dir.join("agentchat"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".agentchat")))
            .ok_or(HistoryError::NoLocation)?;
        Ok(Self::new(dir.join(HISTORY_FILE_NAME)))
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all records. A missing file is an empty history.
    pub fn load(&self) -> Result<Vec<SessionRecord>, HistoryError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(HistoryError::io(&self.path, &err)),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| HistoryError::Format {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Writes `records`, newest first, capped to the configured size.
    pub fn save(&self, records: &[SessionRecord]) -> Result<Vec<SessionRecord>, HistoryError> {
        let mut records = records.to_vec();
        records.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        records.truncate(self.max_entries);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| HistoryError::io(parent, &e))?;
        }
        let json = serde_json::to_string_pretty(&records).map_err(|e| HistoryError::Format {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&self.path, json).map_err(|e| HistoryError::io(&self.path, &e))?;
        debug!(path = %self.path.display(), entries = records.len(), "saved session history");
        Ok(records)
    }

    /// Inserts or replaces `record` by id and saves.
    pub fn record(&self, record: SessionRecord) -> Result<Vec<SessionRecord>, HistoryError> {
        let mut records = self.load()?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.save(&records)
    }

    pub fn find(&self, id: &str) -> Result<Option<SessionRecord>, HistoryError> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, minutes_ago: i64) -> SessionRecord {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        SessionRecord {
            id: id.to_string(),
            agent_id: "agent-1".into(),
            agent_name: "Ops".into(),
            messages: vec![DisplayMessage::user("You", "hi")],
            created_at: at,
            last_active: at,
            total_messages: 1,
            total_tools_used: 0,
        }
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("nope.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn save_sorts_newest_first_and_caps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("nested/history.json")).with_max_entries(2);
        store
            .save(&[record("old", 30), record("new", 1), record("mid", 10)])
            .expect("save");

        let ids: Vec<String> = store
            .load()
            .expect("load")
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn record_replaces_existing_entry_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"));
        store.record(record("s1", 5)).expect("first");
        let mut updated = record("s1", 0);
        updated.total_messages = 7;
        store.record(updated).expect("update");
        store.record(record("s2", 3)).expect("second");

        let records = store.load().expect("load");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "s1");
        assert_eq!(
            store.find("s1").expect("find").map(|r| r.total_messages),
            Some(7)
        );
    }

    #[test]
    fn corrupt_file_reports_format_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").expect("write");
        let err = HistoryStore::new(&path).load().expect_err("format error");
        assert!(matches!(err, HistoryError::Format { .. }));
    }
}

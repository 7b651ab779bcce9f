use std::collections::HashMap;

use crate::event::DisplayMessage;

/// Result of a transcript upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Appended,
    Updated,
    /// The entry was already final; nothing changed.
    Rejected,
}

/// Ordered, update-in-place message log.
///
/// Entries keep their arrival position. Once an entry is final, further
/// upserts for its message id are no-ops.
#[derive(Debug, Default, Clone)]
pub struct TranscriptStore {
    entries: Vec<DisplayMessage>,
    index: HashMap<String, usize>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, msg: DisplayMessage) -> Upsert {
        match self.index.get(&msg.message_id) {
            Some(&pos) => {
                let entry = &mut self.entries[pos];
                if entry.is_final {
                    return Upsert::Rejected;
                }
                entry.content = msg.content;
                entry.timestamp = msg.timestamp;
                entry.kind = msg.kind;
                entry.is_final = msg.is_final;
                if !msg.sender_name.is_empty() {
                    entry.sender_name = msg.sender_name;
                }
                Upsert::Updated
            }
            None => {
                self.index
                    .insert(msg.message_id.clone(), self.entries.len());
                self.entries.push(msg);
                Upsert::Appended
            }
        }
    }

    pub fn get(&self, message_id: &str) -> Option<&DisplayMessage> {
        self.index.get(message_id).map(|&pos| &self.entries[pos])
    }

    /// Copy of the transcript for rendering without holding any lock.
    pub fn snapshot(&self) -> Vec<DisplayMessage> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

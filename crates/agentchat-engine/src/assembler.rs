use std::collections::HashMap;

use tracing::debug;

#[derive(Debug, Default, Clone)]
struct Buffered {
    content: String,
    finalized: bool,
}

/// Turns cumulative content snapshots into emittable suffixes.
///
/// Content is assumed to grow append-only per message id. A snapshot that is
/// not longer than what is already buffered is treated as a stale or
/// duplicated delivery and ignored.
#[derive(Debug, Default, Clone)]
pub struct DeltaAssembler {
    buffered: HashMap<String, Buffered>,
}

impl DeltaAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a cumulative snapshot.
    ///
    /// Returns the new suffix when the snapshot was accepted, `None` when it
    /// was ignored. Accepted suffixes for one message concatenate to its
    /// latest accepted content.
    pub fn apply(&mut self, message_id: &str, cumulative: &str) -> Option<String> {
        let buffered = self.buffered.get(message_id);
        if buffered.is_some_and(|b| b.finalized) {
            debug!(message_id, "ignoring content for finalized message");
            return None;
        }
        let last_len = buffered.map_or(0, |b| b.content.len());
        if cumulative.len() <= last_len {
            if cumulative.len() < last_len {
                debug!(
                    message_id,
                    buffered = last_len,
                    received = cumulative.len(),
                    "ignoring shorter content snapshot"
                );
            }
            return None;
        }
        let Some(delta) = cumulative.get(last_len..) else {
            debug!(message_id, "content snapshot does not extend buffered text");
            return None;
        };
        let delta = delta.to_string();
        self.buffered
            .entry(message_id.to_string())
            .or_default()
            .content = cumulative.to_string();
        Some(delta)
    }

    /// Marks a message as complete and hands back its reconciled content.
    ///
    /// Only the finalized flag is kept, so later snapshots for the same id
    /// are ignored.
    pub fn finalize(&mut self, message_id: &str) -> String {
        let entry = self.buffered.entry(message_id.to_string()).or_default();
        entry.finalized = true;
        std::mem::take(&mut entry.content)
    }

    /// Returns the buffered content of a message that is still open.
    pub fn content(&self, message_id: &str) -> Option<&str> {
        self.buffered
            .get(message_id)
            .filter(|b| !b.finalized)
            .map(|b| b.content.as_str())
    }

    pub fn is_finalized(&self, message_id: &str) -> bool {
        self.buffered
            .get(message_id)
            .map(|b| b.finalized)
            .unwrap_or(false)
    }

    /// Drops all buffered state.
    pub fn clear(&mut self) {
        self.buffered.clear();
    }
}

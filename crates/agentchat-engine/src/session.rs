use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::assembler::DeltaAssembler;
use crate::event::DisplayMessage;
use crate::tracker::{ErrorClassifier, ToolCallStats, ToolExecution, ToolTracker};
use crate::transcript::TranscriptStore;

/// Mutable state of one conversation.
///
/// Only reachable through `SharedSession::lock`, so every mutation happens
/// under the session mutex.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub local_id: uuid::Uuid,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub transcript: TranscriptStore,
    pub assembler: DeltaAssembler,
    pub tracker: ToolTracker,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl SessionState {
    fn new(tracker: ToolTracker) -> Self {
        let now = Utc::now();
        Self {
            local_id: uuid::Uuid::new_v4(),
            agent_id: None,
            session_id: None,
            transcript: TranscriptStore::new(),
            assembler: DeltaAssembler::new(),
            tracker,
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Adopts a session id reported by the remote side.
    pub fn adopt_session_id(&mut self, session_id: &str) -> bool {
        if session_id.trim().is_empty() || self.session_id.as_deref() == Some(session_id) {
            return false;
        }
        self.session_id = Some(session_id.to_string());
        true
    }

    /// Forgets the conversation while keeping the agent binding.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.transcript.clear();
        self.assembler.clear();
        self.tracker.clear();
        self.local_id = uuid::Uuid::new_v4();
        self.created_at = Utc::now();
        self.touch();
    }
}

/// Session state plus the refresh signal presentation loops wait on.
pub(crate) struct SharedSession {
    state: Mutex<SessionState>,
    revision: watch::Sender<u64>,
}

impl SharedSession {
    pub fn new(classifier: Option<ErrorClassifier>) -> Self {
        let tracker = match classifier {
            Some(classifier) => ToolTracker::with_classifier(classifier),
            None => ToolTracker::new(),
        };
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(SessionState::new(tracker)),
            revision,
        }
    }

    /// Locks the state. A panic in another holder does not poison readers.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bumps the revision so views know a fresh snapshot is available.
    pub fn notify(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let revision = *self.revision.borrow();
        let state = self.lock();
        SessionSnapshot {
            revision,
            agent_id: state.agent_id.clone(),
            session_id: state.session_id.clone(),
            messages: state.transcript.snapshot(),
            tools: state.tracker.snapshot(),
            stats: state.tracker.stats(),
            last_active: state.last_active,
        }
    }
}

/// Point-in-time copy of a session for rendering.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub revision: u64,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub messages: Vec<DisplayMessage>,
    pub tools: Vec<ToolExecution>,
    pub stats: ToolCallStats,
    pub last_active: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Returns the transcript entry for a message id.
    pub fn message(&self, message_id: &str) -> Option<&DisplayMessage> {
        self.messages.iter().find(|m| m.message_id == message_id)
    }

    /// Returns the live tool record for a message id.
    pub fn tool(&self, message_id: &str) -> Option<&ToolExecution> {
        self.tools.iter().find(|t| t.message_id == message_id)
    }
}

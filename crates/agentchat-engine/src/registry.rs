use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::config::EngineConfig;
use crate::controller::SessionController;
use crate::errors::SessionError;
use crate::transport::AgentTransport;

/// One session controller per agent id.
pub struct SessionRegistry {
    transport: Arc<dyn AgentTransport>,
    config: EngineConfig,
    sessions: DashMap<String, Arc<SessionController>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn AgentTransport>, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Returns the started controller for `agent_id`, creating it if needed.
    pub fn start(&self, agent_id: &str) -> Result<Arc<SessionController>, SessionError> {
        let agent_id = agent_id.trim();
        if let Some(existing) = self.sessions.get(agent_id) {
            return Ok(Arc::clone(existing.value()));
        }
        match self.sessions.entry(agent_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let controller = SessionController::new(
                    Arc::clone(&self.transport),
                    self.config.clone(),
                )?;
                controller.start(agent_id)?;
                let controller = Arc::new(controller);
                entry.insert(Arc::clone(&controller));
                info!(agent_id, "registered session");
                Ok(controller)
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<SessionController>> {
        self.sessions
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes the controller for `agent_id` and cancels its exchanges.
    pub fn remove(&self, agent_id: &str) -> Option<Arc<SessionController>> {
        let (_, controller) = self.sessions.remove(agent_id)?;
        controller.cancel();
        Some(controller)
    }

    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

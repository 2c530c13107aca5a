//! In-memory session registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{GnomeError, GnomeResult};

use super::{ActiveModel, SessionId, SessionRegistry};

/// Default cap on sessions holding an active model.
const DEFAULT_MAX_SESSIONS: usize = 256;

/// Thread-safe registry keeping active models in process memory.
#[derive(Debug)]
pub struct InMemorySessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ActiveModel>>>,
    max_sessions: usize,
}

impl Default for InMemorySessionRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }
}

impl InMemorySessionRegistry {
    /// Create a registry holding at most `max_sessions` active models.
    #[must_use]
    pub fn with_capacity(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
        }
    }
}

impl SessionRegistry for InMemorySessionRegistry {
    fn active_model(&self, session: SessionId) -> Option<Arc<ActiveModel>> {
        self.sessions.read().get(&session).cloned()
    }

    fn set_active_model(&self, session: SessionId, model: ActiveModel) -> GnomeResult<Arc<ActiveModel>> {
        let mut sessions = self.sessions.write();
        if !sessions.contains_key(&session) && sessions.len() >= self.max_sessions {
            return Err(GnomeError::SessionLimit {
                max: self.max_sessions,
            });
        }
        let model = Arc::new(model);
        // In-flight requests keep the replaced model alive until they finish.
        if let Some(previous) = sessions.insert(session, Arc::clone(&model)) {
            tracing::info!(%session, previous = %previous.id(), model = %model.id(), "active model replaced");
        } else {
            tracing::info!(%session, model = %model.id(), "active model installed");
        }
        Ok(model)
    }

    fn remove_active_model(&self, session: SessionId) -> Option<Arc<ActiveModel>> {
        let removed = self.sessions.write().remove(&session);
        if let Some(model) = &removed {
            tracing::info!(%session, model = %model.id(), "active model removed");
        }
        removed
    }

    fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

use crate::backend::ChatBackend;
use crate::error::ChatError;
use crate::types::{ConversationSession, Role, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub fn normalize_identity(value: &str) -> String {
    value.trim().to_string()
}

/// Canonical key for a (user, agency) pairing. Both sides of the product
/// build the same key for the same pair.
pub fn build_pair_key(user_id: &str, agency_id: &str) -> Result<String, ChatError> {
    let user = normalize_identity(user_id);
    if user.is_empty() {
        return Err(ChatError::InvalidIdentity("user id is empty".to_string()));
    }
    let agency = normalize_identity(agency_id);
    if agency.is_empty() {
        return Err(ChatError::InvalidIdentity("agency id is empty".to_string()));
    }
    Ok(format!("user:{}|agency:{}", user, agency))
}

/// Maps the caller's side of a conversation onto the canonical (user, agency) order.
pub fn canonical_pair<'a>(viewer: Role, self_id: &'a str, counterpart_id: &'a str) -> (&'a str, &'a str) {
    match viewer {
        Role::User => (self_id, counterpart_id),
        Role::Agency => (counterpart_id, self_id),
    }
}

pub struct SessionResolver {
    backend: Arc<dyn ChatBackend>,
    resolved: Mutex<HashMap<String, SessionId>>,
}

impl SessionResolver {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve_session(
        &self,
        user_id: &str,
        agency_id: &str,
    ) -> Result<SessionId, ChatError> {
        let key = build_pair_key(user_id, agency_id)?;
        if let Some(id) = self.cached(&key) {
            return Ok(id);
        }

        let user = normalize_identity(user_id);
        let agency = normalize_identity(agency_id);
        let session = self
            .backend
            .resolve_session(&user, &agency)
            .await
            .map_err(|source| ChatError::SessionResolution {
                user_id: user.clone(),
                agency_id: agency.clone(),
                source,
            })?;

        debug!(session = %session.id, "resolved session for {key}");
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        // A concurrent resolution may have landed first; keep the first answer.
        let id = resolved.entry(key).or_insert(session.id).clone();
        Ok(id)
    }

    pub async fn resolve_for(
        &self,
        viewer: Role,
        self_id: &str,
        counterpart_id: &str,
    ) -> Result<SessionId, ChatError> {
        let (user, agency) = canonical_pair(viewer, self_id, counterpart_id);
        self.resolve_session(user, agency).await
    }

    pub fn forget(&self, user_id: &str, agency_id: &str) {
        if let Ok(key) = build_pair_key(user_id, agency_id) {
            self.resolved
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        }
    }

    pub async fn list_sessions(
        &self,
        viewer: Role,
        id: &str,
    ) -> Result<Vec<ConversationSession>, ChatError> {
        let id = normalize_identity(id);
        if id.is_empty() {
            return Err(ChatError::InvalidIdentity(format!("{viewer} id is empty")));
        }
        let sessions = self
            .backend
            .list_sessions(viewer, &id)
            .await
            .map_err(|source| match viewer {
                Role::User => ChatError::SessionResolution {
                    user_id: id.clone(),
                    agency_id: String::new(),
                    source,
                },
                Role::Agency => ChatError::SessionResolution {
                    user_id: String::new(),
                    agency_id: id.clone(),
                    source,
                },
            })?;

        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        for session in &sessions {
            if let Ok(key) = build_pair_key(&session.user_id, &session.agency_id) {
                resolved.entry(key).or_insert_with(|| session.id.clone());
            }
        }
        Ok(sessions)
    }

    fn cached(&self, key: &str) -> Option<SessionId> {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

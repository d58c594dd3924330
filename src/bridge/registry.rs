//! Live sessions, at most one per client id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::session::Session;

#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    /// Return the session for `client_id` with one more pending open,
    /// creating it with `create` when absent. The flag is `true` when the
    /// session was created by this call.
    pub async fn reserve_open<E>(
        &self,
        client_id: &str,
        create: impl FnOnce() -> Result<Arc<Session>, E>,
    ) -> Result<(Arc<Session>, bool), E> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(client_id) {
            existing.begin_open();
            return Ok((existing.clone(), false));
        }
        let session = create()?;
        session.begin_open();
        sessions.insert(client_id.to_string(), session.clone());
        Ok((session, true))
    }

    /// Remove the entry only if it is still `session` and no open is
    /// waiting for it
    pub async fn remove_if_idle(&self, client_id: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(client_id) {
            Some(current) if Arc::ptr_eq(current, session) && session.pending_opens() == 0 => {
                sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take every session out
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}

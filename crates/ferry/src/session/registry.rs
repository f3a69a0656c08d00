use std::collections::HashMap;
use std::sync::Arc;

use ferry_bus::CallId;
use parking_lot::RwLock;

use super::PeerSession;
use crate::error::FerryError;

/// Live sessions keyed by call id. The lock only guards the map; session
/// state lives behind each session's own mutex.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<CallId, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<PeerSession>) -> Result<(), FerryError> {
        let mut sessions = self.sessions.write();
        let call_id = session.call_id().clone();
        if sessions.contains_key(&call_id) {
            return Err(FerryError::SessionExists(call_id));
        }
        sessions.insert(call_id, session);
        Ok(())
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.sessions.read().contains_key(call_id)
    }

    pub fn remove(&self, call_id: &CallId) -> Option<Arc<PeerSession>> {
        self.sessions.write().remove(call_id)
    }

    pub fn snapshot(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use crate::transport::memory::MemoryNetwork;
    use ferry_bus::LocalBus;

    fn session(call_id: &str) -> Arc<PeerSession> {
        PeerSession::new(
            CallId::from(call_id),
            Role::Caller,
            "alice",
            "bob",
            MemoryNetwork::new().transport(),
            Arc::new(LocalBus::new()),
        )
    }

    #[test]
    fn rejects_duplicate_call_ids() {
        let registry = SessionRegistry::new();
        registry.insert(session("c1")).expect("first insert");
        let err = registry.insert(session("c1")).unwrap_err();
        assert!(matches!(err, FerryError::SessionExists(id) if id.as_str() == "c1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_returns_the_session_once() {
        let registry = SessionRegistry::new();
        registry.insert(session("c1")).expect("insert");
        registry.insert(session("c0")).expect("insert");
        assert_eq!(
            registry.call_ids(),
            vec![CallId::from("c0"), CallId::from("c1")]
        );
        assert!(registry.remove(&CallId::from("c1")).is_some());
        assert!(registry.remove(&CallId::from("c1")).is_none());
        assert!(!registry.contains(&CallId::from("c1")));
        assert_eq!(registry.snapshot().len(), 1);
    }
}

use std::sync::Arc;

use dashmap::DashMap;

use palaver_core::{NodeId, SessionId};

use crate::session::{Session, SessionKind};

/// Registry of every live session on this node, local and stand-in alike.
/// Lookup by id is the hot path for cluster deliveries, hence the
/// concurrent map instead of a single lock.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created session. Ids are generated, so a collision
    /// indicates a bug; the old entry wins and the insert is reported.
    pub fn add(&self, sess: Arc<Session>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(sess.id.clone()) {
            Entry::Occupied(_) => {
                tracing::error!(sid = %sess.id, "duplicate session id on insert");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(sess);
                true
            }
        }
    }

    pub fn get(&self, sid: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(sid).map(|s| Arc::clone(&s))
    }

    pub fn remove(&self, sid: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(sid).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions attached to a live client transport.
    pub fn local_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.kind.is_local())
            .count()
    }

    /// Drop the session from the registry and tear it down. The returned
    /// future completes once in-flight requests have drained and every
    /// topic has been notified.
    pub async fn evict(&self, sid: &SessionId) {
        if let Some(sess) = self.remove(sid) {
            sess.clean_up().await;
        }
    }

    /// Tear down every proxy and multiplex session tied to a peer node.
    /// Called when the peer restarts or leaves the cluster.
    pub async fn invalidate_node(&self, node: &NodeId) {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|s| {
                matches!(s.kind, SessionKind::Proxy | SessionKind::Multiplex)
                    && s.node.as_ref() == Some(node)
            })
            .map(|s| Arc::clone(&s))
            .collect();
        if stale.is_empty() {
            return;
        }
        tracing::info!(node = %node, count = stale.len(), "invalidating sessions for node");
        for sess in stale {
            self.sessions.remove(&sess.id);
            sess.clean_up().await;
        }
    }

    /// Tear down everything. Used on server shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|s| Arc::clone(&s))
            .collect();
        self.sessions.clear();
        for sess in all {
            sess.clean_up().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::UserId;
    use tokio::sync::mpsc;

    #[test]
    fn add_get_remove() {
        let store = SessionStore::new();
        let (sess, _rx) = Session::new(SessionKind::Websocket, 4);
        assert!(store.add(Arc::clone(&sess)));
        assert!(!store.add(Arc::clone(&sess)), "same id rejected");
        assert_eq!(store.len(), 1);
        assert!(store.get(&sess.id).is_some());
        assert!(store.remove(&sess.id).is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn evict_terminates_the_session() {
        let store = SessionStore::new();
        let (sess, _rx) = Session::new(SessionKind::Websocket, 4);
        store.add(Arc::clone(&sess));
        store.evict(&sess.id).await;
        assert!(sess.is_terminating());
        assert!(store.get(&sess.id).is_none());
    }

    #[tokio::test]
    async fn invalidate_node_spares_local_sessions() {
        let store = SessionStore::new();
        let (local, _rx) = Session::new(SessionKind::Websocket, 4);
        store.add(Arc::clone(&local));

        let beta = NodeId::new("beta");
        let (mplex, _mrx) = Session::new_multiplex(beta.clone(), 4);
        let (tx, _prx) = mpsc::channel(4);
        let proxy = Session::new_proxy(
            SessionId::new(),
            UserId(7),
            "ua/1".into(),
            false,
            beta.clone(),
            mplex.id.clone(),
            tx,
        );
        store.add(Arc::clone(&mplex));
        store.add(Arc::clone(&proxy));

        store.invalidate_node(&beta).await;
        assert!(mplex.is_terminating());
        assert!(proxy.is_terminating());
        assert!(!local.is_terminating());
        assert_eq!(store.len(), 1);
        assert_eq!(store.local_count(), 1);
    }
}

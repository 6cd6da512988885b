use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use palaver_core::envelope::{ClientAcc, PresWhat, ServerPayload};
use palaver_core::topic::category_of;
use palaver_core::{ClientEnvelope, EngineError, NodeId, ServerEnvelope};

use crate::router::{LocalRouter, RemoteRouter};
use crate::session::Session;
use crate::topic::{ExitReason, JoinRequest, Topic, TopicCtrl, TopicDeps, TopicHandle};
use crate::EngineConfig;

/// Commands topics send back to the hub.
#[derive(Debug)]
pub enum HubCmd {
    /// An idle or failed topic wants out of the registry.
    Unregister { name: String },
    /// Delete the topic everywhere: storage, registry, actor.
    Delete { name: String, hard: bool },
}

/// Registry of every topic actor on this node, plus the collaborators they
/// share. The hub is the only place topics are spawned, found, and torn
/// down.
pub struct Hub {
    topics: DashMap<String, TopicHandle>,
    store: Arc<dyn palaver_store::Store>,
    auth: Arc<dyn palaver_store::Auth>,
    push: Arc<dyn palaver_store::Push>,
    /// Swapped in by the cluster layer after startup; defaults to local.
    router: RwLock<Arc<dyn RemoteRouter>>,
    cmd_tx: mpsc::Sender<HubCmd>,
    cfg: EngineConfig,
}

impl Hub {
    pub fn new(
        store: Arc<dyn palaver_store::Store>,
        auth: Arc<dyn palaver_store::Auth>,
        push: Arc<dyn palaver_store::Push>,
        cfg: EngineConfig,
    ) -> Arc<Hub> {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);
        let hub = Arc::new(Hub {
            topics: DashMap::new(),
            store,
            auth,
            push,
            router: RwLock::new(Arc::new(LocalRouter)),
            cmd_tx,
            cfg,
        });

        // The loop holds only a weak reference so dropping the last Arc
        // shuts it down.
        let weak = Arc::downgrade(&hub);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let Some(hub) = weak.upgrade() else { break };
                match cmd {
                    HubCmd::Unregister { name } => hub.unregister(&name),
                    HubCmd::Delete { name, hard } => {
                        if let Err(err) = hub.delete(&name, hard).await {
                            tracing::warn!(topic = %name, error = %err, "topic delete failed");
                        }
                    }
                }
            }
        });
        hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn palaver_store::Store> {
        &self.store
    }

    pub fn auth(&self) -> &Arc<dyn palaver_store::Auth> {
        &self.auth
    }

    pub fn push(&self) -> &Arc<dyn palaver_store::Push> {
        &self.push
    }

    pub fn router(&self) -> Arc<dyn RemoteRouter> {
        Arc::clone(&self.router.read())
    }

    /// Install the cluster router. Called once during startup, before any
    /// client traffic.
    pub fn set_router(&self, router: Arc<dyn RemoteRouter>) {
        *self.router.write() = router;
    }

    pub fn get(&self, name: &str) -> Option<TopicHandle> {
        let handle = self.topics.get(name).map(|h| h.clone())?;
        if handle.is_dead() {
            self.topics.remove(name);
            return None;
        }
        Some(handle)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn deps(&self) -> TopicDeps {
        TopicDeps {
            store: Arc::clone(&self.store),
            auth: Arc::clone(&self.auth),
            push: Arc::clone(&self.push),
            router: self.router(),
            hub_tx: self.cmd_tx.clone(),
        }
    }

    /// Find the topic actor, spawning it if absent or dead. A topic owned
    /// by a peer node is spawned as a proxy.
    pub fn ensure_topic(&self, name: &str) -> Result<TopicHandle, EngineError> {
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }
        let category = category_of(name)
            .ok_or_else(|| EngineError::Malformed(format!("unroutable topic {name}")))?;
        let master = self.router().node_for(name);

        use dashmap::mapref::entry::Entry;
        match self.topics.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_dead() {
                    let handle =
                        Topic::spawn(name, category, master, self.deps(), self.cfg.clone());
                    slot.insert(handle.clone());
                    Ok(handle)
                } else {
                    Ok(slot.get().clone())
                }
            }
            Entry::Vacant(slot) => {
                tracing::debug!(topic = %name, ?category, proxy = master.is_some(), "spawning topic");
                let handle = Topic::spawn(name, category, master, self.deps(), self.cfg.clone());
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Route a subscribe request to its topic, spawning the actor on
    /// first touch. Errors go back to the session as ctrl replies.
    pub async fn join(&self, sess: &Arc<Session>, env: ClientEnvelope) {
        let id = env.id().map(String::from);
        let original = env.original.clone();
        let result = self
            .ensure_topic(&env.topic)
            .and_then(|handle| handle.try_join(JoinRequest::new(Arc::clone(sess), env)));
        if let Err(err) = result {
            sess.queue_out(ServerEnvelope::ctrl_err(id, &original, &err));
        }
    }

    /// Deliver a server-originated envelope to the topic that owns it,
    /// hopping to the owning node when the topic is remote.
    pub fn route(&self, env: ServerEnvelope) -> Result<(), EngineError> {
        let router = self.router();
        if router.is_remote(&env.topic) {
            return router.route(env);
        }
        match self.get(&env.topic) {
            Some(handle) => handle.try_server(env),
            None => Err(EngineError::TopicNotFound(env.topic)),
        }
    }

    /// Profile update for the authenticated user.
    pub async fn account_update(&self, sess: &Arc<Session>, acc: ClientAcc) {
        let id = acc.id.clone();
        let uid = sess.uid();
        if uid.is_none() {
            sess.queue_out(ServerEnvelope::ctrl_err(id, "", &EngineError::AuthRequired));
            return;
        }
        if acc.user.is_some_and(|u| u != uid) {
            sess.queue_out(ServerEnvelope::ctrl_err(
                id,
                "",
                &EngineError::PermissionDenied,
            ));
            return;
        }
        match self
            .store
            .user_update(uid, acc.public, acc.default_access)
            .await
        {
            Ok(()) => {
                sess.queue_out(ServerEnvelope::ctrl_ok(id, ""));
            }
            Err(err) => {
                sess.queue_out(ServerEnvelope::ctrl_err(id, "", &EngineError::from(err)));
            }
        }
    }

    fn unregister(&self, name: &str) {
        if let Some((_, handle)) = self.topics.remove(name) {
            handle.mark_dead();
            tracing::debug!(topic = %name, "topic unregistered");
        }
    }

    /// Delete a topic: storage first, then the running actor. A missing
    /// storage record is not an error; p2p topics are deleted before their
    /// record may exist.
    pub async fn delete(&self, name: &str, hard: bool) -> Result<(), EngineError> {
        if self.get(name).is_none() {
            self.notify_offline_delete(name).await;
        }
        match self.store.topic_delete(name, hard).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        if let Some((_, handle)) = self.topics.remove(name) {
            if let Ok(done) = handle.exit(ExitReason::Deleted).await {
                let _ = done.await;
            }
        }
        tracing::info!(topic = %name, hard, "topic deleted");
        Ok(())
    }

    /// No actor is loaded to announce the teardown, so subscribers hear a
    /// "gone" through their personal topics instead.
    async fn notify_offline_delete(&self, name: &str) {
        let subs = match self.store.subs_for_topic(name).await {
            Ok(subs) => subs,
            Err(err) => {
                if !err.is_not_found() {
                    tracing::debug!(topic = %name, error = %err, "cannot load subscribers for delete notice");
                }
                return;
            }
        };
        for sub in subs {
            let mut pres =
                ServerEnvelope::pres(format!("me{}", sub.user.0), PresWhat::Gone, sub.user);
            if let ServerPayload::Pres(p) = &mut pres.payload {
                p.src = name.to_string();
                p.user = None;
            }
            if let Err(err) = self.route(pres) {
                tracing::debug!(topic = %name, user = %sub.user, error = %err, "delete notice dropped");
            }
        }
    }

    /// Ring membership changed: shut down every actor whose ownership no
    /// longer matches the ring. Attached clients resubscribe and land on
    /// the new owner.
    pub async fn rehash(&self) {
        let router = self.router();
        let moved: Vec<TopicHandle> = self
            .topics
            .iter()
            .filter(|entry| entry.value().master != router.node_for(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        if moved.is_empty() {
            return;
        }
        tracing::info!(count = moved.len(), "ring changed, shutting down moved topics");
        for handle in moved {
            self.topics.remove(&handle.name);
            if let Ok(done) = handle.exit(ExitReason::Rehash).await {
                let _ = done.await;
            }
        }
    }

    /// A peer node restarted or vanished: drop its proxy attachments from
    /// local masters and tear down proxies it was mastering.
    pub async fn invalidate_node(&self, node: &NodeId) {
        let mut lost: Vec<TopicHandle> = Vec::new();
        for entry in self.topics.iter() {
            let handle = entry.value();
            if handle.master.as_ref() == Some(node) {
                lost.push(handle.clone());
            } else if !handle.is_proxy {
                let _ = handle.try_ctrl(TopicCtrl::ProxyDetached { node: node.clone() });
            }
        }
        for handle in lost {
            self.topics.remove(&handle.name);
            if let Ok(done) = handle.exit(ExitReason::MasterLost).await {
                let _ = done.await;
            }
        }
    }

    /// Orderly shutdown of every topic actor.
    pub async fn shutdown(&self) {
        let all: Vec<TopicHandle> = self.topics.iter().map(|e| e.value().clone()).collect();
        self.topics.clear();
        for handle in all {
            if let Ok(done) = handle.exit(ExitReason::Shutdown).await {
                let _ = done.await;
            }
        }
        tracing::info!("hub shut down");
    }
}

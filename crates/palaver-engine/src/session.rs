use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, Notify};

use palaver_core::{
    envelope::ClientPayload, topic::route_topic_name, ClientEnvelope, EngineError, NodeId,
    ServerEnvelope, SessionId, UserId,
};

use crate::hub::Hub;
use crate::topic::{JoinRequest, LeaveNotice, SessionUpdate, TopicHandle};

/// How the session reaches its client (or peer node).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Websocket,
    LongPoll,
    Rpc,
    /// Ephemeral stand-in for a session living on another node.
    Proxy,
    /// Aggregates every remote session from one node for one topic.
    Multiplex,
}

impl SessionKind {
    /// Attached to a real transport on this node.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Websocket | Self::LongPoll | Self::Rpc)
    }
}

/// An outbound envelope tagged with the remote session it is addressed to;
/// the wildcard id marks a broadcast for every session behind the link.
pub type TaggedEnvelope = (SessionId, ServerEnvelope);

enum SessionLink {
    /// Drained by the transport adapter.
    Direct(mpsc::Sender<ServerEnvelope>),
    /// Drained by the cluster relay; broadcasts carry the wildcard id.
    Multiplex(mpsc::Sender<TaggedEnvelope>),
    /// Forwards into the anchoring multiplex link, tagged with our own id.
    Proxy(mpsc::Sender<TaggedEnvelope>),
}

/// Counts requests a topic is still processing for this session, so
/// teardown cannot race a subscribe/unsubscribe in flight.
pub struct InflightGauge {
    count: AtomicUsize,
    idle: Notify,
}

impl InflightGauge {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub async fn wait_idle(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII tracker for an in-flight request; dropping it (on any path,
/// including a dropped mailbox message) releases the gauge.
pub struct InflightGuard(Arc<Session>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.done();
    }
}

/// One client connection or one cluster link.
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    /// Peer node for proxy/multiplex sessions.
    pub node: Option<NodeId>,
    /// Multiplex link a proxy session forwards through.
    anchor: Option<SessionId>,
    uid: AtomicU64,
    user_agent: RwLock<String>,
    handshaken: AtomicBool,
    background: AtomicBool,
    terminating: AtomicBool,
    stalled: AtomicBool,
    link: SessionLink,
    /// Topic membership. Touched by both the transport worker and topic
    /// workers, hence the dedicated lock.
    subs: Mutex<HashMap<String, TopicHandle>>,
    /// Remote users represented by a multiplex link.
    remote_uids: Mutex<HashSet<UserId>>,
    inflight: InflightGauge,
}

impl Session {
    /// New transport-facing session. The adapter drains the receiver.
    pub fn new(kind: SessionKind, queue: usize) -> (Arc<Self>, mpsc::Receiver<ServerEnvelope>) {
        debug_assert!(kind.is_local());
        let (tx, rx) = mpsc::channel(queue);
        (
            Arc::new(Self::build(SessionId::new(), kind, None, SessionLink::Direct(tx))),
            rx,
        )
    }

    /// New multiplex link for one (topic, node) pair. The cluster relay
    /// drains the receiver and ships envelopes to the peer.
    pub fn new_multiplex(node: NodeId, queue: usize) -> (Arc<Self>, mpsc::Receiver<TaggedEnvelope>) {
        let (tx, rx) = mpsc::channel(queue);
        (
            Arc::new(Self::build(
                SessionId::new(),
                SessionKind::Multiplex,
                Some(node),
                SessionLink::Multiplex(tx),
            )),
            rx,
        )
    }

    /// New proxy stand-in for a remote session, anchored to a multiplex link.
    pub fn new_proxy(
        sid: SessionId,
        uid: UserId,
        user_agent: String,
        background: bool,
        node: NodeId,
        anchor: SessionId,
        mplex_tx: mpsc::Sender<TaggedEnvelope>,
    ) -> Arc<Self> {
        let mut sess = Self::build(sid, SessionKind::Proxy, Some(node), SessionLink::Proxy(mplex_tx));
        sess.anchor = Some(anchor);
        sess.uid.store(uid.0, Ordering::SeqCst);
        *sess.user_agent.write() = user_agent;
        sess.background.store(background, Ordering::SeqCst);
        sess.handshaken.store(true, Ordering::SeqCst);
        Arc::new(sess)
    }

    fn build(id: SessionId, kind: SessionKind, node: Option<NodeId>, link: SessionLink) -> Self {
        Self {
            id,
            kind,
            node,
            anchor: None,
            uid: AtomicU64::new(0),
            user_agent: RwLock::new(String::new()),
            handshaken: AtomicBool::new(false),
            background: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            link,
            subs: Mutex::new(HashMap::new()),
            remote_uids: Mutex::new(HashSet::new()),
            inflight: InflightGauge::new(),
        }
    }

    pub fn uid(&self) -> UserId {
        UserId(self.uid.load(Ordering::SeqCst))
    }

    pub fn set_uid(&self, uid: UserId) {
        self.uid.store(uid.0, Ordering::SeqCst);
    }

    pub fn user_agent(&self) -> String {
        self.user_agent.read().clone()
    }

    pub fn is_background(&self) -> bool {
        self.background.load(Ordering::SeqCst)
    }

    pub fn set_background(&self, bg: bool) {
        self.background.store(bg, Ordering::SeqCst);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Marked when an outbound enqueue failed; the owner should evict.
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Non-blocking outbound enqueue. `false` means the envelope was
    /// dropped: the session is terminating, stalled, or gone. Never blocks
    /// the producing worker.
    pub fn queue_out(&self, env: ServerEnvelope) -> bool {
        if self.is_terminating() {
            return false;
        }
        let result = match &self.link {
            SessionLink::Direct(tx) => tx.try_send(env).map_err(describe),
            SessionLink::Multiplex(tx) => {
                tx.try_send((SessionId::wildcard(), env)).map_err(describe)
            }
            SessionLink::Proxy(tx) => tx.try_send((self.id.clone(), env)).map_err(describe),
        };
        match result {
            Ok(()) => true,
            Err(full) => {
                if full {
                    self.stalled.store(true, Ordering::SeqCst);
                    tracing::warn!(sid = %self.id, "outbound queue full, session stalled");
                }
                false
            }
        }
    }

    pub fn anchor(&self) -> Option<SessionId> {
        self.anchor.clone()
    }

    /// Broadcast delivery through the owning link, addressed to every
    /// session behind it with the wildcard id. Proxy/multiplex only.
    pub fn forward_wildcard(&self, env: ServerEnvelope) -> bool {
        match &self.link {
            SessionLink::Proxy(tx) | SessionLink::Multiplex(tx) => {
                tx.try_send((SessionId::wildcard(), env)).is_ok()
            }
            SessionLink::Direct(_) => false,
        }
    }

    /// Clone of the outbound channel behind a multiplex link. Proxy
    /// sessions anchored to the link enqueue into the same channel.
    pub fn multiplex_sender(&self) -> Option<mpsc::Sender<TaggedEnvelope>> {
        match &self.link {
            SessionLink::Multiplex(tx) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Begin tracking an in-flight request on behalf of this session.
    pub fn track(self: &Arc<Self>) -> InflightGuard {
        self.inflight.add();
        InflightGuard(Arc::clone(self))
    }

    // --- topic membership ---

    pub fn subscribe(&self, topic: &str, handle: TopicHandle) -> bool {
        let mut subs = self.subs.lock();
        if subs.contains_key(topic) {
            return false;
        }
        subs.insert(topic.to_string(), handle);
        true
    }

    pub fn unsubscribe(&self, topic: &str) -> Option<TopicHandle> {
        self.subs.lock().remove(topic)
    }

    pub fn subscription(&self, topic: &str) -> Option<TopicHandle> {
        self.subs.lock().get(topic).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn subscriptions(&self) -> Vec<TopicHandle> {
        self.subs.lock().values().cloned().collect()
    }

    // --- multiplex bookkeeping ---

    pub fn add_remote_uid(&self, uid: UserId) {
        self.remote_uids.lock().insert(uid);
    }

    pub fn remove_remote_uid(&self, uid: UserId) {
        self.remote_uids.lock().remove(&uid);
    }

    pub fn remote_uids(&self) -> Vec<UserId> {
        self.remote_uids.lock().iter().copied().collect()
    }

    pub fn has_remote_uid(&self, uid: UserId) -> bool {
        self.remote_uids.lock().contains(&uid)
    }

    /// Idempotent teardown: stop accepting sends, wait out in-flight
    /// requests, then push a synthetic leave onto every attached topic.
    pub async fn clean_up(self: &Arc<Self>) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inflight.wait_idle().await;

        let subs: Vec<(String, TopicHandle)> = self.subs.lock().drain().collect();
        for (topic, handle) in subs {
            let notice = LeaveNotice::synthetic(Arc::clone(self));
            if let Err(err) = handle.try_leave(notice) {
                tracing::debug!(sid = %self.id, topic = %topic, error = %err, "leave dropped during cleanup");
            }
        }
        tracing::debug!(sid = %self.id, kind = ?self.kind, "session cleaned up");
    }

    /// Entry point for decoded inbound traffic from a transport adapter.
    /// Every reply goes back through the outbound queue; `note` errors are
    /// silently dropped because notes are unacknowledged.
    pub async fn dispatch(self: &Arc<Self>, payload: ClientPayload, hub: &Arc<Hub>) {
        if self.is_terminating() {
            return;
        }
        let id = payload.id().map(str::to_string);
        let uid = self.uid();

        match payload {
            ClientPayload::Hi(hi) => {
                let supported = hub.config().proto_version;
                if hi.ver.split('.').next() != supported.split('.').next() {
                    self.reply_err(id, "", &EngineError::VersionNotSupported(hi.ver));
                    return;
                }
                *self.user_agent.write() = hi.user_agent.clone();
                let was_background = self.background.swap(hi.background, Ordering::SeqCst);
                self.handshaken.store(true, Ordering::SeqCst);

                // Attached topics hear the new user agent; a session coming
                // out of background starts counting as online.
                let foregrounded = was_background && !hi.background;
                for handle in self.subscriptions() {
                    let upd = SessionUpdate::UserAgent {
                        sid: self.id.clone(),
                        user_agent: hi.user_agent.clone(),
                    };
                    if let Err(err) = handle.try_update(upd) {
                        tracing::debug!(sid = %self.id, topic = %handle.name, error = %err, "user-agent update dropped");
                    }
                    if foregrounded {
                        let upd = SessionUpdate::Foreground {
                            sid: self.id.clone(),
                        };
                        if let Err(err) = handle.try_update(upd) {
                            tracing::debug!(sid = %self.id, topic = %handle.name, error = %err, "foreground update dropped");
                        }
                    }
                }
                let mut env = ServerEnvelope::ctrl_ok(id, "");
                if let palaver_core::envelope::ServerPayload::Ctrl(c) = &mut env.payload {
                    c.params = Some(json!({ "ver": hub.config().proto_version }));
                }
                self.queue_out(env);
            }
            ClientPayload::Login(login) => {
                match hub.auth().authenticate(&login.scheme, &login.secret).await {
                    Ok(ctx) => {
                        self.set_uid(ctx.uid);
                        let _ = hub
                            .store()
                            .user_update_last_seen(ctx.uid, chrono::Utc::now(), &self.user_agent())
                            .await;
                        let mut env = ServerEnvelope::ctrl_ok(id, "");
                        if let palaver_core::envelope::ServerPayload::Ctrl(c) = &mut env.payload {
                            c.params = Some(json!({ "user": ctx.uid }));
                        }
                        self.queue_out(env);
                        tracing::info!(sid = %self.id, user = %ctx.uid, "session authenticated");
                    }
                    Err(err) => {
                        self.reply_err(id, "", &err.into());
                    }
                }
            }
            ClientPayload::Acc(acc) => {
                hub.account_update(self, acc).await;
            }
            ClientPayload::Sub(sub) => {
                let routed = match route_topic_name(&sub.topic, uid) {
                    Ok(r) => r,
                    Err(err) => {
                        self.reply_err(id, &sub.topic, &err);
                        return;
                    }
                };
                let mut env = ClientEnvelope::new(ClientPayload::Sub(sub), self.id.clone(), uid);
                env.topic = routed.name;
                env.original = routed.original;
                hub.join(self, env).await;
            }
            ClientPayload::Leave(leave) => {
                let routed = match route_topic_name(&leave.topic, uid) {
                    Ok(r) => r,
                    Err(err) => {
                        self.reply_err(id, &leave.topic, &err);
                        return;
                    }
                };
                match self.subscription(&routed.name) {
                    Some(handle) => {
                        let mut env =
                            ClientEnvelope::new(ClientPayload::Leave(leave), self.id.clone(), uid);
                        env.topic = routed.name;
                        env.original = routed.original.clone();
                        let notice = LeaveNotice::requested(Arc::clone(self), env);
                        if let Err(err) = handle.try_leave(notice) {
                            self.reply_err(id, &routed.original, &err);
                        }
                    }
                    None => {
                        self.reply_err(id, &routed.original, &EngineError::NotAttached(routed.original.clone()))
                    }
                }
            }
            other @ (ClientPayload::Pub(_)
            | ClientPayload::Get(_)
            | ClientPayload::Set(_)
            | ClientPayload::Del(_)
            | ClientPayload::Note(_)) => {
                let topic = other.topic().unwrap_or_default().to_string();
                let is_note = matches!(other, ClientPayload::Note(_));
                let routed = match route_topic_name(&topic, uid) {
                    Ok(r) => r,
                    Err(err) => {
                        if !is_note {
                            self.reply_err(id, &topic, &err);
                        }
                        return;
                    }
                };
                let Some(handle) = self.subscription(&routed.name) else {
                    if !is_note {
                        self.reply_err(id, &routed.original, &EngineError::NotAttached(routed.original.clone()));
                    }
                    return;
                };
                let mut env = ClientEnvelope::new(other, self.id.clone(), uid);
                env.topic = routed.name.clone();
                env.original = routed.original.clone();
                let result = match &env.payload {
                    ClientPayload::Get(_) | ClientPayload::Set(_) | ClientPayload::Del(_) => {
                        handle.try_meta(env)
                    }
                    _ => handle.try_client(env),
                };
                if let Err(err) = result {
                    if is_note {
                        tracing::debug!(sid = %self.id, topic = %routed.original, error = %err, "note dropped");
                    } else {
                        self.reply_err(id, &routed.original, &err);
                    }
                }
            }
        }
    }

    fn reply_err(&self, id: Option<String>, topic: &str, err: &EngineError) {
        tracing::debug!(sid = %self.id, topic = %topic, error = %err, kind = err.kind(), "request rejected");
        self.queue_out(ServerEnvelope::ctrl_err(id, topic, err));
    }

    /// Build the compact description shipped with proxy→master requests.
    pub fn describe(&self, is_channel: bool) -> crate::router::RemoteSessionDesc {
        crate::router::RemoteSessionDesc {
            sid: self.id.clone(),
            uid: self.uid(),
            user_agent: self.user_agent(),
            background: self.is_background(),
            is_channel,
        }
    }
}

/// Collapse a try_send error to "was it a full queue".
fn describe<T>(err: mpsc::error::TrySendError<T>) -> bool {
    matches!(err, mpsc::error::TrySendError::Full(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::envelope::ServerPayload;

    #[test]
    fn queue_out_delivers() {
        let (sess, mut rx) = Session::new(SessionKind::Websocket, 4);
        assert!(sess.queue_out(ServerEnvelope::ctrl_ok(None, "grp1")));
        let env = rx.try_recv().unwrap();
        assert!(matches!(env.payload, ServerPayload::Ctrl(_)));
    }

    #[test]
    fn full_queue_marks_stalled_not_blocked() {
        let (sess, _rx) = Session::new(SessionKind::Websocket, 1);
        assert!(sess.queue_out(ServerEnvelope::ctrl_ok(None, "grp1")));
        assert!(!sess.queue_out(ServerEnvelope::ctrl_ok(None, "grp1")));
        assert!(sess.is_stalled());
    }

    #[test]
    fn terminating_session_refuses_sends() {
        let (sess, mut rx) = Session::new(SessionKind::Websocket, 4);
        sess.terminating.store(true, Ordering::SeqCst);
        assert!(!sess.queue_out(ServerEnvelope::ctrl_ok(None, "grp1")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn proxy_tags_envelopes_with_own_id() {
        let (mplex, mut rx) = Session::new_multiplex(NodeId::new("beta"), 4);
        let SessionLink::Multiplex(tx) = &mplex.link else { unreachable!() };
        let sid = SessionId::new();
        let proxy = Session::new_proxy(
            sid.clone(),
            UserId(3),
            "ua/1".into(),
            false,
            NodeId::new("beta"),
            mplex.id.clone(),
            tx.clone(),
        );
        assert_eq!(proxy.anchor(), Some(mplex.id.clone()));

        proxy.queue_out(ServerEnvelope::ctrl_ok(None, "grp1"));
        let (dest, _) = rx.try_recv().unwrap();
        assert_eq!(dest, sid);

        mplex.queue_out(ServerEnvelope::data("grp1", UserId(1), 1, None, "x".into()));
        let (dest, _) = rx.try_recv().unwrap();
        assert!(dest.is_wildcard());
    }

    #[test]
    fn multiplex_tracks_remote_uids() {
        let (mplex, _rx) = Session::new_multiplex(NodeId::new("beta"), 4);
        mplex.add_remote_uid(UserId(1));
        mplex.add_remote_uid(UserId(2));
        assert!(mplex.has_remote_uid(UserId(1)));
        mplex.remove_remote_uid(UserId(1));
        assert!(!mplex.has_remote_uid(UserId(1)));
        assert_eq!(mplex.remote_uids().len(), 1);
    }

    #[tokio::test]
    async fn inflight_gauge_blocks_until_idle() {
        let (sess, _rx) = Session::new(SessionKind::Websocket, 4);
        let guard = sess.track();

        let waiter = {
            let sess = Arc::clone(&sess);
            tokio::spawn(async move { sess.inflight.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn clean_up_is_idempotent() {
        let (sess, _rx) = Session::new(SessionKind::Websocket, 4);
        sess.clean_up().await;
        assert!(sess.is_terminating());
        // Second call must be a no-op, not a hang or panic.
        sess.clean_up().await;
    }

    #[test]
    fn subscribe_rejects_duplicates() {
        let (sess, _rx) = Session::new(SessionKind::Websocket, 4);
        let (handle, _boxes) = crate::topic::TopicHandle::channel("grp1", 4, false, None);
        assert!(sess.subscribe("grp1", handle.clone()));
        assert!(!sess.subscribe("grp1", handle));
        assert_eq!(sess.subscription_count(), 1);
        assert!(sess.unsubscribe("grp1").is_some());
        assert_eq!(sess.subscription_count(), 0);
    }
}

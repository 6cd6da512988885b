use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use palaver_core::envelope::{
    ClientNote, ClientPayload, ClientPub, DefaultAccess, Meta, MetaWhat, ModePair, NoteWhat,
    PresWhat, ServerPayload, SubEntry, TopicDesc,
};
use palaver_core::topic::p2p_users;
use palaver_core::{
    AccessMode, ClientEnvelope, EngineError, NodeId, ServerEnvelope, SessionId, TopicCategory,
    TopicStatus, UserId,
};
use palaver_store::{
    Auth, MessageRecord, Push, PushReceipt, PushRecipient, Store, SubUpdate, SubscriptionRecord,
    TopicRecord,
};

use crate::call::{self, CallDecision, CallInProgress, CallState};
use crate::hub::HubCmd;
use crate::router::{ProxyForward, ProxyReqKind, RemoteRouter};
use crate::session::{InflightGuard, Session, SessionKind};
use crate::EngineConfig;

/// A subscribe request headed for a topic's registration queue.
pub struct JoinRequest {
    pub sess: Arc<Session>,
    pub env: ClientEnvelope,
    _guard: InflightGuard,
}

impl JoinRequest {
    pub fn new(sess: Arc<Session>, env: ClientEnvelope) -> Self {
        let guard = sess.track();
        Self {
            sess,
            env,
            _guard: guard,
        }
    }
}

/// A detach/unsubscribe notice. `env` is `None` for the synthetic leave
/// pushed during session cleanup.
pub struct LeaveNotice {
    pub sess: Arc<Session>,
    pub env: Option<ClientEnvelope>,
    _guard: InflightGuard,
}

impl LeaveNotice {
    pub fn requested(sess: Arc<Session>, env: ClientEnvelope) -> Self {
        let guard = sess.track();
        Self {
            sess,
            env: Some(env),
            _guard: guard,
        }
    }

    pub fn synthetic(sess: Arc<Session>) -> Self {
        let guard = sess.track();
        Self {
            sess,
            env: None,
            _guard: guard,
        }
    }
}

/// Session state changes a topic cares about.
#[derive(Clone, Debug)]
pub enum SessionUpdate {
    UserAgent { sid: SessionId, user_agent: String },
    /// Background session moved to the foreground; start counting it.
    Foreground { sid: SessionId },
}

/// Master/proxy control notices and internal lifecycle messages.
pub enum TopicCtrl {
    /// Asynchronous configuration finished (master topics only).
    Configured(Result<LoadedState, EngineError>),
    /// A peer node's proxy topic went away; drop its attachments.
    ProxyDetached { node: NodeId },
    /// Evict one session, e.g. after its outbound queue overflowed.
    Evict { sid: SessionId },
}

/// State fetched from storage while the topic was paused.
pub struct LoadedState {
    pub rec: Option<TopicRecord>,
    pub subs: Vec<SubscriptionRecord>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    /// Ownership moved on or off this node.
    Rehash,
    Deleted,
    /// The owning node restarted or vanished (proxy topics).
    MasterLost,
}

pub struct ExitRequest {
    pub reason: ExitReason,
    pub done: Option<oneshot::Sender<()>>,
}

/// Cheap cloneable handle to a running topic actor. All sends are
/// non-blocking: a full mailbox is an error surfaced to the caller, never
/// a stall.
#[derive(Clone)]
pub struct TopicHandle {
    pub name: String,
    pub is_proxy: bool,
    pub master: Option<NodeId>,
    dead: Arc<AtomicBool>,
    client_tx: mpsc::Sender<ClientEnvelope>,
    server_tx: mpsc::Sender<ServerEnvelope>,
    meta_tx: mpsc::Sender<ClientEnvelope>,
    reg_tx: mpsc::Sender<JoinRequest>,
    unreg_tx: mpsc::Sender<LeaveNotice>,
    upd_tx: mpsc::Sender<SessionUpdate>,
    ctrl_tx: mpsc::Sender<TopicCtrl>,
    exit_tx: mpsc::Sender<ExitRequest>,
}

/// Receiver halves of a topic's mailboxes; owned by the actor.
pub struct TopicMailboxes {
    pub client_rx: mpsc::Receiver<ClientEnvelope>,
    pub server_rx: mpsc::Receiver<ServerEnvelope>,
    pub meta_rx: mpsc::Receiver<ClientEnvelope>,
    pub reg_rx: mpsc::Receiver<JoinRequest>,
    pub unreg_rx: mpsc::Receiver<LeaveNotice>,
    pub upd_rx: mpsc::Receiver<SessionUpdate>,
    pub ctrl_rx: mpsc::Receiver<TopicCtrl>,
    pub exit_rx: mpsc::Receiver<ExitRequest>,
}

impl TopicHandle {
    pub fn channel(
        name: &str,
        cap: usize,
        is_proxy: bool,
        master: Option<NodeId>,
    ) -> (TopicHandle, TopicMailboxes) {
        let (client_tx, client_rx) = mpsc::channel(cap);
        let (server_tx, server_rx) = mpsc::channel(cap);
        let (meta_tx, meta_rx) = mpsc::channel(cap);
        let (reg_tx, reg_rx) = mpsc::channel(cap);
        let (unreg_tx, unreg_rx) = mpsc::channel(cap);
        let (upd_tx, upd_rx) = mpsc::channel(cap);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(cap);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        (
            TopicHandle {
                name: name.to_string(),
                is_proxy,
                master,
                dead: Arc::new(AtomicBool::new(false)),
                client_tx,
                server_tx,
                meta_tx,
                reg_tx,
                unreg_tx,
                upd_tx,
                ctrl_tx,
                exit_tx,
            },
            TopicMailboxes {
                client_rx,
                server_rx,
                meta_rx,
                reg_rx,
                unreg_rx,
                upd_rx,
                ctrl_rx,
                exit_rx,
            },
        )
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn try_join(&self, req: JoinRequest) -> Result<(), EngineError> {
        self.try_send(&self.reg_tx, req, "registration")
    }

    pub fn try_leave(&self, notice: LeaveNotice) -> Result<(), EngineError> {
        self.try_send(&self.unreg_tx, notice, "unregistration")
    }

    pub fn try_client(&self, env: ClientEnvelope) -> Result<(), EngineError> {
        self.try_send(&self.client_tx, env, "client")
    }

    pub fn try_server(&self, env: ServerEnvelope) -> Result<(), EngineError> {
        self.try_send(&self.server_tx, env, "server")
    }

    pub fn try_meta(&self, env: ClientEnvelope) -> Result<(), EngineError> {
        self.try_send(&self.meta_tx, env, "meta")
    }

    pub fn try_update(&self, upd: SessionUpdate) -> Result<(), EngineError> {
        self.try_send(&self.upd_tx, upd, "session-update")
    }

    pub fn try_ctrl(&self, ctrl: TopicCtrl) -> Result<(), EngineError> {
        self.try_send(&self.ctrl_tx, ctrl, "control")
    }

    /// Request actor shutdown; the returned receiver resolves when the
    /// actor has drained and exited.
    pub async fn exit(&self, reason: ExitReason) -> Result<oneshot::Receiver<()>, EngineError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.exit_tx
            .send(ExitRequest {
                reason,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| EngineError::TopicNotFound(self.name.clone()))?;
        Ok(done_rx)
    }

    fn try_send<T>(
        &self,
        tx: &mpsc::Sender<T>,
        msg: T,
        queue: &'static str,
    ) -> Result<(), EngineError> {
        if self.is_dead() {
            return Err(EngineError::TopicNotFound(self.name.clone()));
        }
        tx.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull(queue),
            mpsc::error::TrySendError::Closed(_) => EngineError::TopicNotFound(self.name.clone()),
        })
    }
}

/// Collaborators injected into every topic actor.
#[derive(Clone)]
pub struct TopicDeps {
    pub store: Arc<dyn Store>,
    pub auth: Arc<dyn Auth>,
    pub push: Arc<dyn Push>,
    pub router: Arc<dyn RemoteRouter>,
    pub hub_tx: mpsc::Sender<HubCmd>,
}

struct PerUserData {
    want: AccessMode,
    given: AccessMode,
    online: u32,
    recv_seq: u32,
    read_seq: u32,
    private: Option<Value>,
}

impl PerUserData {
    fn effective(&self) -> AccessMode {
        self.want & self.given
    }
}

struct Attachment {
    sess: Arc<Session>,
    uid: UserId,
    is_channel: bool,
    /// Background sessions are attached but not counted as online until
    /// they report foreground.
    counted: bool,
}

/// One communication channel, run as a single-writer actor. The actor is
/// the only mutator of its state and processes each message to completion
/// before the next, which is what makes per-topic ordering total.
pub struct Topic {
    name: String,
    category: TopicCategory,
    status: TopicStatus,
    owner: UserId,
    seq: u32,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    public: Option<Value>,
    default_access: DefaultAccess,
    /// True until a storage record exists; created on first join.
    unsaved: bool,
    per_user: HashMap<UserId, PerUserData>,
    sessions: HashMap<SessionId, Attachment>,
    /// Most recent user agent seen across the user's sessions ("me" only).
    user_agent: String,
    call: Option<CallInProgress>,
    call_deadline: Option<Instant>,
    idle_deadline: Instant,
    pending_joins: Vec<JoinRequest>,
    handle: TopicHandle,
    deps: TopicDeps,
    cfg: EngineConfig,
}

impl Topic {
    /// Spawn a topic actor and return its handle. The topic starts paused;
    /// a master topic configures itself from storage asynchronously, a
    /// proxy topic is ready immediately.
    pub fn spawn(
        name: &str,
        category: TopicCategory,
        master: Option<NodeId>,
        deps: TopicDeps,
        cfg: EngineConfig,
    ) -> TopicHandle {
        let is_proxy = master.is_some();
        let (handle, boxes) = TopicHandle::channel(name, cfg.topic_queue, is_proxy, master);

        let now = Utc::now();
        let topic = Topic {
            name: name.to_string(),
            category,
            status: TopicStatus::new_paused(),
            owner: UserId::NONE,
            seq: 0,
            created: now,
            updated: now,
            public: None,
            default_access: DefaultAccess::default(),
            unsaved: true,
            per_user: HashMap::new(),
            sessions: HashMap::new(),
            user_agent: String::new(),
            call: None,
            call_deadline: None,
            idle_deadline: Instant::now() + cfg.idle_kill,
            pending_joins: Vec::new(),
            handle: handle.clone(),
            deps,
            cfg,
        };

        if !is_proxy {
            let store = Arc::clone(&topic.deps.store);
            let ctrl = handle.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                let result = load_state(store.as_ref(), &name).await;
                let _ = ctrl.try_ctrl(TopicCtrl::Configured(result));
            });
        }

        tokio::spawn(topic.run(boxes));
        handle
    }

    async fn run(mut self, mut rx: TopicMailboxes) {
        if self.handle.is_proxy {
            self.status.mark_loaded();
        }
        tracing::debug!(topic = %self.name, proxy = self.handle.is_proxy, "topic actor started");

        loop {
            let call_at = self.call_deadline.unwrap_or_else(far_future);
            let idle_at = self.idle_deadline;
            let idle_armed = self.sessions.is_empty() && self.pending_joins.is_empty();

            let keep_going = tokio::select! {
                Some(req) = rx.exit_rx.recv() => {
                    self.handle_exit(req);
                    false
                }
                Some(ctrl) = rx.ctrl_rx.recv() => self.handle_ctrl(ctrl).await,
                Some(join) = rx.reg_rx.recv() => {
                    self.handle_join(join).await;
                    true
                }
                Some(notice) = rx.unreg_rx.recv() => {
                    self.handle_leave(notice).await;
                    true
                }
                Some(env) = rx.client_rx.recv() => {
                    self.handle_client(env).await;
                    true
                }
                Some(env) = rx.meta_rx.recv() => {
                    self.handle_meta(env).await;
                    true
                }
                Some(env) = rx.server_rx.recv() => {
                    self.broadcast(env);
                    true
                }
                Some(upd) = rx.upd_rx.recv() => {
                    self.handle_session_update(upd);
                    true
                }
                _ = tokio::time::sleep_until(call_at), if self.call_deadline.is_some() => {
                    self.handle_call_timeout();
                    true
                }
                _ = tokio::time::sleep_until(idle_at), if idle_armed => {
                    tracing::debug!(topic = %self.name, "idle timeout, unregistering");
                    let _ = self
                        .deps
                        .hub_tx
                        .send(HubCmd::Unregister {
                            name: self.name.clone(),
                        })
                        .await;
                    false
                }
                else => false,
            };

            if !keep_going {
                break;
            }
        }

        self.handle.mark_dead();
        tracing::debug!(topic = %self.name, "topic actor stopped");
    }

    // --- configuration ---

    async fn handle_ctrl(&mut self, ctrl: TopicCtrl) -> bool {
        match ctrl {
            TopicCtrl::Configured(Ok(state)) => {
                if let Some(rec) = state.rec {
                    self.owner = rec.owner;
                    self.seq = rec.seq;
                    self.created = rec.created;
                    self.updated = rec.updated;
                    self.public = rec.public;
                    self.default_access = rec.default_access;
                    self.unsaved = false;
                }
                for sub in state.subs {
                    self.per_user.insert(
                        sub.user,
                        PerUserData {
                            want: sub.want,
                            given: sub.given,
                            online: 0,
                            recv_seq: sub.recv_seq,
                            read_seq: sub.read_seq,
                            private: sub.private,
                        },
                    );
                }
                self.status.mark_loaded();
                for join in std::mem::take(&mut self.pending_joins) {
                    self.handle_join(join).await;
                }
                true
            }
            TopicCtrl::Configured(Err(err)) => {
                tracing::warn!(topic = %self.name, error = %err, "topic configuration failed");
                for join in std::mem::take(&mut self.pending_joins) {
                    let reply = ServerEnvelope::ctrl_err(
                        join.env.id().map(String::from),
                        &join.env.original,
                        &err,
                    );
                    join.sess.queue_out(reply);
                }
                let _ = self
                    .deps
                    .hub_tx
                    .send(HubCmd::Unregister {
                        name: self.name.clone(),
                    })
                    .await;
                false
            }
            TopicCtrl::ProxyDetached { node } => {
                let gone: Vec<SessionId> = self
                    .sessions
                    .iter()
                    .filter(|(_, att)| att.sess.node.as_ref() == Some(&node))
                    .map(|(sid, _)| sid.clone())
                    .collect();
                for sid in gone {
                    self.detach(&sid, false).await;
                }
                true
            }
            TopicCtrl::Evict { sid } => {
                if let Some(att) = self.sessions.get(&sid) {
                    let sess = Arc::clone(&att.sess);
                    tokio::spawn(async move { sess.clean_up().await });
                }
                true
            }
        }
    }

    // --- attach ---

    async fn handle_join(&mut self, join: JoinRequest) {
        if !self.status.is_loaded() && !self.handle.is_proxy {
            self.pending_joins.push(join);
            return;
        }
        let id = join.env.id().map(String::from);
        let original = join.env.original.clone();

        if self.status.is_deleted() {
            join.sess.queue_out(ServerEnvelope::ctrl_err(
                id,
                &original,
                &EngineError::TopicNotFound(original.clone()),
            ));
            return;
        }

        if self.handle.is_proxy {
            self.proxy_join(join);
            return;
        }

        match self.attach(&join).await {
            Ok(mode) => {
                let params = json!({ "topic": original, "mode": mode });
                join.sess
                    .queue_out(ServerEnvelope::ctrl_accepted(id, &original, params));
                self.after_join_queries(&join);
            }
            Err(err) => {
                join.sess
                    .queue_out(ServerEnvelope::ctrl_err(id, &original, &err));
            }
        }
    }

    /// Validate access and insert the subscriber. Returns the granted
    /// mode pair.
    async fn attach(&mut self, join: &JoinRequest) -> Result<ModePair, EngineError> {
        let uid = join.env.from;
        if uid.is_none() {
            return Err(EngineError::AuthRequired);
        }
        if self.sessions.contains_key(&join.sess.id) {
            return Err(EngineError::AlreadyAttached(join.env.original.clone()));
        }
        let is_channel = join.env.original.starts_with("chn");

        // Personal topics admit only their own user; p2p only its pair.
        match self.category {
            TopicCategory::Me | TopicCategory::Fnd => {
                let prefix = if self.category == TopicCategory::Me {
                    "me"
                } else {
                    "fnd"
                };
                if self.name != format!("{prefix}{}", uid.0) {
                    return Err(EngineError::PermissionDenied);
                }
            }
            TopicCategory::P2P => {
                let Some((a, b)) = p2p_users(&self.name) else {
                    return Err(EngineError::Malformed(format!("bad p2p name {}", self.name)));
                };
                if uid != a && uid != b {
                    return Err(EngineError::PermissionDenied);
                }
            }
            TopicCategory::Group | TopicCategory::System => {}
        }

        // Lazily create the storage record on first join.
        if self.unsaved {
            let mut rec = TopicRecord::new(self.name.clone(), uid);
            match self.category {
                TopicCategory::System => rec.owner = UserId::NONE,
                TopicCategory::P2P => {
                    rec.default_access = DefaultAccess {
                        auth: AccessMode::P2P,
                        anon: AccessMode::NONE,
                    };
                }
                _ => {}
            }
            self.deps
                .store
                .topic_create(rec.clone())
                .await
                .map_err(EngineError::from)?;
            self.owner = rec.owner;
            self.created = rec.created;
            self.updated = rec.updated;
            self.default_access = rec.default_access;
            self.unsaved = false;
        }

        let requested_want = match &join.env.payload {
            ClientPayload::Sub(sub) => sub.mode,
            _ => None,
        };

        let mode = match self.per_user.get(&uid).map(|p| (p.want, p.given)) {
            Some((cur_want, given)) => {
                let want = requested_want.unwrap_or(cur_want);
                if want != cur_want {
                    self.deps
                        .store
                        .sub_update(
                            &self.name,
                            uid,
                            SubUpdate {
                                want: Some(want),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(EngineError::from)?;
                    if let Some(p) = self.per_user.get_mut(&uid) {
                        p.want = want;
                    }
                }
                ModePair { want, given }
            }
            None => {
                let default = self.deps.auth.default_access(uid, self.category).await;
                let given = if uid == self.owner {
                    AccessMode::FULL
                } else if is_channel {
                    AccessMode::CHANNEL
                } else {
                    default & self.default_access.auth
                };
                if !given.can_join() {
                    return Err(EngineError::PermissionDenied);
                }
                let want = requested_want.unwrap_or(given);
                let sub = SubscriptionRecord::new(self.name.clone(), uid, want, given);
                self.deps
                    .store
                    .sub_create(sub)
                    .await
                    .map_err(EngineError::from)?;
                self.per_user.insert(
                    uid,
                    PerUserData {
                        want,
                        given,
                        online: 0,
                        recv_seq: 0,
                        read_seq: 0,
                        private: None,
                    },
                );
                ModePair { want, given }
            }
        };

        if !mode.effective().can_join() {
            return Err(EngineError::PermissionDenied);
        }

        let background = join.sess.is_background()
            || matches!(&join.env.payload, ClientPayload::Sub(s) if s.background);
        let counted = !background;
        let first_online = match self.per_user.get_mut(&uid) {
            Some(pud) => {
                if counted {
                    pud.online += 1;
                }
                counted && pud.online == 1
            }
            None => false,
        };

        let sid = join.sess.id.clone();
        join.sess.subscribe(&self.name, self.handle.clone());
        self.sessions.insert(
            sid.clone(),
            Attachment {
                sess: Arc::clone(&join.sess),
                uid,
                is_channel,
                counted,
            },
        );

        if first_online {
            let env = ServerEnvelope::pres(self.name.clone(), PresWhat::On, uid).skip_session(sid);
            self.broadcast(env);
        }
        Ok(mode)
    }

    /// Answer the optional get-desc/get-sub piggybacked on a subscribe.
    fn after_join_queries(&self, join: &JoinRequest) {
        let ClientPayload::Sub(sub) = &join.env.payload else {
            return;
        };
        if sub.get_desc {
            let meta = self.describe(join.env.from, None);
            join.sess.queue_out(ServerEnvelope::new(
                ServerPayload::Meta(meta),
                &join.env.original,
            ));
        }
        if sub.get_sub {
            let meta = self.subscriber_list(None);
            join.sess.queue_out(ServerEnvelope::new(
                ServerPayload::Meta(meta),
                &join.env.original,
            ));
        }
    }

    fn proxy_join(&mut self, join: JoinRequest) {
        let is_channel = join.env.original.starts_with("chn");
        let fwd = ProxyForward {
            req: ProxyReqKind::Join,
            topic: self.name.clone(),
            env: Some(join.env.clone()),
            sess: join.sess.describe(is_channel),
        };
        if let Err(err) = self.deps.router.forward(fwd) {
            join.sess.queue_out(ServerEnvelope::ctrl_err(
                join.env.id().map(String::from),
                &join.env.original,
                &err,
            ));
            return;
        }
        // The join ack comes back from the master through the cluster.
        join.sess.subscribe(&self.name, self.handle.clone());
        self.sessions.insert(
            join.sess.id.clone(),
            Attachment {
                sess: Arc::clone(&join.sess),
                uid: join.env.from,
                is_channel,
                counted: false,
            },
        );
    }

    // --- detach ---

    async fn handle_leave(&mut self, notice: LeaveNotice) {
        let sid = notice.sess.id.clone();
        let (id, original, unsub) = match &notice.env {
            Some(env) => {
                let unsub = matches!(&env.payload, ClientPayload::Leave(l) if l.unsub);
                (env.id().map(String::from), env.original.clone(), unsub)
            }
            None => (None, self.name.clone(), false),
        };

        if self.handle.is_proxy {
            if let Some(att) = self.sessions.get(&sid) {
                let fwd = ProxyForward {
                    req: ProxyReqKind::Leave,
                    topic: self.name.clone(),
                    env: notice.env.clone(),
                    sess: att.sess.describe(att.is_channel),
                };
                let _ = self.deps.router.forward(fwd);
            }
            notice.sess.unsubscribe(&self.name);
            self.sessions.remove(&sid);
            if self.sessions.is_empty() {
                self.idle_deadline = Instant::now() + self.cfg.idle_kill;
            }
            return;
        }

        let Some(uid) = self.sessions.get(&sid).map(|a| a.uid) else {
            if notice.env.is_some() {
                notice.sess.queue_out(ServerEnvelope::ctrl_err(
                    id,
                    &original,
                    &EngineError::NotAttached(original.clone()),
                ));
            }
            return;
        };

        if unsub {
            match self.remove_subscription(uid).await {
                Ok(()) => {
                    notice
                        .sess
                        .queue_out(ServerEnvelope::ctrl_ok(id, &original));
                }
                Err(err) => {
                    notice
                        .sess
                        .queue_out(ServerEnvelope::ctrl_err(id, &original, &err));
                }
            }
        } else {
            self.detach(&sid, false).await;
            if notice.env.is_some() {
                notice
                    .sess
                    .queue_out(ServerEnvelope::ctrl_ok(id, &original));
            }
        }
    }

    /// Remove one session; emit "off" presence when it was the user's last.
    async fn detach(&mut self, sid: &SessionId, silent: bool) {
        let Some(att) = self.sessions.remove(sid) else {
            return;
        };
        att.sess.unsubscribe(&self.name);

        let last_online = match self.per_user.get_mut(&att.uid) {
            Some(pud) if att.counted && pud.online > 0 => {
                pud.online -= 1;
                pud.online == 0
            }
            _ => false,
        };
        if last_online {
            let _ = self
                .deps
                .store
                .user_update_last_seen(att.uid, Utc::now(), &att.sess.user_agent())
                .await;
            if !silent {
                let env = ServerEnvelope::pres(self.name.clone(), PresWhat::Off, att.uid);
                self.broadcast(env);
            }
        }
        if self.sessions.is_empty() {
            self.idle_deadline = Instant::now() + self.cfg.idle_kill;
        }
    }

    /// Full unsubscribe: delete the stored subscription, detach all of the
    /// user's sessions, announce "gone". A p2p topic below two members is
    /// torn down outright.
    async fn remove_subscription(&mut self, uid: UserId) -> Result<(), EngineError> {
        if !self.per_user.contains_key(&uid) {
            return Err(EngineError::NotAttached(self.name.clone()));
        }
        self.deps
            .store
            .sub_delete(&self.name, uid)
            .await
            .map_err(EngineError::from)?;

        let user_sids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, a)| a.uid == uid)
            .map(|(s, _)| s.clone())
            .collect();
        for s in user_sids {
            self.detach(&s, true).await;
        }
        self.per_user.remove(&uid);

        let env = ServerEnvelope::pres(self.name.clone(), PresWhat::Gone, uid);
        self.broadcast(env);

        if self.category == TopicCategory::P2P && self.per_user.len() < 2 {
            let _ = self
                .deps
                .hub_tx
                .send(HubCmd::Delete {
                    name: self.name.clone(),
                    hard: false,
                })
                .await;
        }
        Ok(())
    }

    // --- client traffic ---

    async fn handle_client(&mut self, env: ClientEnvelope) {
        if self.handle.is_proxy {
            let Some(att) = self.sessions.get(&env.sid) else {
                return;
            };
            let req = match &env.payload {
                ClientPayload::Note(n) if n.what == NoteWhat::Call => ProxyReqKind::Call,
                _ => ProxyReqKind::Broadcast,
            };
            let fwd = ProxyForward {
                req,
                topic: self.name.clone(),
                env: Some(env.clone()),
                sess: att.sess.describe(att.is_channel),
            };
            if let Err(err) = self.deps.router.forward(fwd) {
                att.sess.queue_out(ServerEnvelope::ctrl_err(
                    env.id().map(String::from),
                    &env.original,
                    &err,
                ));
            }
            return;
        }

        match env.payload.clone() {
            ClientPayload::Pub(p) => self.publish(&env, p).await,
            ClientPayload::Note(n) => self.handle_note(&env, n).await,
            other => {
                tracing::debug!(topic = %self.name, kind = other.kind(), "unexpected payload on client queue");
            }
        }
    }

    /// Persist and fan out one message. The sequence counter advances only
    /// after a successful save, so a storage failure leaves no gap.
    async fn publish(&mut self, env: &ClientEnvelope, p: ClientPub) {
        let id = env.id().map(String::from);
        if !self.status.is_ready() || self.status.is_read_only() {
            self.reply_to(
                env,
                ServerEnvelope::ctrl_err(
                    id,
                    &env.original,
                    &EngineError::Locked(env.original.clone()),
                ),
            );
            return;
        }
        let uid = env.from;
        // The system channel waives the writer check.
        if self.category != TopicCategory::System {
            let writable = self
                .per_user
                .get(&uid)
                .map(|pud| pud.effective().can_write())
                .unwrap_or(false);
            if !writable {
                self.reply_to(
                    env,
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied),
                );
                return;
            }
        }

        let seq = self.seq + 1;
        let rec = MessageRecord {
            topic: self.name.clone(),
            seq,
            from: uid,
            head: p.head.clone(),
            content: p.content.clone(),
            ts: env.received,
        };
        let ts = match self.deps.store.message_save(rec).await {
            Ok(ts) => ts,
            Err(err) => {
                tracing::warn!(topic = %self.name, error = %err, "message save failed");
                self.reply_to(
                    env,
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::from(err)),
                );
                return;
            }
        };
        self.seq = seq;
        self.updated = ts;

        self.reply_to(
            env,
            ServerEnvelope::ctrl_accepted(id, &env.original, json!({ "seq": seq })),
        );

        let mut data = ServerEnvelope::data(self.name.clone(), uid, seq, p.head, p.content.clone());
        if p.no_echo {
            data = data.skip_session(env.sid.clone());
        }
        self.broadcast(data);

        let recipients: Vec<PushRecipient> = self
            .per_user
            .iter()
            .filter(|(u, pud)| **u != uid && pud.effective().can_read())
            .map(|(u, pud)| PushRecipient {
                user: *u,
                offline: pud.online == 0 || pud.effective().is_muted(),
            })
            .collect();
        if !recipients.is_empty() {
            self.deps.push.push(PushReceipt {
                topic: self.name.clone(),
                from: uid,
                seq,
                content: p.content,
                recipients,
            });
        }
    }

    async fn handle_note(&mut self, env: &ClientEnvelope, note: ClientNote) {
        if !self.status.is_ready() {
            return;
        }
        let uid = env.from;
        if !self.per_user.contains_key(&uid) {
            return;
        }

        match note.what {
            NoteWhat::Recv | NoteWhat::Read => {
                let Some(seq) = note.seq else { return };
                let upd = {
                    let Some(pud) = self.per_user.get_mut(&uid) else { return };
                    if note.what == NoteWhat::Read {
                        // Watermarks only move forward.
                        if seq <= pud.read_seq {
                            return;
                        }
                        pud.read_seq = seq;
                        SubUpdate {
                            read_seq: Some(seq),
                            ..Default::default()
                        }
                    } else {
                        if seq <= pud.recv_seq {
                            return;
                        }
                        pud.recv_seq = seq;
                        SubUpdate {
                            recv_seq: Some(seq),
                            ..Default::default()
                        }
                    }
                };
                let _ = self.deps.store.sub_update(&self.name, uid, upd).await;
                let fwd = ServerEnvelope::info(self.name.clone(), &note, uid)
                    .skip_session(env.sid.clone());
                self.broadcast(fwd);
            }
            NoteWhat::Kp => {
                let fwd = ServerEnvelope::info(self.name.clone(), &note, uid)
                    .skip_session(env.sid.clone());
                self.broadcast(fwd);
            }
            NoteWhat::Call => self.handle_call_note(env, note),
        }
    }

    // --- call signaling (p2p only) ---

    fn handle_call_note(&mut self, env: &ClientEnvelope, note: ClientNote) {
        if self.category != TopicCategory::P2P {
            return;
        }
        let Some(participants) = p2p_users(&self.name) else {
            return;
        };
        let Some(event) = note.event else { return };

        match call::decide(self.call.as_ref(), event, env.from, participants) {
            CallDecision::Start { callee } => {
                self.call = Some(CallInProgress::new(env.from, env.sid.clone(), callee));
                self.call_deadline = Some(Instant::now() + self.cfg.call_timeout);
                let info =
                    ServerEnvelope::info(self.name.clone(), &note, env.from).only_user(callee);
                self.broadcast(info);
            }
            CallDecision::Relay { to } => {
                let info = ServerEnvelope::info(self.name.clone(), &note, env.from).only_user(to);
                self.broadcast(info);
            }
            CallDecision::Accept { to } => {
                if let Some(c) = self.call.as_mut() {
                    c.state = CallState::Accepted;
                }
                self.call_deadline = None;
                let info = ServerEnvelope::info(self.name.clone(), &note, env.from).only_user(to);
                self.broadcast(info);
            }
            CallDecision::Terminate { notify } => {
                self.call = None;
                self.call_deadline = None;
                let info =
                    ServerEnvelope::info(self.name.clone(), &note, env.from).only_user(notify);
                self.broadcast(info);
            }
            CallDecision::Reject(err) => {
                tracing::debug!(topic = %self.name, user = %env.from, error = %err, "call event rejected");
            }
        }
    }

    /// Ringing past the establishment window: force-terminate as missed.
    fn handle_call_timeout(&mut self) {
        self.call_deadline = None;
        let Some(c) = self.call.take() else { return };
        if c.state != CallState::Ringing {
            return;
        }
        tracing::debug!(topic = %self.name, "call establishment timed out");
        let note = ClientNote {
            topic: self.name.clone(),
            what: NoteWhat::Call,
            seq: None,
            event: Some(palaver_core::envelope::CallEvent::HangUp),
            payload: Some(json!({ "reason": "missed" })),
        };
        let env = ServerEnvelope::info(self.name.clone(), &note, c.initiator);
        self.broadcast(env);
    }

    // --- metadata ---

    async fn handle_meta(&mut self, env: ClientEnvelope) {
        if self.handle.is_proxy {
            let Some(att) = self.sessions.get(&env.sid) else {
                return;
            };
            let fwd = ProxyForward {
                req: ProxyReqKind::Meta,
                topic: self.name.clone(),
                env: Some(env.clone()),
                sess: att.sess.describe(att.is_channel),
            };
            if let Err(err) = self.deps.router.forward(fwd) {
                att.sess.queue_out(ServerEnvelope::ctrl_err(
                    env.id().map(String::from),
                    &env.original,
                    &err,
                ));
            }
            return;
        }

        let id = env.id().map(String::from);
        if !self.status.is_loaded() || self.status.is_deleted() {
            self.reply_to(
                &env,
                ServerEnvelope::ctrl_err(
                    id,
                    &env.original,
                    &EngineError::Locked(env.original.clone()),
                ),
            );
            return;
        }

        match env.payload.clone() {
            ClientPayload::Get(get) => {
                let meta = match get.what {
                    MetaWhat::Desc => self.describe(env.from, id),
                    MetaWhat::Sub => self.subscriber_list(id),
                };
                self.reply_to(
                    &env,
                    ServerEnvelope::new(ServerPayload::Meta(meta), &env.original),
                );
            }
            ClientPayload::Set(set) => self.handle_set(&env, set).await,
            ClientPayload::Del(del) => self.handle_del(&env, del).await,
            other => {
                tracing::debug!(topic = %self.name, kind = other.kind(), "unexpected payload on meta queue");
            }
        }
    }

    fn describe(&self, uid: UserId, id: Option<String>) -> Meta {
        let access = self.per_user.get(&uid).map(|pud| ModePair {
            want: pud.want,
            given: pud.given,
        });
        let private = self.per_user.get(&uid).and_then(|pud| pud.private.clone());
        Meta {
            id,
            desc: Some(TopicDesc {
                created: Some(self.created),
                updated: Some(self.updated),
                seq: self.seq,
                default_access: Some(self.default_access),
                access,
                public: self.public.clone(),
                private,
            }),
            sub: None,
        }
    }

    fn subscriber_list(&self, id: Option<String>) -> Meta {
        let sub = self
            .per_user
            .iter()
            .map(|(uid, pud)| SubEntry {
                user: *uid,
                mode: ModePair {
                    want: pud.want,
                    given: pud.given,
                },
                online: pud.online > 0,
                read_seq: pud.read_seq,
                recv_seq: pud.recv_seq,
                private: None,
            })
            .collect();
        Meta {
            id,
            desc: None,
            sub: Some(sub),
        }
    }

    async fn handle_set(&mut self, env: &ClientEnvelope, set: palaver_core::envelope::ClientSet) {
        let id = env.id().map(String::from);
        let uid = env.from;
        let Some(caller_eff) = self.per_user.get(&uid).map(|p| p.effective()) else {
            self.reply_to(
                env,
                ServerEnvelope::ctrl_err(
                    id,
                    &env.original,
                    &EngineError::NotAttached(env.original.clone()),
                ),
            );
            return;
        };

        if let Some(desc) = set.desc {
            if uid != self.owner && !caller_eff.is_owner() {
                self.reply_to(
                    env,
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied),
                );
                return;
            }
            match self
                .deps
                .store
                .topic_update_desc(&self.name, desc.public.clone(), desc.default_access)
                .await
            {
                Ok(ts) => {
                    if let Some(public) = desc.public {
                        self.public = Some(public);
                    }
                    if let Some(da) = desc.default_access {
                        self.default_access = da;
                    }
                    self.updated = ts;
                    self.reply_to(env, ServerEnvelope::ctrl_ok(id, &env.original));
                }
                Err(err) => {
                    self.reply_to(
                        env,
                        ServerEnvelope::ctrl_err(id, &env.original, &EngineError::from(err)),
                    );
                }
            }
            return;
        }

        if let Some(sub) = set.sub {
            let target = sub.user.unwrap_or(uid);
            let updating_self = target == uid;
            if !updating_self && !caller_eff.has(AccessMode::APPROVE) {
                self.reply_to(
                    env,
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied),
                );
                return;
            }
            if !self.per_user.contains_key(&target) {
                self.reply_to(
                    env,
                    ServerEnvelope::ctrl_err(
                        id,
                        &env.original,
                        &EngineError::NotAttached(target.to_string()),
                    ),
                );
                return;
            }
            let upd = if updating_self {
                SubUpdate {
                    want: Some(sub.mode),
                    ..Default::default()
                }
            } else {
                SubUpdate {
                    given: Some(sub.mode),
                    ..Default::default()
                }
            };
            match self.deps.store.sub_update(&self.name, target, upd).await {
                Ok(_) => {
                    let effective = match self.per_user.get_mut(&target) {
                        Some(pud) => {
                            if updating_self {
                                pud.want = sub.mode;
                            } else {
                                pud.given = sub.mode;
                            }
                            pud.effective()
                        }
                        None => AccessMode::NONE,
                    };
                    self.reply_to(env, ServerEnvelope::ctrl_ok(id, &env.original));
                    let mut pres = ServerEnvelope::pres(self.name.clone(), PresWhat::Acs, target);
                    if let ServerPayload::Pres(p) = &mut pres.payload {
                        p.mode = Some(effective);
                    }
                    self.broadcast(pres);
                }
                Err(err) => {
                    self.reply_to(
                        env,
                        ServerEnvelope::ctrl_err(id, &env.original, &EngineError::from(err)),
                    );
                }
            }
            return;
        }

        self.reply_to(
            env,
            ServerEnvelope::ctrl_err(
                id,
                &env.original,
                &EngineError::Malformed("empty set".into()),
            ),
        );
    }

    async fn handle_del(&mut self, env: &ClientEnvelope, del: palaver_core::envelope::ClientDel) {
        use palaver_core::envelope::DelWhat;
        let id = env.id().map(String::from);
        let uid = env.from;
        let caller_eff = self
            .per_user
            .get(&uid)
            .map(|p| p.effective())
            .unwrap_or(AccessMode::NONE);
        // The replier may be detached below; hold it directly.
        let replier = self.sessions.get(&env.sid).map(|a| Arc::clone(&a.sess));

        let reply = match del.what {
            DelWhat::Topic => {
                if uid != self.owner {
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied)
                } else {
                    let _ = self
                        .deps
                        .hub_tx
                        .send(HubCmd::Delete {
                            name: self.name.clone(),
                            hard: del.hard,
                        })
                        .await;
                    ServerEnvelope::ctrl_ok(id, &env.original)
                }
            }
            DelWhat::Msg => {
                if !caller_eff.has(AccessMode::DELETE) {
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied)
                } else {
                    match self
                        .deps
                        .store
                        .messages_delete_list(&self.name, &del.seq_list)
                        .await
                    {
                        Ok(()) => ServerEnvelope::ctrl_ok(id, &env.original),
                        Err(err) => {
                            ServerEnvelope::ctrl_err(id, &env.original, &EngineError::from(err))
                        }
                    }
                }
            }
            DelWhat::Sub => {
                let target = del.user.unwrap_or(uid);
                if target != uid && !caller_eff.has(AccessMode::APPROVE) {
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied)
                } else if target == self.owner {
                    // The owner leaves by deleting the topic, not the sub.
                    ServerEnvelope::ctrl_err(id, &env.original, &EngineError::PermissionDenied)
                } else {
                    match self.remove_subscription(target).await {
                        Ok(()) => ServerEnvelope::ctrl_ok(id, &env.original),
                        Err(err) => ServerEnvelope::ctrl_err(id, &env.original, &err),
                    }
                }
            }
        };
        if let Some(sess) = replier {
            sess.queue_out(reply);
        }
    }

    // --- broadcast ---

    /// Fan out one envelope to every qualifying attached session.
    ///
    /// Local sessions get a permission-checked copy; a full outbound queue
    /// drops the copy and schedules the session's eviction. Proxy sessions
    /// anchored to the same multiplex link collapse into a single wildcard
    /// delivery when the whole link qualifies, otherwise each qualifying
    /// remote session gets its own addressed copy.
    fn broadcast(&self, env: ServerEnvelope) {
        let required = match &env.payload {
            ServerPayload::Data(_) | ServerPayload::Info(_) => AccessMode::READ,
            ServerPayload::Pres(_) => AccessMode::PRESENCE,
            // Unicast payloads never go through broadcast.
            ServerPayload::Ctrl(_) | ServerPayload::Meta(_) => return,
        };

        struct LinkTally {
            carrier: Arc<Session>,
            admitted: Vec<SessionId>,
            total: usize,
        }
        let mut links: HashMap<SessionId, LinkTally> = HashMap::new();
        let mut evict: Vec<SessionId> = Vec::new();

        for (sid, att) in &self.sessions {
            let admitted = env.filters.admits(sid, att.uid) && self.recipient_ok(att, required);

            if att.sess.kind == SessionKind::Proxy {
                if let Some(anchor) = att.sess.anchor() {
                    let tally = links.entry(anchor).or_insert_with(|| LinkTally {
                        carrier: Arc::clone(&att.sess),
                        admitted: Vec::new(),
                        total: 0,
                    });
                    tally.total += 1;
                    if admitted {
                        tally.admitted.push(sid.clone());
                    }
                    continue;
                }
            }

            if admitted && !att.sess.queue_out(env.clone()) && !att.sess.is_terminating() {
                evict.push(sid.clone());
            }
        }

        for (_, tally) in links {
            if tally.admitted.is_empty() {
                continue;
            }
            if tally.admitted.len() == tally.total {
                // Whole link qualifies: one wildcard delivery.
                tally.carrier.forward_wildcard(env.clone());
            } else {
                for sid in tally.admitted {
                    if let Some(att) = self.sessions.get(&sid) {
                        att.sess.queue_out(env.clone());
                    }
                }
            }
        }

        for sid in evict {
            tracing::warn!(topic = %self.name, sid = %sid, "slow consumer, scheduling eviction");
            if let Some(att) = self.sessions.get(&sid) {
                let sess = Arc::clone(&att.sess);
                tokio::spawn(async move { sess.clean_up().await });
            }
        }
    }

    fn recipient_ok(&self, att: &Attachment, required: AccessMode) -> bool {
        // Proxy topics fan out pre-filtered traffic from the master.
        if self.handle.is_proxy {
            return true;
        }
        match self.per_user.get(&att.uid) {
            Some(pud) => pud.effective().has(required),
            None => false,
        }
    }

    // --- session updates ---

    fn handle_session_update(&mut self, upd: SessionUpdate) {
        if self.handle.is_proxy {
            let (sid, req) = match &upd {
                SessionUpdate::UserAgent { sid, .. } => (sid.clone(), ProxyReqKind::UserAgent),
                SessionUpdate::Foreground { sid } => (sid.clone(), ProxyReqKind::Background),
            };
            if let Some(att) = self.sessions.get(&sid) {
                let fwd = ProxyForward {
                    req,
                    topic: self.name.clone(),
                    env: None,
                    sess: att.sess.describe(att.is_channel),
                };
                let _ = self.deps.router.forward(fwd);
            }
            return;
        }

        match upd {
            SessionUpdate::UserAgent { sid, user_agent } => {
                // Only the personal topic reports user-agent changes.
                if self.category != TopicCategory::Me {
                    return;
                }
                let Some(att) = self.sessions.get(&sid) else { return };
                if user_agent.is_empty() || user_agent == self.user_agent {
                    return;
                }
                self.user_agent = user_agent.clone();
                let uid = att.uid;
                let mut pres = ServerEnvelope::pres(self.name.clone(), PresWhat::Ua, uid);
                if let ServerPayload::Pres(p) = &mut pres.payload {
                    p.user_agent = Some(user_agent);
                }
                self.broadcast(pres);
            }
            SessionUpdate::Foreground { sid } => {
                let Some(att) = self.sessions.get_mut(&sid) else { return };
                if att.counted {
                    return;
                }
                att.counted = true;
                let uid = att.uid;
                let first = match self.per_user.get_mut(&uid) {
                    Some(pud) => {
                        pud.online += 1;
                        pud.online == 1
                    }
                    None => false,
                };
                if first {
                    let env = ServerEnvelope::pres(self.name.clone(), PresWhat::On, uid)
                        .skip_session(sid);
                    self.broadcast(env);
                }
            }
        }
    }

    // --- shutdown ---

    fn handle_exit(&mut self, req: ExitRequest) {
        tracing::debug!(topic = %self.name, reason = ?req.reason, "topic exiting");
        match req.reason {
            ExitReason::Deleted => {
                self.status.mark_deleted();
                let mut pres =
                    ServerEnvelope::pres(self.name.clone(), PresWhat::Gone, UserId::NONE);
                if let ServerPayload::Pres(p) = &mut pres.payload {
                    p.user = None;
                }
                self.broadcast(pres);
            }
            ExitReason::Rehash | ExitReason::MasterLost => {
                self.status.pause();
                let err = EngineError::ShuttingDown;
                for att in self.sessions.values() {
                    att.sess
                        .queue_out(ServerEnvelope::ctrl_err(None, &self.name, &err));
                }
                if self.handle.is_proxy {
                    // Tell the master to tear down our multiplex link.
                    if let Some(att) = self.sessions.values().next() {
                        let fwd = ProxyForward {
                            req: ProxyReqKind::Detach,
                            topic: self.name.clone(),
                            env: None,
                            sess: att.sess.describe(att.is_channel),
                        };
                        let _ = self.deps.router.forward(fwd);
                    }
                }
            }
            ExitReason::Shutdown => {}
        }

        for att in self.sessions.values() {
            att.sess.unsubscribe(&self.name);
        }
        self.sessions.clear();
        self.handle.mark_dead();
        if let Some(done) = req.done {
            let _ = done.send(());
        }
    }

    fn reply_to(&self, env: &ClientEnvelope, reply: ServerEnvelope) {
        if let Some(att) = self.sessions.get(&env.sid) {
            att.sess.queue_out(reply);
        }
    }
}

async fn load_state(store: &dyn Store, name: &str) -> Result<LoadedState, EngineError> {
    let rec = match store.topic_get(name).await {
        Ok(rec) => Some(rec),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err.into()),
    };
    let subs = if rec.is_some() {
        store
            .subs_for_topic(name)
            .await
            .map_err(EngineError::from)?
    } else {
        Vec::new()
    };
    Ok(LoadedState { rec, subs })
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::LocalRouter;
    use palaver_core::envelope::{
        CallEvent, ClientDel, ClientGet, ClientLeave, ClientSet, ClientSub, Ctrl, Data, DelWhat,
        SetSub,
    };
    use palaver_store::{MemoryPush, MemoryStore, TrivialAuth};

    struct Fixture {
        deps: TopicDeps,
        hub_rx: mpsc::Receiver<HubCmd>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (hub_tx, hub_rx) = mpsc::channel(16);
        let deps = TopicDeps {
            store: Arc::clone(&store) as Arc<dyn Store>,
            auth: Arc::new(TrivialAuth),
            push: Arc::new(MemoryPush::new()),
            router: Arc::new(LocalRouter),
            hub_tx,
        };
        Fixture {
            deps,
            hub_rx,
            store,
        }
    }

    fn session() -> (Arc<Session>, mpsc::Receiver<ServerEnvelope>) {
        Session::new(SessionKind::Websocket, 16)
    }

    fn routed_env(
        sess: &Arc<Session>,
        uid: UserId,
        alias: &str,
        payload: ClientPayload,
    ) -> ClientEnvelope {
        let routed = palaver_core::topic::route_topic_name(alias, uid).unwrap();
        let mut env = ClientEnvelope::new(payload, sess.id.clone(), uid);
        env.topic = routed.name;
        env.original = routed.original;
        env
    }

    fn sub_env(
        sess: &Arc<Session>,
        uid: UserId,
        alias: &str,
        mode: Option<AccessMode>,
    ) -> ClientEnvelope {
        routed_env(
            sess,
            uid,
            alias,
            ClientPayload::Sub(ClientSub {
                id: Some("s".into()),
                topic: alias.into(),
                mode,
                get_desc: false,
                get_sub: false,
                background: false,
            }),
        )
    }

    fn pub_env(
        sess: &Arc<Session>,
        uid: UserId,
        alias: &str,
        text: &str,
        no_echo: bool,
    ) -> ClientEnvelope {
        routed_env(
            sess,
            uid,
            alias,
            ClientPayload::Pub(ClientPub {
                id: Some("p".into()),
                topic: alias.into(),
                no_echo,
                head: None,
                content: json!(text),
            }),
        )
    }

    async fn next(rx: &mut mpsc::Receiver<ServerEnvelope>) -> ServerEnvelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("session channel closed")
    }

    async fn next_ctrl(rx: &mut mpsc::Receiver<ServerEnvelope>) -> Ctrl {
        loop {
            if let ServerPayload::Ctrl(c) = next(rx).await.payload {
                return c;
            }
        }
    }

    async fn next_data(rx: &mut mpsc::Receiver<ServerEnvelope>) -> Data {
        loop {
            if let ServerPayload::Data(d) = next(rx).await.payload {
                return d;
            }
        }
    }

    async fn next_pres_on(rx: &mut mpsc::Receiver<ServerEnvelope>) {
        loop {
            if let ServerPayload::Pres(p) = next(rx).await.payload {
                if p.what == PresWhat::On {
                    return;
                }
            }
        }
    }

    async fn join(
        handle: &TopicHandle,
        sess: &Arc<Session>,
        rx: &mut mpsc::Receiver<ServerEnvelope>,
        uid: UserId,
        alias: &str,
        mode: Option<AccessMode>,
    ) -> Ctrl {
        sess.set_uid(uid);
        handle
            .try_join(JoinRequest::new(
                Arc::clone(sess),
                sub_env(sess, uid, alias, mode),
            ))
            .unwrap();
        next_ctrl(rx).await
    }

    #[tokio::test]
    async fn publish_assigns_strictly_increasing_seq() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpred",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        let ack = join(&handle, &s1, &mut rx1, UserId(1), "grpred", None).await;
        assert_eq!(ack.code, 202);
        let ack = join(&handle, &s2, &mut rx2, UserId(2), "grpred", None).await;
        assert_eq!(ack.code, 202);

        handle
            .try_client(pub_env(&s1, UserId(1), "grpred", "one", false))
            .unwrap();
        handle
            .try_client(pub_env(&s1, UserId(1), "grpred", "two", false))
            .unwrap();

        let ack = next_ctrl(&mut rx1).await;
        assert_eq!(ack.code, 202);
        assert_eq!(ack.params.as_ref().unwrap()["seq"], json!(1));
        let ack = next_ctrl(&mut rx1).await;
        assert_eq!(ack.params.as_ref().unwrap()["seq"], json!(2));

        // Receiver sees both messages, in publish order.
        assert_eq!(next_data(&mut rx2).await.seq, 1);
        assert_eq!(next_data(&mut rx2).await.seq, 2);
    }

    #[tokio::test]
    async fn no_echo_skips_the_publishing_session() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpecho",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpecho", None).await;
        join(&handle, &s2, &mut rx2, UserId(2), "grpecho", None).await;

        handle
            .try_client(pub_env(&s1, UserId(1), "grpecho", "quiet", true))
            .unwrap();
        handle
            .try_client(pub_env(&s1, UserId(1), "grpecho", "loud", false))
            .unwrap();

        // s1 skipped seq 1; the first data it sees is its own seq 2 echo.
        assert_eq!(next_data(&mut rx1).await.seq, 2);
        // s2 got both.
        assert_eq!(next_data(&mut rx2).await.seq, 1);
        assert_eq!(next_data(&mut rx2).await.seq, 2);
    }

    #[tokio::test]
    async fn channel_reader_cannot_publish() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpblue",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpblue", None).await;
        // Attach through the channel alias: read-only grant.
        let ack = join(&handle, &s2, &mut rx2, UserId(2), "chnblue", None).await;
        assert_eq!(ack.code, 202);

        handle
            .try_client(pub_env(&s2, UserId(2), "chnblue", "nope", false))
            .unwrap();
        assert_eq!(next_ctrl(&mut rx2).await.code, 403);
    }

    #[tokio::test]
    async fn failed_save_does_not_advance_seq() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpsave",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpsave", None).await;

        f.store.fail_next_write();
        handle
            .try_client(pub_env(&s1, UserId(1), "grpsave", "lost", false))
            .unwrap();
        assert_eq!(next_ctrl(&mut rx1).await.code, 500);

        handle
            .try_client(pub_env(&s1, UserId(1), "grpsave", "kept", false))
            .unwrap();
        let ack = next_ctrl(&mut rx1).await;
        assert_eq!(ack.code, 202);
        assert_eq!(ack.params.as_ref().unwrap()["seq"], json!(1), "no gap after failure");
    }

    #[tokio::test]
    async fn data_filtered_by_read_permission() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpperm",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpperm", None).await;
        // s2 asks for a mode without R: effective mode cannot read.
        let want = AccessMode::JOIN | AccessMode::WRITE;
        join(&handle, &s2, &mut rx2, UserId(2), "grpperm", Some(want)).await;

        handle
            .try_client(pub_env(&s1, UserId(1), "grpperm", "secret", false))
            .unwrap();
        assert_eq!(next_data(&mut rx1).await.seq, 1);

        let quiet = tokio::time::timeout(Duration::from_millis(100), rx2.recv()).await;
        assert!(quiet.is_err(), "non-reader must not receive data");
    }

    #[tokio::test]
    async fn p2p_unsubscribe_notifies_peer_and_deletes_topic() {
        let mut f = fixture();
        let handle = Topic::spawn(
            "p2p1-2",
            TopicCategory::P2P,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        assert_eq!(join(&handle, &s1, &mut rx1, UserId(1), "usr2", None).await.code, 202);
        assert_eq!(join(&handle, &s2, &mut rx2, UserId(2), "usr1", None).await.code, 202);

        let leave = routed_env(
            &s1,
            UserId(1),
            "usr2",
            ClientPayload::Leave(ClientLeave {
                id: Some("l".into()),
                topic: "usr2".into(),
                unsub: true,
            }),
        );
        handle
            .try_leave(LeaveNotice::requested(Arc::clone(&s1), leave))
            .unwrap();
        assert_eq!(next_ctrl(&mut rx1).await.code, 200);

        // Peer sees the departure as "gone".
        loop {
            if let ServerPayload::Pres(p) = next(&mut rx2).await.payload {
                if p.what == PresWhat::Gone {
                    assert_eq!(p.user, Some(UserId(1)));
                    break;
                }
            }
        }

        // Below two members the topic is torn down.
        match tokio::time::timeout(Duration::from_secs(2), f.hub_rx.recv()).await {
            Ok(Some(HubCmd::Delete { name, .. })) => assert_eq!(name, "p2p1-2"),
            _ => panic!("expected delete command"),
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_not_blocked() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpslow",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        // One-slot queue that nobody drains: the join ack fills it.
        let (s2, _rx2) = Session::new(SessionKind::Websocket, 1);
        join(&handle, &s1, &mut rx1, UserId(1), "grpslow", None).await;
        s2.set_uid(UserId(2));
        handle
            .try_join(JoinRequest::new(
                Arc::clone(&s2),
                sub_env(&s2, UserId(2), "grpslow", None),
            ))
            .unwrap();
        // s1 observing u2's arrival means the join has been processed.
        next_pres_on(&mut rx1).await;

        handle
            .try_client(pub_env(&s1, UserId(1), "grpslow", "flood", false))
            .unwrap();
        assert_eq!(next_ctrl(&mut rx1).await.code, 202);

        for _ in 0..100 {
            if s2.is_terminating() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(s2.is_terminating(), "overflowing session must be evicted");
        assert!(!s1.is_terminating());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_topic_unregisters_after_idle_timeout() {
        let mut f = fixture();
        let cfg = EngineConfig {
            idle_kill: Duration::from_secs(1),
            ..Default::default()
        };
        let _handle = Topic::spawn("grpidle", TopicCategory::Group, None, f.deps.clone(), cfg);

        match f.hub_rx.recv().await {
            Some(HubCmd::Unregister { name }) => assert_eq!(name, "grpidle"),
            _ => panic!("expected unregister"),
        }
    }

    #[tokio::test]
    async fn get_desc_reports_seq_and_own_access() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpmeta",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpmeta", None).await;
        handle
            .try_client(pub_env(&s1, UserId(1), "grpmeta", "x", true))
            .unwrap();
        next_ctrl(&mut rx1).await;

        let get = routed_env(
            &s1,
            UserId(1),
            "grpmeta",
            ClientPayload::Get(ClientGet {
                id: Some("g".into()),
                topic: "grpmeta".into(),
                what: MetaWhat::Desc,
            }),
        );
        handle.try_meta(get).unwrap();
        loop {
            if let ServerPayload::Meta(m) = next(&mut rx1).await.payload {
                let desc = m.desc.unwrap();
                assert_eq!(desc.seq, 1);
                // First joiner owns the topic.
                assert!(desc.access.unwrap().effective().is_owner());
                break;
            }
        }
    }

    #[tokio::test]
    async fn set_sub_narrows_own_want_and_broadcasts_acs() {
        let f = fixture();
        let handle = Topic::spawn(
            "grpacs",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpacs", None).await;
        join(&handle, &s2, &mut rx2, UserId(2), "grpacs", None).await;

        let narrow: AccessMode = "JR".parse().unwrap();
        let set = routed_env(
            &s2,
            UserId(2),
            "grpacs",
            ClientPayload::Set(ClientSet {
                id: Some("m".into()),
                topic: "grpacs".into(),
                desc: None,
                sub: Some(SetSub {
                    user: None,
                    mode: narrow,
                }),
            }),
        );
        handle.try_meta(set).unwrap();
        assert_eq!(next_ctrl(&mut rx2).await.code, 200);

        loop {
            if let ServerPayload::Pres(p) = next(&mut rx1).await.payload {
                if p.what == PresWhat::Acs {
                    assert_eq!(p.user, Some(UserId(2)));
                    assert_eq!(p.mode, Some(narrow));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn owner_delete_topic_signals_hub() {
        let mut f = fixture();
        let handle = Topic::spawn(
            "grpdel",
            TopicCategory::Group,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        join(&handle, &s1, &mut rx1, UserId(1), "grpdel", None).await;

        let del = routed_env(
            &s1,
            UserId(1),
            "grpdel",
            ClientPayload::Del(ClientDel {
                id: Some("d".into()),
                topic: "grpdel".into(),
                what: DelWhat::Topic,
                user: None,
                hard: true,
                seq_list: Vec::new(),
            }),
        );
        handle.try_meta(del).unwrap();
        assert_eq!(next_ctrl(&mut rx1).await.code, 200);
        match tokio::time::timeout(Duration::from_secs(2), f.hub_rx.recv()).await {
            Ok(Some(HubCmd::Delete { name, hard })) => {
                assert_eq!(name, "grpdel");
                assert!(hard);
            }
            _ => panic!("expected delete command"),
        }
    }

    #[tokio::test]
    async fn call_invite_reaches_only_the_callee() {
        let f = fixture();
        let handle = Topic::spawn(
            "p2p3-4",
            TopicCategory::P2P,
            None,
            f.deps.clone(),
            EngineConfig::default(),
        );
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        join(&handle, &s1, &mut rx1, UserId(3), "usr4", None).await;
        join(&handle, &s2, &mut rx2, UserId(4), "usr3", None).await;
        // Drain u4's arrival before checking for silence below.
        next_pres_on(&mut rx1).await;

        let invite = routed_env(
            &s1,
            UserId(3),
            "usr4",
            ClientPayload::Note(ClientNote {
                topic: "usr4".into(),
                what: NoteWhat::Call,
                seq: None,
                event: Some(CallEvent::Invite),
                payload: Some(json!({"sdp": "offer"})),
            }),
        );
        handle.try_client(invite).unwrap();

        loop {
            if let ServerPayload::Info(i) = next(&mut rx2).await.payload {
                assert_eq!(i.event, Some(CallEvent::Invite));
                assert_eq!(i.from, UserId(3));
                break;
            }
        }
        let quiet = tokio::time::timeout(Duration::from_millis(100), rx1.recv()).await;
        assert!(quiet.is_err(), "invite must not echo to the caller");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_as_missed() {
        let f = fixture();
        let cfg = EngineConfig {
            call_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let handle = Topic::spawn("p2p5-6", TopicCategory::P2P, None, f.deps.clone(), cfg);
        let (s1, mut rx1) = session();
        let (s2, mut rx2) = session();
        join(&handle, &s1, &mut rx1, UserId(5), "usr6", None).await;
        join(&handle, &s2, &mut rx2, UserId(6), "usr5", None).await;

        let invite = routed_env(
            &s1,
            UserId(5),
            "usr6",
            ClientPayload::Note(ClientNote {
                topic: "usr6".into(),
                what: NoteWhat::Call,
                seq: None,
                event: Some(CallEvent::Invite),
                payload: None,
            }),
        );
        handle.try_client(invite).unwrap();

        // Nobody answers; the establishment timer fires and the hang-up
        // reaches both parties.
        loop {
            if let ServerPayload::Info(i) = next(&mut rx2).await.payload {
                if i.event == Some(CallEvent::HangUp) {
                    assert_eq!(i.payload.unwrap()["reason"], json!("missed"));
                    break;
                }
            }
        }
    }
}

//! Topic sharding across cooperating nodes: a consistent-hash ring decides
//! which node masters each topic, proxy→master RPC carries client traffic
//! to the owner, and a heartbeat/vote protocol elects the node that
//! recomputes the ring when membership changes.
//!
//! Wire format: JSON frames behind a length prefix, one dialed link per
//! configured peer plus an accept loop for inbound links. All sends are
//! try_send-or-drop, matching the engine's backpressure policy.

pub mod election;
pub mod peer;
pub mod proto;
pub mod ring;

pub use election::{FailoverState, Role};
pub use peer::{Peer, PeerEvent};
pub use proto::ClusterMsg;
pub use ring::{HashRing, RingSignature};

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;

use palaver_core::{
    EngineError, Fingerprint, NodeId, ServerEnvelope, SessionId,
};
use palaver_engine::session::TaggedEnvelope;
use palaver_engine::{
    Hub, ProxyForward, ProxyReqKind, RemoteRouter, RemoteSessionDesc, Session, SessionStore,
    SessionUpdate, TopicCtrl,
};

/// Name of the singleton system topic, re-homed on every rehash.
const SYS_TOPIC: &str = "sys";

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: NodeId,
    pub addr: String,
}

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// This node's name; must appear in every peer's configuration.
    pub node: NodeId,
    /// Bind address for inbound peer links.
    pub listen: String,
    pub peers: Vec<PeerConfig>,
    /// Virtual points per node on the hash ring.
    pub replicas: usize,
    pub heartbeat: Duration,
    /// Missed heartbeats before a follower stands for election.
    pub max_missed: u32,
    /// How long a candidacy waits for a majority before reverting.
    pub election_timeout: Duration,
    /// Outbound queue capacity per peer link.
    pub peer_queue: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node: NodeId::new("one"),
            listen: "127.0.0.1:12000".into(),
            peers: Vec::new(),
            replicas: 20,
            heartbeat: Duration::from_millis(500),
            max_missed: 3,
            election_timeout: Duration::from_millis(1500),
            peer_queue: 256,
        }
    }
}

/// Key of one multiplex link: the master-side topic, the remote node, and
/// whether the link carries channel readers (channels keep readers on a
/// link of their own).
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
struct MplexKey {
    topic: String,
    node: NodeId,
    reader: bool,
}

/// The cluster distribution layer. Implements [`RemoteRouter`] for the
/// hub, so topic actors forward through it without knowing about peers.
pub struct Cluster {
    cfg: ClusterConfig,
    /// Identifies this process run; a peer seeing it change knows this
    /// node restarted and discards its stand-in sessions.
    fingerprint: Fingerprint,
    hub: Weak<Hub>,
    sessions: Arc<SessionStore>,
    peers: DashMap<NodeId, Arc<Peer>>,
    ring: RwLock<HashRing>,
    failover: Mutex<FailoverState>,
    mplex: DashMap<MplexKey, Arc<Session>>,
}

impl Cluster {
    /// Build the cluster layer and register it as the hub's router. The
    /// initial ring optimistically spans every configured node; the first
    /// elected leader corrects it.
    pub fn new(cfg: ClusterConfig, hub: &Arc<Hub>, sessions: Arc<SessionStore>) -> Arc<Self> {
        let mut nodes: Vec<NodeId> = cfg.peers.iter().map(|p| p.name.clone()).collect();
        nodes.push(cfg.node.clone());
        let ring = HashRing::new(cfg.replicas, &nodes);
        let failover = FailoverState::new(cfg.node.clone(), nodes.len());

        let cluster = Arc::new(Self {
            fingerprint: Fingerprint::new(),
            hub: Arc::downgrade(hub),
            sessions,
            peers: DashMap::new(),
            ring: RwLock::new(ring),
            failover: Mutex::new(failover),
            mplex: DashMap::new(),
            cfg,
        });
        hub.set_router(Arc::clone(&cluster) as Arc<dyn RemoteRouter>);
        cluster
    }

    pub fn node(&self) -> &NodeId {
        &self.cfg.node
    }

    pub fn ring_signature(&self) -> RingSignature {
        self.ring.read().signature()
    }

    pub fn is_leader(&self) -> bool {
        self.failover.lock().is_leader()
    }

    /// Bind the listener, dial every peer, and spawn the event and
    /// failover loops.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen).await?;
        tracing::info!(node = %self.cfg.node, listen = %self.cfg.listen, "cluster listening");

        let (events_tx, events_rx) = mpsc::channel(1024);
        tokio::spawn(peer::listen(
            listener,
            self.cfg.node.clone(),
            self.fingerprint.clone(),
            events_tx.clone(),
        ));

        for pc in &self.cfg.peers {
            let peer = Peer::connect(
                pc.name.clone(),
                pc.addr.clone(),
                self.cfg.node.clone(),
                self.fingerprint.clone(),
                self.cfg.peer_queue,
                events_tx.clone(),
            );
            self.peers.insert(pc.name.clone(), peer);
        }

        tokio::spawn(Arc::clone(self).event_loop(events_rx));
        tokio::spawn(Arc::clone(self).failover_loop());
        Ok(())
    }

    pub async fn stop(&self) {
        for peer in self.peers.iter() {
            peer.stop();
        }
        let links: Vec<Arc<Session>> = self.mplex.iter().map(|e| Arc::clone(&e)).collect();
        self.mplex.clear();
        for link in links {
            link.clean_up().await;
        }
    }

    fn hub(&self) -> Option<Arc<Hub>> {
        self.hub.upgrade()
    }

    fn send_to(&self, node: &NodeId, msg: ClusterMsg) -> Result<(), EngineError> {
        let peer = self
            .peers
            .get(node)
            .ok_or_else(|| EngineError::NodeUnreachable(node.to_string()))?;
        peer.try_send(msg)
    }

    fn broadcast(&self, msg: &ClusterMsg) {
        for peer in self.peers.iter() {
            if let Err(e) = peer.try_send(msg.clone()) {
                tracing::debug!(peer = %peer.node, error = %e, "dropping {}", msg.verb());
            }
        }
    }

    /// Configured nodes currently reachable, this one included.
    fn active_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|p| p.is_alive())
            .map(|p| p.node.clone())
            .collect();
        nodes.push(self.cfg.node.clone());
        nodes
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Connected { node, fingerprint } => {
                    self.handle_peer_up(node, fingerprint).await;
                }
                PeerEvent::Disconnected { node } => self.handle_peer_down(node).await,
                PeerEvent::Frame { node, msg } => self.handle_frame(node, msg).await,
            }
        }
    }

    async fn handle_peer_up(self: &Arc<Self>, node: NodeId, fingerprint: Fingerprint) {
        if let Some(peer) = self.peers.get(&node).map(|p| Arc::clone(&p)) {
            if peer.observe_fingerprint(&fingerprint) {
                tracing::info!(%node, "peer restarted");
                self.invalidate_node(&node).await;
            }
        }
        if self.failover.lock().is_leader() {
            let ring = self.ring.read().with_nodes(&self.active_nodes());
            self.apply_ring(ring).await;
            self.send_leader_heartbeat();
        }
    }

    async fn handle_peer_down(self: &Arc<Self>, node: NodeId) {
        tracing::warn!(%node, "peer down");
        self.failover.lock().node_down(&node);
        self.invalidate_node(&node).await;
        if self.failover.lock().is_leader() {
            let ring = self.ring.read().with_nodes(&self.active_nodes());
            self.apply_ring(ring).await;
            self.send_leader_heartbeat();
        }
    }

    /// Tear down every stand-in tied to a peer: its proxy and multiplex
    /// sessions here, plus master-side attachments in the topics.
    async fn invalidate_node(&self, node: &NodeId) {
        let stale: Vec<MplexKey> = self
            .mplex
            .iter()
            .filter(|e| e.key().node == *node)
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.mplex.remove(&key);
        }
        self.sessions.invalidate_node(node).await;
        if let Some(hub) = self.hub() {
            hub.invalidate_node(node).await;
        }
    }

    async fn handle_frame(self: &Arc<Self>, from: NodeId, msg: ClusterMsg) {
        match msg {
            ClusterMsg::Handshake { .. } => {
                // Only valid as the first frame; the link layer consumes it.
                tracing::debug!(%from, "stray handshake frame");
            }
            ClusterMsg::TopicMaster {
                node,
                fingerprint,
                signature,
                req,
                topic,
                env,
                sess,
            } => {
                self.handle_master_req(node, fingerprint, signature, req, topic, env, sess)
                    .await;
            }
            ClusterMsg::TopicProxy { topic, sid, env } => {
                self.handle_proxy_delivery(topic, sid, env);
            }
            ClusterMsg::Route { env } => {
                if let Some(hub) = self.hub() {
                    if let Err(e) = hub.route(env) {
                        tracing::debug!(%from, error = %e, "dropping routed envelope");
                    }
                }
            }
            ClusterMsg::Ping { node, fingerprint } => {
                if let Some(peer) = self.peers.get(&node).map(|p| Arc::clone(&p)) {
                    if peer.observe_fingerprint(&fingerprint) {
                        tracing::info!(%node, "peer restart detected via ping");
                        self.invalidate_node(&node).await;
                    }
                }
            }
            ClusterMsg::Vote { term, candidate } => {
                let granted = self.failover.lock().grant_vote(term, &candidate);
                let ballot = ClusterMsg::Ballot {
                    term,
                    node: self.cfg.node.clone(),
                    granted,
                };
                if let Err(e) = self.send_to(&candidate, ballot) {
                    tracing::debug!(%candidate, error = %e, "dropping ballot");
                }
            }
            ClusterMsg::Ballot { term, node, granted } => {
                let won = self.failover.lock().record_ballot(term, &node, granted);
                if won {
                    let ring = self.ring.read().with_nodes(&self.active_nodes());
                    self.apply_ring(ring).await;
                    self.send_leader_heartbeat();
                }
            }
            ClusterMsg::Heartbeat {
                term,
                leader,
                signature,
                nodes,
            } => {
                let accepted = self.failover.lock().observe_heartbeat(term, &leader);
                if accepted && signature != self.ring.read().signature() {
                    let ring = self.ring.read().with_nodes(&nodes);
                    self.apply_ring(ring).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Master side: forwarded client traffic
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_master_req(
        self: &Arc<Self>,
        node: NodeId,
        fingerprint: Fingerprint,
        signature: RingSignature,
        req: ProxyReqKind,
        topic: String,
        env: Option<palaver_core::ClientEnvelope>,
        desc: RemoteSessionDesc,
    ) {
        let Some(hub) = self.hub() else { return };

        if let Some(peer) = self.peers.get(&node).map(|p| Arc::clone(&p)) {
            if peer.observe_fingerprint(&fingerprint) {
                tracing::info!(%node, "peer restart detected on forwarded request");
                self.invalidate_node(&node).await;
            }
        }

        // A stale ring on the sender means it may not even own the proxy
        // role for this topic. Reject without touching topic state; the
        // coded reply tells the proxy to resync.
        if signature != self.ring.read().signature() {
            tracing::warn!(%node, %topic, "ring signature mismatch, rejecting");
            let id = env.as_ref().and_then(|e| e.id()).map(str::to_owned);
            let err = EngineError::Desync("ring signature mismatch".into());
            let reject = ClusterMsg::TopicProxy {
                topic: topic.clone(),
                sid: desc.sid.clone(),
                env: ServerEnvelope::ctrl_err(id, topic.as_str(), &err),
            };
            if let Err(e) = self.send_to(&node, reject) {
                tracing::debug!(%node, error = %e, "dropping rejection");
            }
            return;
        }

        match req {
            ProxyReqKind::Join => {
                let Some(env) = env else {
                    tracing::warn!(%node, %topic, "join forward without envelope");
                    return;
                };
                let proxy = match self.proxy_session(&hub, &topic, &node, &desc) {
                    Ok(sess) => sess,
                    Err(e) => {
                        tracing::warn!(%node, %topic, error = %e, "cannot anchor proxy session");
                        return;
                    }
                };
                hub.join(&proxy, env).await;
            }
            ProxyReqKind::Leave => {
                let Some(proxy) = self.sessions.get(&desc.sid) else { return };
                let Some(handle) = proxy.subscription(&topic) else { return };
                let notice = match env {
                    Some(env) => palaver_engine::LeaveNotice::requested(Arc::clone(&proxy), env),
                    None => palaver_engine::LeaveNotice::synthetic(Arc::clone(&proxy)),
                };
                if let Err(e) = handle.try_leave(notice) {
                    tracing::debug!(%topic, sid = %desc.sid, error = %e, "leave forward dropped");
                }
            }
            ProxyReqKind::Meta | ProxyReqKind::Broadcast | ProxyReqKind::Call => {
                let Some(proxy) = self.sessions.get(&desc.sid) else {
                    tracing::debug!(%topic, sid = %desc.sid, "forward for unknown session");
                    return;
                };
                let Some(env) = env else { return };
                proxy.dispatch(env.payload, &hub).await;
            }
            ProxyReqKind::Background => {
                let Some(proxy) = self.sessions.get(&desc.sid) else { return };
                proxy.set_background(desc.background);
                if !desc.background {
                    if let Some(handle) = proxy.subscription(&topic) {
                        let upd = SessionUpdate::Foreground {
                            sid: desc.sid.clone(),
                        };
                        if let Err(e) = handle.try_update(upd) {
                            tracing::debug!(%topic, error = %e, "foreground update dropped");
                        }
                    }
                }
            }
            ProxyReqKind::UserAgent => {
                let Some(proxy) = self.sessions.get(&desc.sid) else { return };
                if let Some(handle) = proxy.subscription(&topic) {
                    let upd = SessionUpdate::UserAgent {
                        sid: desc.sid.clone(),
                        user_agent: desc.user_agent.clone(),
                    };
                    if let Err(e) = handle.try_update(upd) {
                        tracing::debug!(%topic, error = %e, "user-agent update dropped");
                    }
                }
            }
            ProxyReqKind::Detach => {
                if let Some(handle) = hub.get(&topic) {
                    let _ = handle.try_ctrl(TopicCtrl::ProxyDetached { node: node.clone() });
                }
                for reader in [false, true] {
                    let key = MplexKey {
                        topic: topic.clone(),
                        node: node.clone(),
                        reader,
                    };
                    if let Some((_, link)) = self.mplex.remove(&key) {
                        self.sessions.remove(&link.id);
                        tokio::spawn(async move { link.clean_up().await });
                    }
                }
            }
        }
    }

    /// Proxy stand-in for a remote session, reused across that session's
    /// topics on this node; created anchored to the per-(topic, node)
    /// multiplex link on first sight.
    fn proxy_session(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        topic: &str,
        node: &NodeId,
        desc: &RemoteSessionDesc,
    ) -> Result<Arc<Session>, EngineError> {
        if let Some(existing) = self.sessions.get(&desc.sid) {
            return Ok(existing);
        }
        let (link, tx) = self.multiplex_link(hub, topic, node, desc.is_channel)?;
        link.add_remote_uid(desc.uid);
        let proxy = Session::new_proxy(
            desc.sid.clone(),
            desc.uid,
            desc.user_agent.clone(),
            desc.background,
            node.clone(),
            link.id.clone(),
            tx,
        );
        self.sessions.add(Arc::clone(&proxy));
        Ok(proxy)
    }

    fn multiplex_link(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        topic: &str,
        node: &NodeId,
        reader: bool,
    ) -> Result<(Arc<Session>, mpsc::Sender<TaggedEnvelope>), EngineError> {
        let key = MplexKey {
            topic: topic.to_owned(),
            node: node.clone(),
            reader,
        };
        if let Some(link) = self.mplex.get(&key) {
            if !link.is_terminating() {
                let link = Arc::clone(&link);
                let tx = link
                    .multiplex_sender()
                    .ok_or(EngineError::SessionGone)?;
                return Ok((link, tx));
            }
        }
        let (link, rx) = Session::new_multiplex(node.clone(), hub.config().send_queue);
        let tx = link.multiplex_sender().ok_or(EngineError::SessionGone)?;
        self.spawn_relay(node.clone(), rx);
        self.sessions.add(Arc::clone(&link));
        self.mplex.insert(key, Arc::clone(&link));
        tracing::debug!(%topic, %node, reader, "multiplex link created");
        Ok((link, tx))
    }

    /// Drain one multiplex link and ship its tagged envelopes back to the
    /// proxy node. Ends when the link and every anchored proxy are gone.
    fn spawn_relay(self: &Arc<Self>, node: NodeId, mut rx: mpsc::Receiver<TaggedEnvelope>) {
        let cluster = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((sid, env)) = rx.recv().await {
                let Some(cluster) = cluster.upgrade() else { break };
                let msg = ClusterMsg::TopicProxy {
                    topic: env.topic.clone(),
                    sid,
                    env,
                };
                if let Err(e) = cluster.send_to(&node, msg) {
                    tracing::debug!(%node, error = %e, "dropping proxied envelope");
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Proxy side: deliveries coming back from a master
    // ------------------------------------------------------------------

    fn handle_proxy_delivery(&self, topic: String, sid: SessionId, env: ServerEnvelope) {
        if sid.is_wildcard() {
            // Broadcast: fan out through the local proxy topic, which
            // re-applies the envelope's recipient filter.
            let Some(hub) = self.hub() else { return };
            match hub.get(&topic) {
                Some(handle) => {
                    if let Err(e) = handle.try_server(env) {
                        tracing::debug!(%topic, error = %e, "wildcard delivery dropped");
                    }
                }
                None => tracing::debug!(%topic, "wildcard delivery for unknown topic"),
            }
            return;
        }
        match self.sessions.get(&sid) {
            Some(sess) => {
                sess.queue_out(env);
            }
            None => tracing::debug!(%sid, %topic, "delivery for unknown session"),
        }
    }

    // ------------------------------------------------------------------
    // Failover
    // ------------------------------------------------------------------

    async fn failover_loop(self: Arc<Self>) {
        enum Step {
            Heartbeat,
            Elect(u64),
            Idle,
        }
        let mut tick = tokio::time::interval(self.cfg.heartbeat);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut candidate_deadline: Option<Instant> = None;
        loop {
            tick.tick().await;

            let ping = ClusterMsg::Ping {
                node: self.cfg.node.clone(),
                fingerprint: self.fingerprint.clone(),
            };
            self.broadcast(&ping);

            let step = {
                let mut fs = self.failover.lock();
                match fs.role() {
                    Role::Leader => {
                        candidate_deadline = None;
                        Step::Heartbeat
                    }
                    Role::Candidate => {
                        if candidate_deadline.is_some_and(|t| Instant::now() >= t) {
                            fs.election_timed_out();
                            candidate_deadline = None;
                        }
                        Step::Idle
                    }
                    Role::Follower => {
                        if fs.heartbeat_missed(self.cfg.max_missed) {
                            let term = fs.start_election();
                            // Randomized window so simultaneous candidates
                            // do not retry in lockstep.
                            let half =
                                (self.cfg.election_timeout / 2).max(Duration::from_millis(1));
                            let spread = rand::thread_rng().gen_range(Duration::ZERO..half);
                            candidate_deadline =
                                Some(Instant::now() + self.cfg.election_timeout + spread);
                            Step::Elect(term)
                        } else {
                            Step::Idle
                        }
                    }
                }
            };
            match step {
                Step::Heartbeat => self.send_leader_heartbeat(),
                Step::Elect(term) => {
                    let vote = ClusterMsg::Vote {
                        term,
                        candidate: self.cfg.node.clone(),
                    };
                    self.broadcast(&vote);
                }
                Step::Idle => {}
            }
        }
    }

    fn send_leader_heartbeat(&self) {
        let (term, ring) = {
            let fs = self.failover.lock();
            if !fs.is_leader() {
                return;
            }
            (fs.term(), self.ring.read().clone())
        };
        let beat = ClusterMsg::Heartbeat {
            term,
            leader: self.cfg.node.clone(),
            signature: ring.signature(),
            nodes: ring.nodes().to_vec(),
        };
        self.broadcast(&beat);
    }

    /// Install a new ring and rehash the hub: topics whose master role
    /// flipped shut down, and the system topic is re-created here when it
    /// migrated onto this node.
    async fn apply_ring(self: &Arc<Self>, ring: HashRing) {
        {
            let current = self.ring.read();
            if current.signature() == ring.signature() {
                return;
            }
        }
        tracing::info!(
            node = %self.cfg.node,
            signature = %ring.signature(),
            nodes = ring.len(),
            "installing new ring"
        );
        *self.ring.write() = ring;
        let Some(hub) = self.hub() else { return };
        hub.rehash().await;
        if self.node_for(SYS_TOPIC).is_none() {
            if let Err(e) = hub.ensure_topic(SYS_TOPIC) {
                tracing::warn!(error = %e, "cannot re-home system topic");
            }
        }
    }
}

impl RemoteRouter for Cluster {
    fn node_for(&self, topic: &str) -> Option<NodeId> {
        let ring = self.ring.read();
        match ring.node_for(topic) {
            Some(owner) if *owner != self.cfg.node => Some(owner.clone()),
            _ => None,
        }
    }

    fn forward(&self, fwd: ProxyForward) -> Result<(), EngineError> {
        let owner = self
            .node_for(&fwd.topic)
            .ok_or_else(|| EngineError::Desync(format!("{} is mastered here", fwd.topic)))?;
        let msg = ClusterMsg::TopicMaster {
            node: self.cfg.node.clone(),
            fingerprint: self.fingerprint.clone(),
            signature: self.ring.read().signature(),
            req: fwd.req,
            topic: fwd.topic,
            env: fwd.env,
            sess: fwd.sess,
        };
        self.send_to(&owner, msg)
    }

    fn route(&self, env: ServerEnvelope) -> Result<(), EngineError> {
        match self.node_for(&env.topic) {
            Some(owner) => self.send_to(&owner, ClusterMsg::Route { env }),
            None => {
                // Already home; hand it straight to the topic.
                let hub = self.hub().ok_or(EngineError::ShuttingDown)?;
                let handle = hub
                    .get(&env.topic)
                    .ok_or_else(|| EngineError::TopicNotFound(env.topic.clone()))?;
                handle.try_server(env)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::envelope::{ClientPayload, ClientSub};
    use palaver_core::{ClientEnvelope, ServerPayload, UserId};
    use palaver_engine::EngineConfig;
    use palaver_store::{MemoryPush, MemoryStore, TrivialAuth};
    use std::time::Duration;
    use tokio::time::timeout;

    fn cfg(me: &str, others: &[&str]) -> ClusterConfig {
        ClusterConfig {
            node: NodeId::new(me),
            peers: others
                .iter()
                .map(|n| PeerConfig {
                    name: NodeId::new(*n),
                    addr: "127.0.0.1:0".into(),
                })
                .collect(),
            ..ClusterConfig::default()
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        cluster: Arc<Cluster>,
        beta_rx: mpsc::Receiver<ClusterMsg>,
    }

    /// Two-node cluster where the peer link to `beta` is a detached queue
    /// the test drains instead of a socket.
    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(TrivialAuth);
        let push = Arc::new(MemoryPush::new());
        let hub = Hub::new(store, auth, push, EngineConfig::default());
        let sessions = Arc::new(SessionStore::new());
        let cluster = Cluster::new(cfg("alpha", &["beta"]), &hub, sessions);
        let (peer, beta_rx) = Peer::idle(NodeId::new("beta"), "127.0.0.1:0".into(), 64);
        cluster.peers.insert(NodeId::new("beta"), peer);
        Fixture {
            hub,
            cluster,
            beta_rx,
        }
    }

    /// Some group topic this node masters under the fixture's ring.
    fn local_topic(cluster: &Cluster) -> String {
        (0..)
            .map(|i| format!("grp{i}"))
            .find(|name| cluster.node_for(name).is_none())
            .unwrap()
    }

    fn remote_desc(uid: u64) -> RemoteSessionDesc {
        RemoteSessionDesc {
            sid: SessionId::new(),
            uid: UserId(uid),
            user_agent: "test/1".into(),
            background: false,
            is_channel: false,
        }
    }

    fn sub_env(topic: &str, desc: &RemoteSessionDesc) -> ClientEnvelope {
        let payload = ClientPayload::Sub(ClientSub {
            id: Some("1".into()),
            topic: topic.into(),
            mode: None,
            get_desc: false,
            get_sub: false,
            background: false,
        });
        let mut env = ClientEnvelope::new(payload, desc.sid.clone(), desc.uid);
        env.topic = topic.into();
        env.original = topic.into();
        env
    }

    async fn next(rx: &mut mpsc::Receiver<ClusterMsg>) -> ClusterMsg {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for cluster frame")
            .expect("peer queue closed")
    }

    #[tokio::test]
    async fn stale_signature_is_rejected_without_touching_state() {
        let mut fx = fixture();
        let topic = local_topic(&fx.cluster);
        let desc = remote_desc(3);
        let env = sub_env(&topic, &desc);
        let wrong = RingSignature(fx.cluster.ring_signature().0 ^ 1);

        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::TopicMaster {
                    node: NodeId::new("beta"),
                    fingerprint: Fingerprint::new(),
                    signature: wrong,
                    req: ProxyReqKind::Join,
                    topic: topic.clone(),
                    env: Some(env),
                    sess: desc.clone(),
                },
            )
            .await;

        assert_eq!(fx.hub.topic_count(), 0, "no topic may be created");
        assert!(fx.cluster.sessions.is_empty(), "no stand-in sessions");
        match next(&mut fx.beta_rx).await {
            ClusterMsg::TopicProxy { sid, env, .. } => {
                assert_eq!(sid, desc.sid);
                match env.payload {
                    ServerPayload::Ctrl(ctrl) => assert_eq!(ctrl.code, 502),
                    other => panic!("expected ctrl reply, got {other:?}"),
                }
            }
            other => panic!("expected rejection, got {}", other.verb()),
        }
    }

    #[tokio::test]
    async fn forwarded_join_anchors_a_proxy_and_acks_over_the_link() {
        let mut fx = fixture();
        let topic = local_topic(&fx.cluster);
        let desc = remote_desc(5);
        let env = sub_env(&topic, &desc);

        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::TopicMaster {
                    node: NodeId::new("beta"),
                    fingerprint: Fingerprint::new(),
                    signature: fx.cluster.ring_signature(),
                    req: ProxyReqKind::Join,
                    topic: topic.clone(),
                    env: Some(env),
                    sess: desc.clone(),
                },
            )
            .await;

        // Proxy stand-in plus its multiplex link.
        assert_eq!(fx.cluster.sessions.len(), 2);
        assert_eq!(fx.cluster.sessions.local_count(), 0);
        assert_eq!(fx.hub.topic_count(), 1);

        loop {
            match next(&mut fx.beta_rx).await {
                ClusterMsg::TopicProxy { sid, env, .. } => {
                    if let ServerPayload::Ctrl(ctrl) = env.payload {
                        assert_eq!(ctrl.code, 202);
                        assert_eq!(sid, desc.sid, "ack addressed to the original session");
                        break;
                    }
                }
                other => panic!("unexpected frame: {}", other.verb()),
            }
        }
    }

    #[tokio::test]
    async fn peer_restart_invalidates_its_stand_ins() {
        let mut fx = fixture();
        let topic = local_topic(&fx.cluster);
        let desc = remote_desc(6);
        let first_fp = Fingerprint::new();

        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::TopicMaster {
                    node: NodeId::new("beta"),
                    fingerprint: first_fp.clone(),
                    signature: fx.cluster.ring_signature(),
                    req: ProxyReqKind::Join,
                    topic: topic.clone(),
                    env: Some(sub_env(&topic, &desc)),
                    sess: desc.clone(),
                },
            )
            .await;
        assert_eq!(fx.cluster.sessions.len(), 2);
        // Drain the join ack so the restart is the next observable effect.
        loop {
            if let ClusterMsg::TopicProxy { env, .. } = next(&mut fx.beta_rx).await {
                if matches!(env.payload, ServerPayload::Ctrl(_)) {
                    break;
                }
            }
        }

        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::Ping {
                    node: NodeId::new("beta"),
                    fingerprint: Fingerprint::new(),
                },
            )
            .await;

        assert!(fx.cluster.sessions.is_empty(), "stand-ins must be gone");
        assert!(fx.cluster.mplex.is_empty(), "multiplex links must be gone");
    }

    #[tokio::test]
    async fn vote_request_is_answered_with_a_ballot() {
        let mut fx = fixture();
        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::Vote {
                    term: 1,
                    candidate: NodeId::new("beta"),
                },
            )
            .await;
        match next(&mut fx.beta_rx).await {
            ClusterMsg::Ballot { term, node, granted } => {
                assert_eq!(term, 1);
                assert_eq!(node, NodeId::new("alpha"));
                assert!(granted);
            }
            other => panic!("expected ballot, got {}", other.verb()),
        }

        // Same term again: already voted.
        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::Vote {
                    term: 1,
                    candidate: NodeId::new("beta"),
                },
            )
            .await;
        match next(&mut fx.beta_rx).await {
            ClusterMsg::Ballot { granted, .. } => assert!(!granted),
            other => panic!("expected ballot, got {}", other.verb()),
        }
    }

    #[tokio::test]
    async fn heartbeat_with_new_ring_rehashes() {
        let fx = fixture();
        let before = fx.cluster.ring_signature();
        // Leader says beta is gone: everything becomes local.
        fx.cluster
            .handle_frame(
                NodeId::new("beta"),
                ClusterMsg::Heartbeat {
                    term: 2,
                    leader: NodeId::new("beta"),
                    signature: RingSignature(0),
                    nodes: vec![NodeId::new("alpha")],
                },
            )
            .await;
        assert_ne!(fx.cluster.ring_signature(), before);
        assert!(fx.cluster.node_for("grp0").is_none());
        assert!(fx.cluster.node_for("grp999").is_none());
        assert_eq!(fx.cluster.failover.lock().term(), 2);
        // The system topic now lives here and was re-created.
        assert!(fx.hub.get(SYS_TOPIC).is_some());
    }

    #[tokio::test]
    async fn wildcard_delivery_fans_out_through_the_proxy_topic() {
        let fx = fixture();
        // No local proxy topic exists: the delivery is dropped, not a panic.
        fx.cluster.handle_proxy_delivery(
            "grp7".into(),
            SessionId::wildcard(),
            ServerEnvelope::ctrl_ok(None, "grp7"),
        );
        // Unknown unicast target likewise.
        fx.cluster.handle_proxy_delivery(
            "grp7".into(),
            SessionId::new(),
            ServerEnvelope::ctrl_ok(None, "grp7"),
        );
    }
}

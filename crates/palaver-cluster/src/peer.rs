use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

use palaver_core::{EngineError, Fingerprint, NodeId};

use crate::proto::{self, ClusterMsg, PROTO_VERSION};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Peer lifecycle and traffic notifications, fanned into the cluster's
/// single event loop.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed on an outbound or inbound link.
    Connected { node: NodeId, fingerprint: Fingerprint },
    /// The outbound link dropped.
    Disconnected { node: NodeId },
    /// A decoded frame from the peer.
    Frame { node: NodeId, msg: ClusterMsg },
}

/// One configured cluster peer: a bounded outbound queue drained by a
/// dedicated dialer task that reconnects with randomized backoff. Sends
/// never block; a full queue or a dead link drops the frame.
pub struct Peer {
    pub node: NodeId,
    pub addr: String,
    tx: mpsc::Sender<ClusterMsg>,
    alive: AtomicBool,
    closing: AtomicBool,
    failures: AtomicU32,
    fingerprint: Mutex<Option<Fingerprint>>,
}

impl Peer {
    /// Create the peer and spawn its dialer task.
    pub fn connect(
        node: NodeId,
        addr: String,
        me: NodeId,
        fingerprint: Fingerprint,
        queue: usize,
        events: mpsc::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let (peer, rx) = Self::idle(node, addr, queue);
        tokio::spawn(Arc::clone(&peer).dial_loop(me, fingerprint, rx, events));
        peer
    }

    /// Peer with no dialer task. The caller owns the outbound receiver;
    /// used by tests to observe what the cluster would put on the wire.
    pub(crate) fn idle(
        node: NodeId,
        addr: String,
        queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ClusterMsg>) {
        let (tx, rx) = mpsc::channel(queue);
        (
            Arc::new(Self {
                node,
                addr,
                tx,
                alive: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                failures: AtomicU32::new(0),
                fingerprint: Mutex::new(None),
            }),
            rx,
        )
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Non-blocking enqueue toward the peer.
    pub fn try_send(&self, msg: ClusterMsg) -> Result<(), EngineError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(EngineError::NodeUnreachable(self.node.to_string()));
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull("peer"),
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::NodeUnreachable(self.node.to_string())
            }
        })
    }

    /// Record the peer's fingerprint; returns true when it changed,
    /// which means the peer process restarted.
    pub fn observe_fingerprint(&self, fp: &Fingerprint) -> bool {
        let mut slot = self.fingerprint.lock();
        let restarted = slot.as_ref().is_some_and(|old| old != fp);
        *slot = Some(fp.clone());
        restarted
    }

    async fn dial_loop(
        self: Arc<Self>,
        me: NodeId,
        fingerprint: Fingerprint,
        mut rx: mpsc::Receiver<ClusterMsg>,
        events: mpsc::Sender<PeerEvent>,
    ) {
        let mut backoff = BACKOFF_BASE;
        while !self.closing.load(Ordering::SeqCst) {
            match self.run_link(&me, &fingerprint, &mut rx, &events).await {
                Ok(()) => {
                    // Peer hung up cleanly; reconnect from the base interval.
                    backoff = BACKOFF_BASE;
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(peer = %self.node, error = %e, "peer link failed");
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
            if self.alive.swap(false, Ordering::SeqCst) {
                let _ = events.send(PeerEvent::Disconnected {
                    node: self.node.clone(),
                }).await;
            }
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..BACKOFF_BASE);
            sleep(backoff + jitter).await;
        }
    }

    /// One connection's lifetime: dial, handshake, then pump frames both
    /// ways until either side fails.
    async fn run_link(
        &self,
        me: &NodeId,
        fingerprint: &Fingerprint,
        rx: &mut mpsc::Receiver<ClusterMsg>,
        events: &mpsc::Sender<PeerEvent>,
    ) -> Result<(), EngineError> {
        let unreachable = |e: String| EngineError::NodeUnreachable(format!("{}: {e}", self.node));
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| unreachable("connect timeout".into()))?
            .map_err(|e| unreachable(e.to_string()))?;
        let mut framed = Framed::new(stream, proto::codec());

        let hello = ClusterMsg::Handshake {
            node: me.clone(),
            fingerprint: fingerprint.clone(),
            proto: PROTO_VERSION,
        };
        framed
            .send(proto::encode(&hello)?)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let first = framed
            .next()
            .await
            .ok_or_else(|| unreachable("closed during handshake".into()))?
            .map_err(|e| unreachable(e.to_string()))?;
        let (node, fp) = match proto::decode(&first)? {
            ClusterMsg::Handshake { node, fingerprint, proto } if proto == PROTO_VERSION => {
                (node, fingerprint)
            }
            ClusterMsg::Handshake { proto, .. } => {
                return Err(EngineError::Desync(format!(
                    "peer {} speaks protocol {proto}",
                    self.node
                )));
            }
            other => {
                return Err(EngineError::Desync(format!(
                    "expected handshake, got {}",
                    other.verb()
                )));
            }
        };
        if node != self.node {
            return Err(EngineError::Desync(format!(
                "dialed {} but reached {node}",
                self.node
            )));
        }

        self.alive.store(true, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        let _ = events
            .send(PeerEvent::Connected {
                node: node.clone(),
                fingerprint: fp,
            })
            .await;
        tracing::info!(peer = %self.node, addr = %self.addr, "peer link up");

        loop {
            tokio::select! {
                out = rx.recv() => {
                    let Some(msg) = out else { return Ok(()) };
                    framed
                        .send(proto::encode(&msg)?)
                        .await
                        .map_err(|e| unreachable(e.to_string()))?;
                }
                frame = framed.next() => {
                    let Some(frame) = frame else { return Ok(()) };
                    let frame = frame.map_err(|e| unreachable(e.to_string()))?;
                    let msg = match proto::decode(&frame) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!(peer = %self.node, error = %e, "dropping bad frame");
                            continue;
                        }
                    };
                    if events
                        .send(PeerEvent::Frame { node: self.node.clone(), msg })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Accept loop for inbound peer links. Inbound connections are
/// receive-only: replies travel over this node's own dialed link to the
/// sender, keeping exactly one outbound queue per peer.
pub async fn listen(
    listener: TcpListener,
    me: NodeId,
    fingerprint: Fingerprint,
    events: mpsc::Sender<PeerEvent>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "cluster accept failed");
                continue;
            }
        };
        tracing::debug!(%remote, "inbound peer connection");
        let events = events.clone();
        let me = me.clone();
        let fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_inbound(stream, me, fingerprint, events).await {
                tracing::debug!(%remote, error = %e, "inbound peer link closed");
            }
        });
    }
}

async fn serve_inbound(
    stream: TcpStream,
    me: NodeId,
    fingerprint: Fingerprint,
    events: mpsc::Sender<PeerEvent>,
) -> Result<(), EngineError> {
    let mut framed = Framed::new(stream, proto::codec());

    let first = timeout(CONNECT_TIMEOUT, framed.next())
        .await
        .map_err(|_| EngineError::Desync("handshake timeout".into()))?
        .ok_or_else(|| EngineError::Desync("closed during handshake".into()))?
        .map_err(|e| EngineError::Desync(e.to_string()))?;
    let node = match proto::decode(&first)? {
        ClusterMsg::Handshake { node, fingerprint: fp, proto } if proto == PROTO_VERSION => {
            let _ = events
                .send(PeerEvent::Connected {
                    node: node.clone(),
                    fingerprint: fp,
                })
                .await;
            node
        }
        other => {
            return Err(EngineError::Desync(format!(
                "expected handshake, got {}",
                other.verb()
            )));
        }
    };

    let hello = ClusterMsg::Handshake {
        node: me,
        fingerprint,
        proto: PROTO_VERSION,
    };
    framed
        .send(proto::encode(&hello)?)
        .await
        .map_err(|e| EngineError::NodeUnreachable(e.to_string()))?;

    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| EngineError::Desync(e.to_string()))?;
        let msg = match proto::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %node, error = %e, "dropping bad frame");
                continue;
            }
        };
        if events
            .send(PeerEvent::Frame { node: node.clone(), msg })
            .await
            .is_err()
        {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_reports_full_queue() {
        let (peer, _rx) = Peer::idle(NodeId::new("beta"), "127.0.0.1:0".into(), 1);
        assert!(peer.try_send(ping(&peer.node)).is_ok());
        assert!(matches!(
            peer.try_send(ping(&peer.node)),
            Err(EngineError::QueueFull("peer"))
        ));
    }

    #[test]
    fn fingerprint_change_means_restart() {
        let (peer, _rx) = Peer::idle(NodeId::new("beta"), "127.0.0.1:0".into(), 4);
        let first = Fingerprint::new();
        assert!(!peer.observe_fingerprint(&first), "first sighting");
        assert!(!peer.observe_fingerprint(&first), "unchanged");
        assert!(peer.observe_fingerprint(&Fingerprint::new()), "restarted");
    }

    #[test]
    fn stopped_peer_rejects_sends() {
        let (peer, _rx) = Peer::idle(NodeId::new("beta"), "127.0.0.1:0".into(), 4);
        peer.stop();
        assert!(matches!(
            peer.try_send(ping(&peer.node)),
            Err(EngineError::NodeUnreachable(_))
        ));
    }

    fn ping(node: &NodeId) -> ClusterMsg {
        ClusterMsg::Ping {
            node: node.clone(),
            fingerprint: Fingerprint::new(),
        }
    }

    #[tokio::test]
    async fn links_handshake_and_exchange_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (beta_events_tx, mut beta_events) = mpsc::channel(16);
        tokio::spawn(listen(
            listener,
            NodeId::new("beta"),
            Fingerprint::new(),
            beta_events_tx,
        ));

        let (alpha_events_tx, mut alpha_events) = mpsc::channel(16);
        let alpha_fp = Fingerprint::new();
        let peer = Peer::connect(
            NodeId::new("beta"),
            addr,
            NodeId::new("alpha"),
            alpha_fp.clone(),
            16,
            alpha_events_tx,
        );

        // Both sides observe the other's handshake.
        match beta_events.recv().await.unwrap() {
            PeerEvent::Connected { node, fingerprint } => {
                assert_eq!(node, NodeId::new("alpha"));
                assert_eq!(fingerprint, alpha_fp);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match alpha_events.recv().await.unwrap() {
            PeerEvent::Connected { node, .. } => assert_eq!(node, NodeId::new("beta")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(peer.is_alive());

        peer.try_send(ping(&NodeId::new("alpha"))).unwrap();
        match beta_events.recv().await.unwrap() {
            PeerEvent::Frame { node, msg } => {
                assert_eq!(node, NodeId::new("alpha"));
                assert_eq!(msg.verb(), "ping");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

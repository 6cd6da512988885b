use serde::{Deserialize, Serialize};

use palaver_core::{ClientEnvelope, EngineError, NodeId, ServerEnvelope, SessionId, UserId};

/// Seam between the engine and the cluster distribution layer.
///
/// A single-node deployment plugs in [`LocalRouter`]; the cluster crate
/// provides the real implementation. All methods are non-blocking: a
/// request that cannot be forwarded immediately is an error, never a stall.
pub trait RemoteRouter: Send + Sync {
    /// Node owning the topic, or `None` when this node is the owner.
    fn node_for(&self, topic: &str) -> Option<NodeId>;

    fn is_remote(&self, topic: &str) -> bool {
        self.node_for(topic).is_some()
    }

    /// Proxy→master: forward a client request to the topic's owner.
    fn forward(&self, fwd: ProxyForward) -> Result<(), EngineError>;

    /// Deliver a server envelope to the node hosting the target topic
    /// without attaching first.
    fn route(&self, env: ServerEnvelope) -> Result<(), EngineError>;
}

/// Router for a cluster of one: everything is local.
#[derive(Default)]
pub struct LocalRouter;

impl RemoteRouter for LocalRouter {
    fn node_for(&self, _topic: &str) -> Option<NodeId> {
        None
    }

    fn forward(&self, fwd: ProxyForward) -> Result<(), EngineError> {
        // Unreachable in practice: nothing is remote on a single node.
        tracing::debug!(topic = %fwd.topic, "dropping forward on single-node router");
        Ok(())
    }

    fn route(&self, env: ServerEnvelope) -> Result<(), EngineError> {
        tracing::debug!(topic = %env.topic, "dropping route on single-node router");
        Ok(())
    }
}

/// Request kinds carried by the proxy→master protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyReqKind {
    Join,
    Leave,
    Meta,
    /// `pub` and non-call `note` traffic.
    Broadcast,
    /// Session background/foreground flip.
    Background,
    /// Session user-agent change.
    UserAgent,
    /// Video-call signaling `note`.
    Call,
    /// The proxy topic is going away; tear down its multiplex sessions.
    Detach,
}

/// Compact description of the originating session, carried alongside a
/// forwarded request so the master can anchor a stand-in session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteSessionDesc {
    pub sid: SessionId,
    pub uid: UserId,
    pub user_agent: String,
    pub background: bool,
    /// Attached through a channel alias: anchor to the reader multiplex.
    pub is_channel: bool,
}

/// A proxy→master forwarded request.
#[derive(Clone, Debug)]
pub struct ProxyForward {
    pub req: ProxyReqKind,
    pub topic: String,
    pub env: Option<ClientEnvelope>,
    pub sess: RemoteSessionDesc,
}

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use palaver_core::{ClientEnvelope, EngineError, Fingerprint, NodeId, ServerEnvelope, SessionId};
use palaver_engine::{ProxyReqKind, RemoteSessionDesc};

use crate::ring::RingSignature;

/// Wire protocol version; bumped on incompatible frame changes.
pub const PROTO_VERSION: u16 = 1;

/// Upper bound on a single frame. A data message is capped well below
/// this by the transport layer, so anything larger is a broken peer.
pub const MAX_FRAME: usize = 1 << 20;

/// One intra-cluster frame. JSON inside a length-delimited envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum ClusterMsg {
    /// First frame on every connection, both directions.
    Handshake {
        node: NodeId,
        fingerprint: Fingerprint,
        proto: u16,
    },
    /// Proxy→master: a client request forwarded to the topic's owner.
    TopicMaster {
        node: NodeId,
        fingerprint: Fingerprint,
        signature: RingSignature,
        req: ProxyReqKind,
        topic: String,
        env: Option<ClientEnvelope>,
        sess: RemoteSessionDesc,
    },
    /// Master→proxy: fire-and-forget delivery of a server envelope,
    /// addressed to the originating session or to the wildcard id for
    /// broadcasts.
    TopicProxy {
        topic: String,
        sid: SessionId,
        env: ServerEnvelope,
    },
    /// Deliver a server envelope to whichever node hosts `env.topic`,
    /// no attachment required.
    Route { env: ServerEnvelope },
    /// Liveness and restart detection.
    Ping { node: NodeId, fingerprint: Fingerprint },
    /// Candidate requesting a vote for `term`.
    Vote { term: u64, candidate: NodeId },
    /// Reply to a vote request.
    Ballot {
        term: u64,
        node: NodeId,
        granted: bool,
    },
    /// Leader liveness plus the authoritative ring.
    Heartbeat {
        term: u64,
        leader: NodeId,
        signature: RingSignature,
        nodes: Vec<NodeId>,
    },
}

impl ClusterMsg {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::TopicMaster { .. } => "topic_master",
            Self::TopicProxy { .. } => "topic_proxy",
            Self::Route { .. } => "route",
            Self::Ping { .. } => "ping",
            Self::Vote { .. } => "vote",
            Self::Ballot { .. } => "ballot",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Codec for peer links: 4-byte big-endian length prefix.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

pub fn encode(msg: &ClusterMsg) -> Result<Bytes, EngineError> {
    serde_json::to_vec(msg)
        .map(Bytes::from)
        .map_err(|e| EngineError::Malformed(format!("encode {}: {e}", msg.verb())))
}

pub fn decode(frame: &[u8]) -> Result<ClusterMsg, EngineError> {
    serde_json::from_slice(frame).map_err(|e| EngineError::Malformed(format!("bad frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_core::UserId;

    #[test]
    fn heartbeat_carries_term_and_ring() {
        let msg = ClusterMsg::Heartbeat {
            term: 3,
            leader: NodeId::new("alpha"),
            signature: RingSignature(0xdead_beef),
            nodes: vec![NodeId::new("alpha"), NodeId::new("beta")],
        };
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        match decoded {
            ClusterMsg::Heartbeat {
                term,
                leader,
                signature,
                nodes,
            } => {
                assert_eq!(term, 3);
                assert_eq!(leader, NodeId::new("alpha"));
                assert_eq!(signature, RingSignature(0xdead_beef));
                assert_eq!(nodes.len(), 2);
            }
            other => panic!("decoded wrong verb: {}", other.verb()),
        }
    }

    #[test]
    fn forwarded_request_keeps_session_identity() {
        let sid = SessionId::new();
        let msg = ClusterMsg::TopicMaster {
            node: NodeId::new("beta"),
            fingerprint: Fingerprint::new(),
            signature: RingSignature(7),
            req: ProxyReqKind::Join,
            topic: "grp9".into(),
            env: None,
            sess: RemoteSessionDesc {
                sid: sid.clone(),
                uid: UserId(4),
                user_agent: "cli/1".into(),
                background: false,
                is_channel: true,
            },
        };
        match decode(&encode(&msg).unwrap()).unwrap() {
            ClusterMsg::TopicMaster { sess, req, .. } => {
                assert_eq!(sess.sid, sid);
                assert_eq!(sess.uid, UserId(4));
                assert!(sess.is_channel);
                assert_eq!(req, ProxyReqKind::Join);
            }
            other => panic!("decoded wrong verb: {}", other.verb()),
        }
    }

    #[test]
    fn garbage_is_rejected_not_panicked() {
        assert!(decode(b"{not json").is_err());
        assert!(decode(b"{\"verb\":\"no_such\"}").is_err());
    }
}

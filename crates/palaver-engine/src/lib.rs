//! The topic actor engine: sessions, topics, and the hub registry.
//!
//! Every topic runs as a single-writer actor over bounded mailboxes; the
//! hub and the session store are the only two shared maps, both guarded by
//! concurrent containers. All cross-worker communication is
//! try_send-or-drop: a full queue never blocks the producer.

pub mod call;
pub mod hub;
pub mod router;
pub mod session;
pub mod sessions;
pub mod topic;

pub use hub::{Hub, HubCmd};
pub use router::{LocalRouter, ProxyForward, ProxyReqKind, RemoteRouter, RemoteSessionDesc};
pub use session::{Session, SessionKind};
pub use sessions::SessionStore;
pub use topic::{ExitReason, JoinRequest, LeaveNotice, SessionUpdate, TopicCtrl, TopicHandle};

use std::time::Duration;

/// Tunables shared by topics and sessions.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Per-session outbound queue capacity; a full queue evicts the session.
    pub send_queue: usize,
    /// Capacity of each topic mailbox.
    pub topic_queue: usize,
    /// How long an empty topic lingers before unregistering itself.
    pub idle_kill: Duration,
    /// How long an unanswered call rings before being force-terminated.
    pub call_timeout: Duration,
    /// Protocol version accepted in the `hi` handshake.
    pub proto_version: &'static str,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_queue: 128,
            topic_queue: 64,
            idle_kill: Duration::from_secs(15 * 60),
            call_timeout: Duration::from_secs(30),
            proto_version: "0.1",
        }
    }
}

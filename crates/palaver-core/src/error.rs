/// Typed error hierarchy for the messaging engine.
/// Classifies errors as protocol (reply to the client), desynchronization
/// (tear down and resync the cluster link), resource exhaustion (drop the
/// offending request or session), or adapter failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    // Protocol — coded reply to the originating session, never fatal
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("permission denied")]
    PermissionDenied,
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("not attached to topic: {0}")]
    NotAttached(String),
    #[error("already attached to topic: {0}")]
    AlreadyAttached(String),
    #[error("topic locked: {0}")]
    Locked(String),
    #[error("version not supported: {0}")]
    VersionNotSupported(String),

    // Desynchronization — tear down and resync the affected cluster link
    #[error("cluster desync: {0}")]
    Desync(String),
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    // Resource exhaustion — drop locally, preserve liveness
    #[error("queue full: {0}")]
    QueueFull(&'static str),
    #[error("session terminated")]
    SessionGone,

    // Adapter failures — internal-error reply, state unchanged
    #[error("storage failure: {0}")]
    Store(String),

    #[error("shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_)
                | Self::AuthRequired
                | Self::PermissionDenied
                | Self::TopicNotFound(_)
                | Self::NotAttached(_)
                | Self::AlreadyAttached(_)
                | Self::Locked(_)
                | Self::VersionNotSupported(_)
        )
    }

    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Desync(_) | Self::NodeUnreachable(_))
    }

    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::QueueFull(_) | Self::SessionGone)
    }

    /// HTTP-style code carried in the `ctrl` reply to the client.
    pub fn ctrl_code(&self) -> u16 {
        match self {
            Self::Malformed(_) => 400,
            Self::AuthRequired => 401,
            Self::PermissionDenied => 403,
            Self::TopicNotFound(_) | Self::NotAttached(_) => 404,
            Self::AlreadyAttached(_) => 409,
            Self::Locked(_) => 423,
            Self::VersionNotSupported(_) => 505,
            Self::Desync(_) | Self::NodeUnreachable(_) => 502,
            Self::QueueFull(_) => 503,
            Self::SessionGone => 503,
            Self::Store(_) => 500,
            Self::ShuttingDown => 503,
        }
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::AuthRequired => "auth_required",
            Self::PermissionDenied => "permission_denied",
            Self::TopicNotFound(_) => "topic_not_found",
            Self::NotAttached(_) => "not_attached",
            Self::AlreadyAttached(_) => "already_attached",
            Self::Locked(_) => "locked",
            Self::VersionNotSupported(_) => "version_not_supported",
            Self::Desync(_) => "desync",
            Self::NodeUnreachable(_) => "node_unreachable",
            Self::QueueFull(_) => "queue_full",
            Self::SessionGone => "session_gone",
            Self::Store(_) => "store",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

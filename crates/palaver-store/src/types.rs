use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use palaver_core::envelope::DefaultAccess;
use palaver_core::{AccessMode, UserId};

/// Persisted state of a topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicRecord {
    pub name: String,
    pub owner: UserId,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Highest assigned message sequence id.
    pub seq: u32,
    pub public: Option<Value>,
    pub default_access: DefaultAccess,
}

impl TopicRecord {
    pub fn new(name: impl Into<String>, owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            owner,
            created: now,
            updated: now,
            seq: 0,
            public: None,
            default_access: DefaultAccess::default(),
        }
    }
}

/// Persisted subscriber relationship to a topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub user: UserId,
    pub want: AccessMode,
    pub given: AccessMode,
    pub recv_seq: u32,
    pub read_seq: u32,
    pub private: Option<Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn new(topic: impl Into<String>, user: UserId, want: AccessMode, given: AccessMode) -> Self {
        let now = Utc::now();
        Self {
            topic: topic.into(),
            user,
            want,
            given,
            recv_seq: 0,
            read_seq: 0,
            private: None,
            created: now,
            updated: now,
        }
    }

    pub fn effective(&self) -> AccessMode {
        self.want & self.given
    }
}

/// Partial update applied to a subscription.
#[derive(Clone, Debug, Default)]
pub struct SubUpdate {
    pub want: Option<AccessMode>,
    pub given: Option<AccessMode>,
    pub recv_seq: Option<u32>,
    pub read_seq: Option<u32>,
    pub private: Option<Value>,
}

/// Persisted message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub topic: String,
    pub seq: u32,
    pub from: UserId,
    pub head: Option<Value>,
    pub content: Value,
    pub ts: DateTime<Utc>,
}

/// Persisted user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub public: Option<Value>,
    pub default_access: DefaultAccess,
    pub last_seen: Option<DateTime<Utc>>,
    pub user_agent: String,
}

impl UserRecord {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            public: None,
            default_access: DefaultAccess::default(),
            last_seen: None,
            user_agent: String::new(),
        }
    }
}

/// Result of authenticating a secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthCtx {
    pub uid: UserId,
    pub level: AuthLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    Anon,
    Auth,
    Root,
}

/// Delivery metadata handed to the push collaborator after a broadcast.
#[derive(Clone, Debug)]
pub struct PushReceipt {
    pub topic: String,
    pub from: UserId,
    pub seq: u32,
    pub content: Value,
    pub recipients: Vec<PushRecipient>,
}

#[derive(Clone, Debug)]
pub struct PushRecipient {
    pub user: UserId,
    /// True when the user had no online session at broadcast time.
    pub offline: bool,
}

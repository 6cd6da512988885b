//! Storage, auth and push collaborator contracts for the messaging engine,
//! plus the in-memory reference adapter used by tests and single-node runs.
//!
//! Writes return the assigned/updated timestamps; "not found" is a
//! distinguished error kind, never a zero value. All implementations must
//! tolerate concurrent invocation from many topic actors.

pub mod error;
pub mod memory;
pub mod types;

pub use error::StoreError;
pub use memory::{MemoryPush, MemoryStore, QueuedPush, TrivialAuth};
pub use types::{
    AuthCtx, AuthLevel, MessageRecord, PushReceipt, PushRecipient, SubUpdate, SubscriptionRecord,
    TopicRecord, UserRecord,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use palaver_core::envelope::DefaultAccess;
use palaver_core::{AccessMode, TopicCategory, UserId};

#[async_trait]
pub trait Store: Send + Sync {
    // Topics
    async fn topic_create(&self, rec: TopicRecord) -> Result<(), StoreError>;
    async fn topic_get(&self, name: &str) -> Result<TopicRecord, StoreError>;
    async fn topic_update_desc(
        &self,
        name: &str,
        public: Option<Value>,
        default_access: Option<DefaultAccess>,
    ) -> Result<DateTime<Utc>, StoreError>;
    async fn topic_delete(&self, name: &str, hard: bool) -> Result<(), StoreError>;

    // Subscriptions
    async fn sub_create(&self, rec: SubscriptionRecord) -> Result<(), StoreError>;
    async fn sub_get(&self, topic: &str, user: UserId) -> Result<SubscriptionRecord, StoreError>;
    async fn subs_for_topic(&self, topic: &str) -> Result<Vec<SubscriptionRecord>, StoreError>;
    async fn subs_for_user(&self, user: UserId) -> Result<Vec<SubscriptionRecord>, StoreError>;
    async fn sub_update(
        &self,
        topic: &str,
        user: UserId,
        upd: SubUpdate,
    ) -> Result<DateTime<Utc>, StoreError>;
    async fn sub_delete(&self, topic: &str, user: UserId) -> Result<(), StoreError>;

    // Messages
    async fn message_save(&self, rec: MessageRecord) -> Result<DateTime<Utc>, StoreError>;
    async fn messages_get(
        &self,
        topic: &str,
        since: u32,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;
    async fn messages_delete_list(&self, topic: &str, seqs: &[u32]) -> Result<(), StoreError>;

    // Users
    async fn user_get(&self, uid: UserId) -> Result<UserRecord, StoreError>;
    /// Update a user's profile; `None` fields are left untouched.
    async fn user_update(
        &self,
        uid: UserId,
        public: Option<Value>,
        default_access: Option<DefaultAccess>,
    ) -> Result<(), StoreError>;
    async fn user_update_last_seen(
        &self,
        uid: UserId,
        when: DateTime<Utc>,
        user_agent: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Auth: Send + Sync {
    /// Resolve a secret to an authenticated user and access level.
    async fn authenticate(&self, scheme: &str, secret: &str) -> Result<AuthCtx, StoreError>;

    /// Default access mode granted to `uid` when joining a topic of the
    /// given category without an explicit grant.
    async fn default_access(&self, uid: UserId, category: TopicCategory) -> AccessMode;
}

/// Push-notification collaborator. Fire-and-forget: implementations drop
/// the receipt silently when their intake queue is full.
pub trait Push: Send + Sync {
    fn push(&self, receipt: PushReceipt);
}

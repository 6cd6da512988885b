use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;

use palaver_core::envelope::DefaultAccess;
use palaver_core::{AccessMode, TopicCategory, UserId};

use crate::error::StoreError;
use crate::types::{
    AuthCtx, AuthLevel, MessageRecord, PushReceipt, SubUpdate, SubscriptionRecord, TopicRecord,
    UserRecord,
};
use crate::{Auth, Push, Store};

#[derive(Default)]
struct Inner {
    topics: HashMap<String, TopicRecord>,
    subs: HashMap<(String, UserId), SubscriptionRecord>,
    messages: HashMap<String, Vec<MessageRecord>>,
    users: HashMap<UserId, UserRecord>,
}

/// In-memory store adapter. Reference backend for tests and the
/// single-node default; data does not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Test hook: when set, the next write fails with a backend error.
    fail_next_write: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write operation fail. Used to exercise adapter-error
    /// paths without a real backend.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn check_poison(&self) -> Result<(), StoreError> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        Ok(())
    }

    /// Ensure a user row exists; test convenience.
    pub fn seed_user(&self, uid: UserId) {
        let mut inner = self.inner.write();
        inner.users.entry(uid).or_insert_with(|| UserRecord::new(uid));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn topic_create(&self, rec: TopicRecord) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        if inner.topics.contains_key(&rec.name) {
            return Err(StoreError::Conflict(format!("topic {} exists", rec.name)));
        }
        inner.topics.insert(rec.name.clone(), rec);
        Ok(())
    }

    async fn topic_get(&self, name: &str) -> Result<TopicRecord, StoreError> {
        self.inner
            .read()
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("topic {name}")))
    }

    async fn topic_update_desc(
        &self,
        name: &str,
        public: Option<Value>,
        default_access: Option<DefaultAccess>,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        let rec = inner
            .topics
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("topic {name}")))?;
        if let Some(public) = public {
            rec.public = Some(public);
        }
        if let Some(da) = default_access {
            rec.default_access = da;
        }
        rec.updated = Utc::now();
        Ok(rec.updated)
    }

    async fn topic_delete(&self, name: &str, _hard: bool) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        if inner.topics.remove(name).is_none() {
            return Err(StoreError::NotFound(format!("topic {name}")));
        }
        inner.subs.retain(|(topic, _), _| topic != name);
        inner.messages.remove(name);
        Ok(())
    }

    async fn sub_create(&self, rec: SubscriptionRecord) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        inner.subs.insert((rec.topic.clone(), rec.user), rec);
        Ok(())
    }

    async fn sub_get(&self, topic: &str, user: UserId) -> Result<SubscriptionRecord, StoreError> {
        self.inner
            .read()
            .subs
            .get(&(topic.to_string(), user))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("sub {topic}/{user}")))
    }

    async fn subs_for_topic(&self, topic: &str) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .subs
            .values()
            .filter(|s| s.topic == topic)
            .cloned()
            .collect())
    }

    async fn subs_for_user(&self, user: UserId) -> Result<Vec<SubscriptionRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .subs
            .values()
            .filter(|s| s.user == user)
            .cloned()
            .collect())
    }

    async fn sub_update(
        &self,
        topic: &str,
        user: UserId,
        upd: SubUpdate,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        let rec = inner
            .subs
            .get_mut(&(topic.to_string(), user))
            .ok_or_else(|| StoreError::NotFound(format!("sub {topic}/{user}")))?;
        if let Some(want) = upd.want {
            rec.want = want;
        }
        if let Some(given) = upd.given {
            rec.given = given;
        }
        if let Some(recv) = upd.recv_seq {
            rec.recv_seq = rec.recv_seq.max(recv);
        }
        if let Some(read) = upd.read_seq {
            rec.read_seq = rec.read_seq.max(read);
        }
        if let Some(private) = upd.private {
            rec.private = Some(private);
        }
        rec.updated = Utc::now();
        Ok(rec.updated)
    }

    async fn sub_delete(&self, topic: &str, user: UserId) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        inner
            .subs
            .remove(&(topic.to_string(), user))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("sub {topic}/{user}")))
    }

    async fn message_save(&self, rec: MessageRecord) -> Result<DateTime<Utc>, StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        let ts = rec.ts;
        if let Some(topic) = inner.topics.get_mut(&rec.topic) {
            topic.seq = topic.seq.max(rec.seq);
            topic.updated = ts;
        }
        inner.messages.entry(rec.topic.clone()).or_default().push(rec);
        Ok(ts)
    }

    async fn messages_get(
        &self,
        topic: &str,
        since: u32,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.inner.read();
        let mut msgs: Vec<MessageRecord> = inner
            .messages
            .get(topic)
            .map(|v| v.iter().filter(|m| m.seq > since).cloned().collect())
            .unwrap_or_default();
        msgs.sort_by_key(|m| m.seq);
        msgs.truncate(limit);
        Ok(msgs)
    }

    async fn messages_delete_list(&self, topic: &str, seqs: &[u32]) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        if let Some(msgs) = inner.messages.get_mut(topic) {
            msgs.retain(|m| !seqs.contains(&m.seq));
        }
        Ok(())
    }

    async fn user_get(&self, uid: UserId) -> Result<UserRecord, StoreError> {
        self.inner
            .read()
            .users
            .get(&uid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {uid}")))
    }

    async fn user_update(
        &self,
        uid: UserId,
        public: Option<Value>,
        default_access: Option<DefaultAccess>,
    ) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        let rec = inner.users.entry(uid).or_insert_with(|| UserRecord::new(uid));
        if let Some(public) = public {
            rec.public = Some(public);
        }
        if let Some(da) = default_access {
            rec.default_access = da;
        }
        Ok(())
    }

    async fn user_update_last_seen(
        &self,
        uid: UserId,
        when: DateTime<Utc>,
        user_agent: &str,
    ) -> Result<(), StoreError> {
        self.check_poison()?;
        let mut inner = self.inner.write();
        let rec = inner.users.entry(uid).or_insert_with(|| UserRecord::new(uid));
        rec.last_seen = Some(when);
        if !user_agent.is_empty() {
            rec.user_agent = user_agent.to_string();
        }
        Ok(())
    }
}

/// Development authenticator: scheme "basic", secret is the numeric user
/// id (optionally prefixed "usr"). Real schemes plug in behind the trait.
#[derive(Default)]
pub struct TrivialAuth;

#[async_trait]
impl Auth for TrivialAuth {
    async fn authenticate(&self, scheme: &str, secret: &str) -> Result<AuthCtx, StoreError> {
        if scheme != "basic" {
            return Err(StoreError::CredentialsRejected);
        }
        let uid: UserId = secret.parse().map_err(|_| StoreError::CredentialsRejected)?;
        if uid.is_none() {
            return Err(StoreError::CredentialsRejected);
        }
        Ok(AuthCtx {
            uid,
            level: AuthLevel::Auth,
        })
    }

    async fn default_access(&self, _uid: UserId, category: TopicCategory) -> AccessMode {
        match category {
            TopicCategory::Me | TopicCategory::Fnd => AccessMode::FULL,
            TopicCategory::P2P => AccessMode::P2P,
            TopicCategory::Group => AccessMode::AUTH_GROUP,
            TopicCategory::System => AccessMode::JOIN | AccessMode::READ,
        }
    }
}

/// Push adapter backed by a bounded intake queue. The provider drains the
/// receiver; a full queue drops the receipt.
pub struct QueuedPush {
    tx: mpsc::Sender<PushReceipt>,
}

impl QueuedPush {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PushReceipt>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Push for QueuedPush {
    fn push(&self, receipt: PushReceipt) {
        if let Err(mpsc::error::TrySendError::Full(r)) = self.tx.try_send(receipt) {
            tracing::debug!(topic = %r.topic, seq = r.seq, "push intake full, receipt dropped");
        }
    }
}

/// Test push adapter that records every receipt.
#[derive(Default)]
pub struct MemoryPush {
    receipts: Mutex<Vec<PushReceipt>>,
}

impl MemoryPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipts(&self) -> Vec<PushReceipt> {
        self.receipts.lock().clone()
    }
}

impl Push for MemoryPush {
    fn push(&self, receipt: PushReceipt) {
        self.receipts.lock().push(receipt);
    }
}

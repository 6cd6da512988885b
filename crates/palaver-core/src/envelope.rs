use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::AccessMode;
use crate::error::EngineError;
use crate::ids::{SessionId, UserId};

/// One decoded inbound client request.
///
/// The wire form is the `payload` alone; routing fields are attached by the
/// session when the request is accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub payload: ClientPayload,
    /// Canonical topic name used for registry lookup and ring hashing.
    pub topic: String,
    /// The name as the client gave it; echoed back in replies.
    pub original: String,
    /// Authenticated user the request acts for.
    pub from: UserId,
    /// Originating session.
    pub sid: SessionId,
    pub received: DateTime<Utc>,
}

impl ClientEnvelope {
    pub fn new(payload: ClientPayload, sid: SessionId, from: UserId) -> Self {
        Self {
            payload,
            topic: String::new(),
            original: String::new(),
            from,
            sid,
            received: Utc::now(),
        }
    }

    /// Client-supplied request id, if the payload kind carries one.
    pub fn id(&self) -> Option<&str> {
        self.payload.id()
    }

    /// The topic name the client addressed, before routing.
    pub fn client_topic(&self) -> Option<&str> {
        self.payload.topic()
    }
}

/// One-of request payload; exactly one kind per envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClientPayload {
    Hi(ClientHi),
    Acc(ClientAcc),
    Login(ClientLogin),
    Sub(ClientSub),
    Leave(ClientLeave),
    Pub(ClientPub),
    Get(ClientGet),
    Set(ClientSet),
    Del(ClientDel),
    Note(ClientNote),
}

impl ClientPayload {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Hi(p) => p.id.as_deref(),
            Self::Acc(p) => p.id.as_deref(),
            Self::Login(p) => p.id.as_deref(),
            Self::Sub(p) => p.id.as_deref(),
            Self::Leave(p) => p.id.as_deref(),
            Self::Pub(p) => p.id.as_deref(),
            Self::Get(p) => p.id.as_deref(),
            Self::Set(p) => p.id.as_deref(),
            Self::Del(p) => p.id.as_deref(),
            Self::Note(_) => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Hi(_) | Self::Acc(_) | Self::Login(_) => None,
            Self::Sub(p) => Some(&p.topic),
            Self::Leave(p) => Some(&p.topic),
            Self::Pub(p) => Some(&p.topic),
            Self::Get(p) => Some(&p.topic),
            Self::Set(p) => Some(&p.topic),
            Self::Del(p) => Some(&p.topic),
            Self::Note(p) => Some(&p.topic),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hi(_) => "hi",
            Self::Acc(_) => "acc",
            Self::Login(_) => "login",
            Self::Sub(_) => "sub",
            Self::Leave(_) => "leave",
            Self::Pub(_) => "pub",
            Self::Get(_) => "get",
            Self::Set(_) => "set",
            Self::Del(_) => "del",
            Self::Note(_) => "note",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientHi {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ver: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub background: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientAcc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// User being updated; `None` means the authenticated user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_access: Option<DefaultAccess>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientLogin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub scheme: String,
    pub secret: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientSub {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    /// Requested (want) access mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AccessMode>,
    #[serde(default)]
    pub get_desc: bool,
    #[serde(default)]
    pub get_sub: bool,
    #[serde(default)]
    pub background: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientLeave {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    /// True drops the subscription entirely; false only detaches.
    #[serde(default)]
    pub unsub: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientPub {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    /// Skip the originating session when broadcasting.
    #[serde(default)]
    pub no_echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Value>,
    pub content: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientGet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    pub what: MetaWhat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<SetDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SetSub>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientDel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    pub what: DelWhat,
    /// Subscriber being removed on `what = sub`; `None` means the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    #[serde(default)]
    pub hard: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seq_list: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientNote {
    pub topic: String,
    pub what: NoteWhat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// Present only for `what = call`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<CallEvent>,
    /// SDP / ICE payload for call events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaWhat {
    Desc,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelWhat {
    Topic,
    Sub,
    Msg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteWhat {
    /// Keypress (typing) notification.
    Kp,
    /// Message received by the client.
    Recv,
    /// Message read by the user.
    Read,
    /// Video/audio call signaling event.
    Call,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEvent {
    Invite,
    Ringing,
    Accept,
    Offer,
    Answer,
    IceCandidate,
    HangUp,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_access: Option<DefaultAccess>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetSub {
    /// Subscriber whose mode is updated; `None` updates the caller's want.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    pub mode: AccessMode,
}

/// Default access granted to authenticated and anonymous subscribers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

impl Default for DefaultAccess {
    fn default() -> Self {
        Self {
            auth: AccessMode::AUTH_GROUP,
            anon: AccessMode::NONE,
        }
    }
}

// --- Server side ---

/// One outbound response or broadcast.
///
/// `ctrl` is unicast to the originating session; `data`/`pres`/`info` are
/// topic broadcasts narrowed by `filters`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub payload: ServerPayload,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "RecipientFilter::is_empty")]
    pub filters: RecipientFilter,
}

/// Per-broadcast recipient narrowing. Travels with the envelope so a proxy
/// node can re-apply it during local fan-out.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecipientFilter {
    /// Session that must not receive the broadcast (no-echo).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_sid: Option<SessionId>,
    /// Deliver only to this user's sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_user: Option<UserId>,
    /// Deliver to everyone except this user's sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_user: Option<UserId>,
}

impl RecipientFilter {
    pub fn is_empty(&self) -> bool {
        self.skip_sid.is_none() && self.single_user.is_none() && self.exclude_user.is_none()
    }

    /// Whether a recipient session passes the filter.
    pub fn admits(&self, sid: &SessionId, uid: UserId) -> bool {
        if self.skip_sid.as_ref() == Some(sid) {
            return false;
        }
        if let Some(only) = self.single_user {
            if uid != only {
                return false;
            }
        }
        if let Some(not) = self.exclude_user {
            if uid == not {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerPayload {
    Ctrl(Ctrl),
    Data(Data),
    Meta(Meta),
    Pres(Pres),
    Info(Info),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ctrl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub code: u16,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Data {
    pub from: UserId,
    pub seq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Value>,
    pub content: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<TopicDesc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<Vec<SubEntry>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pres {
    pub what: PresWhat,
    /// Topic the event is about, as the recipient knows it.
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// New effective mode on `what = acs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AccessMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresWhat {
    /// User came online in the topic.
    On,
    /// User's last session in the topic went away.
    Off,
    /// User unsubscribed or was removed; no further updates.
    Gone,
    /// Access mode changed.
    Acs,
    /// User-agent changed.
    Ua,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Info {
    pub what: NoteWhat,
    pub from: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<CallEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopicDesc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    pub seq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_access: Option<DefaultAccess>,
    /// Caller's own want/given pair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<ModePair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModePair {
    pub want: AccessMode,
    pub given: AccessMode,
}

impl ModePair {
    pub fn effective(&self) -> AccessMode {
        self.want & self.given
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubEntry {
    pub user: UserId,
    pub mode: ModePair,
    pub online: bool,
    pub read_seq: u32,
    pub recv_seq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<Value>,
}

impl ServerEnvelope {
    pub fn new(payload: ServerPayload, topic: impl Into<String>) -> Self {
        Self {
            payload,
            topic: topic.into(),
            timestamp: Utc::now(),
            filters: RecipientFilter::default(),
        }
    }

    pub fn ctrl(id: Option<String>, topic: impl Into<String>, code: u16, text: &str) -> Self {
        Self::new(
            ServerPayload::Ctrl(Ctrl {
                id,
                code,
                text: text.to_string(),
                params: None,
            }),
            topic,
        )
    }

    pub fn ctrl_ok(id: Option<String>, topic: impl Into<String>) -> Self {
        Self::ctrl(id, topic, 200, "ok")
    }

    pub fn ctrl_accepted(id: Option<String>, topic: impl Into<String>, params: Value) -> Self {
        let mut env = Self::ctrl(id, topic, 202, "accepted");
        if let ServerPayload::Ctrl(c) = &mut env.payload {
            c.params = Some(params);
        }
        env
    }

    pub fn ctrl_err(id: Option<String>, topic: impl Into<String>, err: &EngineError) -> Self {
        Self::ctrl(id, topic, err.ctrl_code(), &err.to_string())
    }

    pub fn data(
        topic: impl Into<String>,
        from: UserId,
        seq: u32,
        head: Option<Value>,
        content: Value,
    ) -> Self {
        Self::new(ServerPayload::Data(Data { from, seq, head, content }), topic)
    }

    pub fn pres(topic: impl Into<String>, what: PresWhat, user: UserId) -> Self {
        let topic = topic.into();
        Self::new(
            ServerPayload::Pres(Pres {
                what,
                src: topic.clone(),
                user: Some(user),
                user_agent: None,
                seq: None,
                mode: None,
            }),
            topic,
        )
    }

    pub fn info(topic: impl Into<String>, note: &ClientNote, from: UserId) -> Self {
        Self::new(
            ServerPayload::Info(Info {
                what: note.what,
                from,
                seq: note.seq,
                event: note.event,
                payload: note.payload.clone(),
            }),
            topic,
        )
    }

    pub fn skip_session(mut self, sid: SessionId) -> Self {
        self.filters.skip_sid = Some(sid);
        self
    }

    pub fn only_user(mut self, uid: UserId) -> Self {
        self.filters.single_user = Some(uid);
        self
    }

    pub fn except_user(mut self, uid: UserId) -> Self {
        self.filters.exclude_user = Some(uid);
        self
    }

    /// Whether this envelope is a broadcast (as opposed to a unicast reply).
    pub fn is_broadcast(&self) -> bool {
        !matches!(self.payload, ServerPayload::Ctrl(_) | ServerPayload::Meta(_))
    }

    pub fn ctrl_code(&self) -> Option<u16> {
        match &self.payload {
            ServerPayload::Ctrl(c) => Some(c.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_payload_is_one_of() {
        let json = r#"{"kind":"pub","topic":"grp1","content":"hi"}"#;
        let payload: ClientPayload = serde_json::from_str(json).unwrap();
        match &payload {
            ClientPayload::Pub(p) => {
                assert_eq!(p.topic, "grp1");
                assert!(!p.no_echo);
            }
            other => panic!("wrong kind: {other:?}"),
        }
        assert_eq!(payload.kind(), "pub");
        assert_eq!(payload.topic(), Some("grp1"));
    }

    #[test]
    fn unknown_kind_rejected() {
        let json = r#"{"kind":"shout","topic":"grp1"}"#;
        assert!(serde_json::from_str::<ClientPayload>(json).is_err());
    }

    #[test]
    fn hi_has_no_topic() {
        let json = r#"{"kind":"hi","ver":"0.1","user_agent":"test/1"}"#;
        let payload: ClientPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.topic(), None);
    }

    #[test]
    fn ctrl_is_not_broadcast() {
        let env = ServerEnvelope::ctrl_ok(Some("1".into()), "grp1");
        assert!(!env.is_broadcast());
        assert_eq!(env.ctrl_code(), Some(200));
    }

    #[test]
    fn data_is_broadcast() {
        let env = ServerEnvelope::data("grp1", UserId(1), 5, None, "hi".into());
        assert!(env.is_broadcast());
    }

    #[test]
    fn filter_skip_session() {
        let sid = SessionId::new();
        let other = SessionId::new();
        let env = ServerEnvelope::data("grp1", UserId(1), 1, None, "x".into())
            .skip_session(sid.clone());
        assert!(!env.filters.admits(&sid, UserId(2)));
        assert!(env.filters.admits(&other, UserId(2)));
    }

    #[test]
    fn filter_single_and_exclude_user() {
        let sid = SessionId::new();
        let only = RecipientFilter {
            single_user: Some(UserId(3)),
            ..Default::default()
        };
        assert!(only.admits(&sid, UserId(3)));
        assert!(!only.admits(&sid, UserId(4)));

        let except = RecipientFilter {
            exclude_user: Some(UserId(3)),
            ..Default::default()
        };
        assert!(!except.admits(&sid, UserId(3)));
        assert!(except.admits(&sid, UserId(4)));
    }

    #[test]
    fn filters_not_serialized_when_empty() {
        let env = ServerEnvelope::ctrl_ok(None, "grp1");
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("filters"));
    }

    #[test]
    fn filters_survive_serialization() {
        let env = ServerEnvelope::data("grp1", UserId(1), 1, None, "x".into())
            .except_user(UserId(9));
        let json = serde_json::to_string(&env).unwrap();
        let back: ServerEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.filters.exclude_user, Some(UserId(9)));
    }

    #[test]
    fn ctrl_err_maps_code() {
        let env = ServerEnvelope::ctrl_err(None, "grp1", &EngineError::PermissionDenied);
        assert_eq!(env.ctrl_code(), Some(403));
    }
}

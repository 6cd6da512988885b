use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ids::UserId;

/// What kind of communication channel a topic is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCategory {
    /// Per-user control channel ("me").
    Me,
    /// Discovery channel ("fnd").
    Fnd,
    /// One-to-one chat between exactly two users.
    P2P,
    /// Group chat; channels are groups with an extra read-only audience.
    Group,
    /// Cluster-wide system channel.
    System,
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopicCategory::Me => "me",
            TopicCategory::Fnd => "fnd",
            TopicCategory::P2P => "p2p",
            TopicCategory::Group => "grp",
            TopicCategory::System => "sys",
        };
        f.write_str(s)
    }
}

/// A client-supplied topic name resolved to its routable form.
///
/// Clients address topics by aliases ("me", "usr123" for a 1:1 chat); the
/// server routes on a canonical name that is stable across both users and
/// all cluster nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedName {
    /// Canonical name used for registry lookup and ring hashing.
    pub name: String,
    /// The name the client used; echoed back in responses.
    pub original: String,
    pub category: TopicCategory,
    /// True when the client attached through the channel alias ("chn...").
    pub is_channel: bool,
}

/// Resolve a client-given topic name for the given authenticated user.
pub fn route_topic_name(original: &str, uid: UserId) -> Result<RoutedName, EngineError> {
    if original.is_empty() {
        return Err(EngineError::Malformed("empty topic name".into()));
    }
    if original == "sys" {
        return Ok(RoutedName {
            name: "sys".into(),
            original: original.into(),
            category: TopicCategory::System,
            is_channel: false,
        });
    }
    if original == "me" || original == "fnd" {
        if uid.is_none() {
            return Err(EngineError::PermissionDenied);
        }
        let category = if original == "me" {
            TopicCategory::Me
        } else {
            TopicCategory::Fnd
        };
        return Ok(RoutedName {
            name: format!("{}{}", original, uid.0),
            original: original.into(),
            category,
            is_channel: false,
        });
    }
    if let Some(digits) = original.strip_prefix("usr") {
        // 1:1 chat addressed by the peer's user id. Routed name is the
        // same for both participants.
        if uid.is_none() {
            return Err(EngineError::PermissionDenied);
        }
        let peer: u64 = digits
            .parse()
            .map_err(|_| EngineError::Malformed(format!("bad user topic '{original}'")))?;
        if peer == 0 || peer == uid.0 {
            return Err(EngineError::Malformed("cannot chat with self".into()));
        }
        return Ok(RoutedName {
            name: p2p_name(uid, UserId(peer)),
            original: original.into(),
            category: TopicCategory::P2P,
            is_channel: false,
        });
    }
    if original.starts_with("p2p") {
        return Ok(RoutedName {
            name: original.into(),
            original: original.into(),
            category: TopicCategory::P2P,
            is_channel: false,
        });
    }
    if original.starts_with("grp") {
        return Ok(RoutedName {
            name: original.into(),
            original: original.into(),
            category: TopicCategory::Group,
            is_channel: false,
        });
    }
    if let Some(suffix) = original.strip_prefix("chn") {
        // Channel readers attach to the backing group topic.
        return Ok(RoutedName {
            name: format!("grp{suffix}"),
            original: original.into(),
            category: TopicCategory::Group,
            is_channel: true,
        });
    }
    Err(EngineError::Malformed(format!("unrecognized topic '{original}'")))
}

/// Canonical p2p topic name for a pair of users, order-independent.
pub fn p2p_name(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
    format!("p2p{lo}-{hi}")
}

/// The two participants of a p2p topic, parsed back out of its name.
pub fn p2p_users(name: &str) -> Option<(UserId, UserId)> {
    let rest = name.strip_prefix("p2p")?;
    let (lo, hi) = rest.split_once('-')?;
    Some((UserId(lo.parse().ok()?), UserId(hi.parse().ok()?)))
}

/// Category of an already-routed topic name.
pub fn category_of(name: &str) -> Option<TopicCategory> {
    if name == "sys" {
        Some(TopicCategory::System)
    } else if name.starts_with("me") {
        Some(TopicCategory::Me)
    } else if name.starts_with("fnd") {
        Some(TopicCategory::Fnd)
    } else if name.starts_with("p2p") {
        Some(TopicCategory::P2P)
    } else if name.starts_with("grp") {
        Some(TopicCategory::Group)
    } else {
        None
    }
}

/// Topic lifecycle bits. Transitions only move toward `DELETED`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStatus(u8);

impl TopicStatus {
    const LOADED: u8 = 1 << 0;
    const PAUSED: u8 = 1 << 1;
    const READ_ONLY: u8 = 1 << 2;
    const DELETED: u8 = 1 << 3;

    /// Fresh topic: registered but not yet configured. Starts paused so
    /// traffic queues up behind the asynchronous load.
    pub fn new_paused() -> Self {
        TopicStatus(Self::PAUSED)
    }

    pub fn mark_loaded(&mut self) {
        self.0 |= Self::LOADED;
        self.0 &= !Self::PAUSED;
    }

    pub fn pause(&mut self) {
        self.0 |= Self::PAUSED;
    }

    pub fn resume(&mut self) {
        if !self.is_deleted() {
            self.0 &= !Self::PAUSED;
        }
    }

    pub fn mark_read_only(&mut self) {
        self.0 |= Self::READ_ONLY;
    }

    pub fn mark_deleted(&mut self) {
        self.0 |= Self::DELETED | Self::PAUSED;
    }

    pub fn is_loaded(&self) -> bool {
        self.0 & Self::LOADED != 0
    }

    pub fn is_paused(&self) -> bool {
        self.0 & Self::PAUSED != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.0 & Self::DELETED != 0
    }

    /// Ready to process traffic.
    pub fn is_ready(&self) -> bool {
        self.is_loaded() && !self.is_paused() && !self.is_deleted()
    }
}

impl fmt::Debug for TopicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_loaded() {
            parts.push("loaded");
        }
        if self.is_paused() {
            parts.push("paused");
        }
        if self.is_read_only() {
            parts.push("read-only");
        }
        if self.is_deleted() {
            parts.push("deleted");
        }
        write!(f, "TopicStatus({})", parts.join("|"))
    }
}

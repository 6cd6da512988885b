use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Permission bitmask for a user's relationship to a topic.
///
/// A subscriber carries two masks: `want` (requested by the user) and
/// `given` (granted by the topic owner). The effective mode is `want & given`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AccessMode(u8);

impl AccessMode {
    pub const NONE: AccessMode = AccessMode(0);
    /// J: attach to the topic.
    pub const JOIN: AccessMode = AccessMode(1 << 0);
    /// R: receive data messages.
    pub const READ: AccessMode = AccessMode(1 << 1);
    /// W: publish data messages.
    pub const WRITE: AccessMode = AccessMode(1 << 2);
    /// P: receive presence updates; absence of P mutes the subscription.
    pub const PRESENCE: AccessMode = AccessMode(1 << 3);
    /// A: approve other users' subscription requests.
    pub const APPROVE: AccessMode = AccessMode(1 << 4);
    /// S: share the topic (invite others).
    pub const SHARE: AccessMode = AccessMode(1 << 5);
    /// D: hard-delete messages.
    pub const DELETE: AccessMode = AccessMode(1 << 6);
    /// O: topic owner.
    pub const OWNER: AccessMode = AccessMode(1 << 7);

    /// Everything a peer-to-peer participant gets by default.
    pub const P2P: AccessMode =
        AccessMode(Self::JOIN.0 | Self::READ.0 | Self::WRITE.0 | Self::PRESENCE.0 | Self::APPROVE.0);
    /// Default for authenticated users joining a group topic.
    pub const AUTH_GROUP: AccessMode =
        AccessMode(Self::JOIN.0 | Self::READ.0 | Self::WRITE.0 | Self::PRESENCE.0 | Self::SHARE.0);
    /// Channel readers: read-only, no presence of their own.
    pub const CHANNEL: AccessMode = AccessMode(Self::JOIN.0 | Self::READ.0);
    /// Everything.
    pub const FULL: AccessMode = AccessMode(0xff);

    const LETTERS: [(u8, char); 8] = [
        (1 << 0, 'J'),
        (1 << 1, 'R'),
        (1 << 2, 'W'),
        (1 << 3, 'P'),
        (1 << 4, 'A'),
        (1 << 5, 'S'),
        (1 << 6, 'D'),
        (1 << 7, 'O'),
    ];

    pub fn has(&self, bits: AccessMode) -> bool {
        self.0 & bits.0 == bits.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn can_join(&self) -> bool {
        self.has(Self::JOIN)
    }

    pub fn can_read(&self) -> bool {
        self.has(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.has(Self::WRITE)
    }

    pub fn is_owner(&self) -> bool {
        self.has(Self::OWNER)
    }

    /// Presence-muted: the subscriber opted out of (or was denied) presence.
    pub fn is_muted(&self) -> bool {
        !self.has(Self::PRESENCE)
    }
}

impl BitAnd for AccessMode {
    type Output = AccessMode;
    fn bitand(self, rhs: Self) -> Self {
        AccessMode(self.0 & rhs.0)
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: Self) -> Self {
        AccessMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Not for AccessMode {
    type Output = AccessMode;
    fn not(self) -> Self {
        AccessMode(!self.0)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("N");
        }
        for (bit, letter) in Self::LETTERS {
            if self.0 & bit != 0 {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessMode({self})")
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "N" || s.is_empty() {
            return Ok(AccessMode::NONE);
        }
        let mut mode = AccessMode::NONE;
        for c in s.chars() {
            let bit = Self::LETTERS
                .iter()
                .find(|(_, letter)| *letter == c.to_ascii_uppercase())
                .map(|(bit, _)| *bit)
                .ok_or_else(|| format!("invalid access flag '{c}'"))?;
            mode.0 |= bit;
        }
        Ok(mode)
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccessMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_mode_is_want_and_given() {
        let want = AccessMode::JOIN | AccessMode::READ | AccessMode::WRITE;
        let given = AccessMode::JOIN | AccessMode::READ;
        let effective = want & given;
        assert!(effective.can_read());
        assert!(!effective.can_write());
    }

    #[test]
    fn display_roundtrip() {
        let mode = AccessMode::JOIN | AccessMode::READ | AccessMode::PRESENCE;
        assert_eq!(mode.to_string(), "JRP");
        assert_eq!("JRP".parse::<AccessMode>().unwrap(), mode);
        assert_eq!("jrp".parse::<AccessMode>().unwrap(), mode);
    }

    #[test]
    fn none_renders_as_n() {
        assert_eq!(AccessMode::NONE.to_string(), "N");
        assert_eq!("N".parse::<AccessMode>().unwrap(), AccessMode::NONE);
    }

    #[test]
    fn invalid_flag_rejected() {
        assert!("JRX".parse::<AccessMode>().is_err());
    }

    #[test]
    fn muted_means_no_presence() {
        assert!(AccessMode::CHANNEL.is_muted());
        assert!(!AccessMode::P2P.is_muted());
    }

    #[test]
    fn owner_implies_nothing_else() {
        assert!(AccessMode::OWNER.is_owner());
        assert!(!AccessMode::OWNER.can_write());
    }

    #[test]
    fn serde_as_string() {
        let mode = AccessMode::AUTH_GROUP;
        let json = serde_json::to_string(&mode).unwrap();
        assert_eq!(json, "\"JRWPS\"");
        let parsed: AccessMode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, mode);
    }
}

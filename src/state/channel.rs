//! Channel entities.

use std::collections::HashMap;
use std::rc::Rc;

use uuid::Uuid;

use crate::chanlog::ChannelLog;
use crate::modes::ModeRegistry;

/// One entry of a list mode (`+b` and friends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub param: String,
    pub setter: String,
    pub set_at: i64,
}

/// The stored value of a channel mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeValue {
    Flag,
    Param(String),
    List(Vec<ListEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub setter: String,
    pub set_at: i64,
}

/// Per-membership state.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    /// Held status letters, rank-descending.
    pub status: String,
    /// Ban cache: action extban -> action param. The empty key is the plain
    /// join/speak denial. `None` until populated on join.
    pub bans: Option<HashMap<String, String>>,
    pub joined_at: i64,
}

pub struct Channel {
    /// Display name (original casing of the first join).
    pub name: String,
    pub created: i64,
    pub topic: Option<Topic>,
    pub members: HashMap<Uuid, Membership>,
    pub modes: HashMap<char, ModeValue>,
    pub log: Rc<dyn ChannelLog>,
}

impl Channel {
    pub fn new(name: &str, created: i64, log: Rc<dyn ChannelLog>) -> Channel {
        Channel {
            name: name.to_string(),
            created,
            topic: None,
            members: HashMap::new(),
            modes: HashMap::new(),
            log,
        }
    }

    /// Rank of a member's highest status mode, or 0.
    pub fn user_rank(&self, registry: &ModeRegistry, user: Uuid) -> i32 {
        let Some(member) = self.members.get(&user) else {
            return 0;
        };
        member
            .status
            .chars()
            .filter_map(|letter| registry.channel_statuses.get(&letter))
            .map(|status| status.rank)
            .max()
            .unwrap_or(0)
    }

    pub fn has_mode(&self, letter: char) -> bool {
        self.modes.contains_key(&letter)
    }

    pub fn mode_param(&self, letter: char) -> Option<&str> {
        match self.modes.get(&letter) {
            Some(ModeValue::Param(p)) => Some(p),
            _ => None,
        }
    }

    pub fn list_entries(&self, letter: char) -> &[ListEntry] {
        match self.modes.get(&letter) {
            Some(ModeValue::List(entries)) => entries,
            _ => &[],
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .field("modes", &self.modes)
            .finish()
    }
}

/// Channel name syntax check.
pub fn is_valid_channel_name(name: &str) -> bool {
    name.len() >= 2
        && name.len() <= 64
        && name.starts_with('#')
        && !name.contains([' ', ',', '\x07'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_validation() {
        assert!(is_valid_channel_name("#chat"));
        assert!(is_valid_channel_name("#a"));
        assert!(!is_valid_channel_name("#"));
        assert!(!is_valid_channel_name("chat"));
        assert!(!is_valid_channel_name("#has space"));
        assert!(!is_valid_channel_name("#a,b"));
    }
}

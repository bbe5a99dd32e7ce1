//! User entities.

use std::collections::HashMap;
use std::net::IpAddr;

use uuid::Uuid;

use crate::network::connection::ConnId;

/// A user known to the network, local or remote.
#[derive(Debug, Clone)]
pub struct User {
    pub uuid: Uuid,
    pub nick: String,
    pub ident: String,
    pub gecos: String,
    pub ip: IpAddr,
    /// Display host (vhost if one applies).
    pub host: String,
    pub real_host: String,
    /// Folded names of joined channels.
    pub channels: Vec<String>,
    pub modes: HashMap<char, Option<String>>,
    /// Free-form metadata, e.g. `account`.
    pub metadata: HashMap<String, String>,
    /// Per-module scratch values (ping bookkeeping and the like).
    pub cache: HashMap<String, i64>,
    pub idle_since: i64,
    pub signon_at: i64,
    /// True for pseudo-users that must not propagate to peers.
    pub local_only: bool,
    /// Server the user lives on (our own id for local users).
    pub server: String,
    /// Local connection, if any.
    pub conn: Option<ConnId>,
}

impl User {
    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }

    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.host)
    }

    pub fn hostmask_with_real_host(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.real_host)
    }

    pub fn hostmask_with_ip(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.ip)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Nickname syntax check: letters, digits and the RFC special characters,
/// not starting with a digit or `-`.
pub fn is_valid_nick(nick: &str, max_len: usize) -> bool {
    if nick.is_empty() || nick.len() > max_len {
        return false;
    }
    let mut chars = nick.chars();
    let first = chars.next().expect("checked non-empty");
    if first.is_ascii_digit() || first == '-' {
        return false;
    }
    nick.chars()
        .all(|c| c.is_ascii_alphanumeric() || "-[]\\^_`{|}".contains(c))
}

/// Ident syntax check (alnum plus `-.[]\^_`{|}` after truncation).
pub fn is_valid_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-.[]\\^_`{|}".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_validation() {
        assert!(is_valid_nick("alice", 32));
        assert!(is_valid_nick("[w]e^ird`", 32));
        assert!(!is_valid_nick("", 32));
        assert!(!is_valid_nick("1abc", 32));
        assert!(!is_valid_nick("-abc", 32));
        assert!(!is_valid_nick("has space", 32));
        assert!(!is_valid_nick("toolongtoolongtoolong", 10));
    }

    #[test]
    fn ident_validation() {
        assert!(is_valid_ident("a"));
        assert!(is_valid_ident("user.name"));
        assert!(!is_valid_ident(""));
        assert!(!is_valid_ident("bad ident"));
        assert!(!is_valid_ident("no@really"));
    }
}

//! Peer server entities.

use std::collections::HashMap;

use crate::network::connection::ConnId;

/// A linked (or transitively known) peer server.
#[derive(Debug, Clone)]
pub struct Peer {
    pub server_id: String,
    pub name: String,
    /// Per-module scratch values (ping bookkeeping and the like).
    pub cache: HashMap<String, i64>,
    /// Direct link connection. `None` for servers reached through another
    /// peer.
    pub conn: Option<ConnId>,
    /// Server id of the directly-linked peer this server is reached
    /// through (self id for direct links).
    pub via: String,
}

impl Peer {
    pub fn is_direct(&self) -> bool {
        self.conn.is_some()
    }
}

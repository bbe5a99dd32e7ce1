//! The entity graph and its lifecycle rules.
//!
//! One `Ircd` value owns every registry and every entity. It lives on the
//! single core task and is only ever mutated there; handlers receive
//! `&mut Ircd` plus stable ids (uuids for users, folded names for
//! channels), never long-lived references into the graph.

pub mod channel;
pub mod server;
pub mod user;

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use modircd_proto::{irc_lower, CasemappedMap, Message};
use tracing::{debug, info};
use uuid::Uuid;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::chanlog::open_channel_log;
use crate::config::Config;
use crate::hooks::{ActionArgs, ActionFilter, LeaveDetail, LeaveType};
use crate::modules::Registry;
use crate::network::connection::{ConnId, Connection, Event, ListenerKind};
use crate::storage::Storage;

pub use channel::{Channel, Membership};
pub use server::Peer;
pub use user::User;

/// Wall-clock seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// How long ids of departed entities stay resolvable for cross-link race
/// tolerance.
const RECENT_WINDOW_SECS: i64 = 60;

pub struct Ircd {
    pub config: Config,
    pub config_path: String,
    pub version: &'static str,
    pub created: DateTime<Utc>,
    pub users: HashMap<Uuid, User>,
    pub user_nicks: CasemappedMap<Uuid>,
    pub channels: CasemappedMap<Channel>,
    /// Known peer servers by server id.
    pub servers: HashMap<String, Peer>,
    pub server_names: CasemappedMap<String>,
    pub recently_quit_users: HashMap<String, i64>,
    pub recently_quit_servers: HashMap<String, i64>,
    pub recently_destroyed_channels: CasemappedMap<i64>,
    pub connections: HashMap<ConnId, Connection>,
    /// Accept-time per-peer socket counts.
    pub peer_connections: HashMap<IpAddr, u32>,
    pub registry: Registry,
    pub storage: Storage,
    pub shutting_down: bool,
    /// Feeds the core event queue (connection tasks, timers, listeners).
    pub event_tx: UnboundedSender<Event>,
    pub next_conn_id: ConnId,
    /// Bound listeners by `(kind, descriptor)`, for rehash diffing.
    pub bound_ports: HashMap<(ListenerKind, String), JoinHandle<()>>,
}

impl Ircd {
    pub fn new(
        config: Config,
        config_path: String,
        storage: Storage,
        event_tx: UnboundedSender<Event>,
    ) -> Ircd {
        Ircd {
            config,
            config_path,
            version: env!("CARGO_PKG_VERSION"),
            created: Utc::now(),
            users: HashMap::new(),
            user_nicks: CasemappedMap::new(),
            channels: CasemappedMap::new(),
            servers: HashMap::new(),
            server_names: CasemappedMap::new(),
            recently_quit_users: HashMap::new(),
            recently_quit_servers: HashMap::new(),
            recently_destroyed_channels: CasemappedMap::new(),
            connections: HashMap::new(),
            peer_connections: HashMap::new(),
            registry: Registry::default(),
            storage,
            shutting_down: false,
            event_tx,
            next_conn_id: 1,
            bound_ports: HashMap::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    pub fn find_user_by_nick(&self, nick: &str) -> Option<Uuid> {
        self.user_nicks.get(nick).copied()
    }

    /// Resolve a source id to its display prefix: hostmask for users,
    /// server name for server ids, anything else passes through (channel
    /// names for self-sourced mode changes).
    pub fn display_prefix(&self, source: &str) -> String {
        if let Ok(uuid) = source.parse::<Uuid>() {
            if let Some(user) = self.users.get(&uuid) {
                return user.hostmask();
            }
        }
        if source == self.server_id() {
            return self.server_name().to_string();
        }
        if let Some(peer) = self.servers.get(source) {
            return peer.name.clone();
        }
        source.to_string()
    }

    // ------------------------------------------------------------------
    // Channel membership lifecycle
    // ------------------------------------------------------------------

    /// Put a user into a channel, creating the channel on first join.
    /// Permission checks belong to the callers; this maintains the graph,
    /// fires `join` hooks, and announces. Returns false if already joined.
    pub fn join_channel(&mut self, user: Uuid, name: &str, from_server: Option<&str>) -> bool {
        let key = irc_lower(name);
        if !self.users.contains_key(&user) {
            return false;
        }
        if let Some(channel) = self.channels.get(&key) {
            if channel.members.contains_key(&user) {
                return false;
            }
        }
        let creating = !self.channels.contains_key(&key);
        if creating {
            let log = open_channel_log(self.config.log_dir.as_deref(), name);
            self.channels
                .insert(&key, Channel::new(name, now_ts(), log));
            self.recently_destroyed_channels.remove(&key);
        }

        // Membership is bidirectional; both sides change together.
        if let Some(channel) = self.channels.get_mut(&key) {
            channel.members.insert(
                user,
                Membership {
                    status: String::new(),
                    bans: None,
                    joined_at: now_ts(),
                },
            );
        }
        if let Some(entity) = self.users.get_mut(&user) {
            entity.channels.push(key.clone());
        }

        let (display_name, members): (String, Vec<Uuid>) = {
            let channel = self.channels.get(&key).expect("just inserted");
            (channel.name.clone(), channel.members.keys().copied().collect())
        };
        let hostmask = self
            .users
            .get(&user)
            .map(|u| u.hostmask())
            .unwrap_or_default();
        let join_msg = Message::with_prefix(hostmask, "JOIN", vec![display_name.clone()]);
        for member in &members {
            self.send_to_user(*member, &join_msg);
        }

        // The creator gets operator status from the server.
        if creating && from_server.is_none() {
            let server_id = self.server_id().to_string();
            self.set_channel_modes(
                &key,
                vec![crate::modes::ModeChangeRequest {
                    adding: true,
                    letter: 'o',
                    param: Some(user.to_string()),
                }],
                &server_id,
                None,
            );
        }

        let filter = ActionFilter {
            users: vec![user],
            channels: vec![key.clone()],
        };
        let mut args = ActionArgs::ChannelUser {
            channel: key.clone(),
            user,
        };
        self.run_action_standard("join", &mut args, Some(&filter));

        if self.users.get(&user).map(|u| u.is_local()).unwrap_or(false) {
            self.send_topic_reply(user, &key, false);
            self.send_names_reply(user, &key);
        }

        let local_only = self
            .users
            .get(&user)
            .map(|u| u.local_only)
            .unwrap_or(true);
        if !local_only {
            let wire = Message::with_prefix(user.to_string(), "JOIN", vec![display_name]);
            self.broadcast_to_servers(from_server, &wire);
        }
        true
    }

    /// Take a user out of a channel. Announcements run through the
    /// `leavemessage` processing action before the graph is touched, so
    /// handlers still see the membership.
    pub fn leave_channel(
        &mut self,
        user: Uuid,
        channel_name: &str,
        leave_type: LeaveType,
        detail: LeaveDetail,
        from_server: Option<&str>,
    ) {
        let key = irc_lower(channel_name);
        let is_member = self
            .channels
            .get(&key)
            .map(|c| c.members.contains_key(&user))
            .unwrap_or(false);
        if !is_member {
            return;
        }

        let mut send_list: Vec<Uuid> = self
            .channels
            .get(&key)
            .map(|c| {
                c.members
                    .keys()
                    .copied()
                    .filter(|m| self.users.get(m).map(|u| u.is_local()).unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        let filter = ActionFilter::channels(vec![key.clone()]);
        let mut args = ActionArgs::Leave {
            send_list: &mut send_list,
            channel: key.clone(),
            user,
            leave_type,
            detail,
            from_server: from_server.map(str::to_string),
        };
        self.run_action_processing("leavemessage", &mut args, Some(&filter));

        if let Some(channel) = self.channels.get_mut(&key) {
            channel.members.remove(&user);
        }
        if let Some(entity) = self.users.get_mut(&user) {
            entity.channels.retain(|c| c != &key);
        }
        self.try_destroy_channel(&key);
    }

    /// Destroy an empty channel unless something (e.g. registration) keeps
    /// it alive.
    pub fn try_destroy_channel(&mut self, key: &str) {
        let empty = self
            .channels
            .get(key)
            .map(|c| c.members.is_empty())
            .unwrap_or(false);
        if !empty {
            return;
        }
        let filter = ActionFilter::channels(vec![key.to_string()]);
        let mut args = ActionArgs::ChannelKeep {
            channel: key.to_string(),
        };
        if self
            .run_action_until_true("keepchannelalive", &mut args, Some(&filter))
            .is_some()
        {
            return;
        }
        if let Some(channel) = self.channels.remove(key) {
            channel.log.close();
            debug!(channel = %channel.name, "channel destroyed");
        }
        self.recently_destroyed_channels.insert(key, now_ts());
    }

    // ------------------------------------------------------------------
    // User lifecycle
    // ------------------------------------------------------------------

    /// Remove a user from the network: announce to shared channels, clean
    /// the graph, remember the id for the race window, propagate.
    pub fn quit_user(&mut self, user: Uuid, reason: &str, from_server: Option<&str>) {
        let Some(entity) = self.users.get(&user) else {
            return;
        };
        let hostmask = entity.hostmask();
        let nick = entity.nick.clone();
        let channels = entity.channels.clone();
        let conn = entity.conn;
        let local = entity.is_local();
        let local_only = entity.local_only;

        let quit_msg = Message::with_prefix(hostmask, "QUIT", vec![reason.to_string()]);
        let mut notified: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
        notified.insert(user);
        for channel_name in &channels {
            let members: Vec<Uuid> = self
                .channels
                .get(channel_name)
                .map(|c| c.members.keys().copied().collect())
                .unwrap_or_default();
            for member in members {
                if notified.insert(member) {
                    self.send_to_user(member, &quit_msg);
                }
            }
        }
        for channel_name in &channels {
            if let Some(channel) = self.channels.get_mut(channel_name) {
                channel.members.remove(&user);
            }
            self.try_destroy_channel(channel_name);
        }
        if let Some(entity) = self.users.get_mut(&user) {
            entity.channels.clear();
        }

        let mut args = ActionArgs::Quit {
            user,
            reason: reason.to_string(),
        };
        self.run_action_standard(if local { "quit" } else { "remotequit" }, &mut args, None);

        self.users.remove(&user);
        if self.user_nicks.get(&nick) == Some(&user) {
            self.user_nicks.remove(&nick);
        }
        self.recently_quit_users.insert(user.to_string(), now_ts());

        if !local_only {
            let wire = Message::with_prefix(user.to_string(), "QUIT", vec![reason.to_string()]);
            self.broadcast_to_servers(from_server, &wire);
        }
        if let Some(conn_id) = conn {
            self.close_connection(conn_id, reason);
        }
        info!(nick = %nick, reason = %reason, local, "user quit");
    }

    /// Drop a peer server and everything behind it (netsplit).
    pub fn quit_server(&mut self, server_id: &str, reason: &str, from_server: Option<&str>) {
        let mut gone: Vec<String> = vec![server_id.to_string()];
        // Servers reached through the departing link go with it.
        loop {
            let more: Vec<String> = self
                .servers
                .values()
                .filter(|peer| gone.contains(&peer.via) && !gone.contains(&peer.server_id))
                .map(|peer| peer.server_id.clone())
                .collect();
            if more.is_empty() {
                break;
            }
            gone.extend(more);
        }

        let orphaned: Vec<Uuid> = self
            .users
            .values()
            .filter(|u| gone.contains(&u.server))
            .map(|u| u.uuid)
            .collect();
        for user in orphaned {
            self.quit_user(user, reason, from_server);
        }

        let mut conn_to_close = None;
        for id in &gone {
            if let Some(peer) = self.servers.remove(id) {
                self.server_names.remove(&peer.name);
                if peer.conn.is_some() {
                    conn_to_close = peer.conn;
                }
                self.recently_quit_servers.insert(id.clone(), now_ts());
                let mut args = ActionArgs::Server {
                    server: id.clone(),
                };
                self.run_action_standard("serverquit", &mut args, None);
            }
        }

        let wire = Message::with_prefix(
            self.server_id().to_string(),
            "SQUIT",
            vec![server_id.to_string(), reason.to_string()],
        );
        self.broadcast_to_servers(from_server, &wire);
        if let Some(conn_id) = conn_to_close {
            self.close_connection(conn_id, reason);
        }
        info!(server = server_id, reason = %reason, "server delinked");
    }

    /// Age out the race-tolerance windows.
    pub fn prune_recent_windows(&mut self) {
        let cutoff = now_ts() - RECENT_WINDOW_SECS;
        self.recently_quit_users.retain(|_, ts| *ts >= cutoff);
        self.recently_quit_servers.retain(|_, ts| *ts >= cutoff);
        self.recently_destroyed_channels
            .retain(|_, ts| *ts >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{add_user, test_ircd};

    fn part_detail(reason: &str) -> LeaveDetail {
        LeaveDetail {
            by_user: None,
            by_server: None,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn membership_is_bidirectional() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        let bob = add_user(&mut ircd, "bob");

        assert!(ircd.join_channel(alice, "#test", None));
        assert!(ircd.join_channel(bob, "#test", None));
        let channel = ircd.channels.get("#test").expect("channel exists");
        assert!(channel.members.contains_key(&alice));
        assert!(channel.members.contains_key(&bob));
        assert_eq!(channel.members.len(), 2);
        assert!(ircd.users[&alice].channels.contains(&"#test".to_string()));
        assert!(ircd.users[&bob].channels.contains(&"#test".to_string()));

        ircd.leave_channel(alice, "#test", LeaveType::Part, part_detail("bye"), None);
        let channel = ircd.channels.get("#test").expect("still one member");
        assert!(!channel.members.contains_key(&alice));
        assert!(ircd.users[&alice].channels.is_empty());
        assert_eq!(
            channel.members.len(),
            ircd.users.values().filter(|u| u.channels.contains(&"#test".to_string())).count()
        );
    }

    #[test]
    fn empty_unregistered_channel_is_destroyed() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#gone", None);
        ircd.leave_channel(alice, "#gone", LeaveType::Part, part_detail("bye"), None);
        assert!(ircd.channels.get("#gone").is_none());
        assert!(ircd.recently_destroyed_channels.contains_key("#gone"));
    }

    #[test]
    fn duplicate_join_is_rejected() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        assert!(ircd.join_channel(alice, "#test", None));
        assert!(!ircd.join_channel(alice, "#test", None));
        assert_eq!(ircd.users[&alice].channels.len(), 1);
    }

    #[test]
    fn quit_cleans_the_whole_graph() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        let bob = add_user(&mut ircd, "bob");
        ircd.join_channel(alice, "#a", None);
        ircd.join_channel(alice, "#b", None);
        ircd.join_channel(bob, "#a", None);

        ircd.quit_user(alice, "gone", None);
        assert!(!ircd.users.contains_key(&alice));
        assert!(ircd.find_user_by_nick("alice").is_none());
        assert!(ircd.channels.get("#b").is_none());
        let channel = ircd.channels.get("#a").expect("bob keeps #a");
        assert!(!channel.members.contains_key(&alice));
        assert!(ircd
            .recently_quit_users
            .contains_key(&alice.to_string()));
    }

    #[test]
    fn nick_lookup_is_casemapped() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "Alice[1]");
        assert_eq!(ircd.find_user_by_nick("ALICE{1}"), Some(alice));
        assert_eq!(ircd.find_user_by_nick("alice[1]"), Some(alice));
        assert_eq!(ircd.find_user_by_nick("alicia"), None);
    }

    #[test]
    fn creator_receives_operator_status() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#new", None);
        let channel = ircd.channels.get("#new").expect("channel exists");
        assert_eq!(channel.user_rank(&ircd.registry.modes, alice), 100);
    }
}

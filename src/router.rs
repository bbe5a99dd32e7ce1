//! Message routing: local delivery, channel fan-out, peer broadcast.

use modircd_proto::{irc_lower, numerics, Message};
use tracing::debug;
use uuid::Uuid;

use crate::hooks::{ActionArgs, ActionFilter};
use crate::network::connection::{ConnId, ConnectionKind};
use crate::state::Ircd;

impl Ircd {
    pub fn send_to_conn(&self, conn: ConnId, msg: &Message) {
        if let Some(connection) = self.connections.get(&conn) {
            connection.send(msg);
        }
    }

    /// Deliver to a user's local connection, if it has one. Remote users
    /// are reached by the peer fan-out instead.
    pub fn send_to_user(&self, user: Uuid, msg: &Message) {
        if let Some(conn) = self.users.get(&user).and_then(|u| u.conn) {
            self.send_to_conn(conn, msg);
        }
    }

    /// Numeric reply to a user, with the server as prefix and the nick as
    /// first parameter.
    pub fn send_numeric(&mut self, user: Uuid, code: &str, params: Vec<String>) {
        let nick = self
            .users
            .get(&user)
            .map(|u| u.nick.clone())
            .unwrap_or_else(|| "*".to_string());
        let mut full = vec![nick];
        full.extend(params);
        let msg = Message::with_prefix(self.server_name().to_string(), code, full);
        self.send_to_user(user, &msg);
    }

    /// Numeric reply to a not-yet-registered connection.
    pub fn send_numeric_to_conn(&self, conn: ConnId, code: &str, params: Vec<String>) {
        let mut full = vec!["*".to_string()];
        full.extend(params);
        let msg = Message::with_prefix(self.server_name().to_string(), code, full);
        self.send_to_conn(conn, &msg);
    }

    /// The direct-link connection through which a server id is reached.
    pub fn server_link_conn(&self, server_id: &str) -> Option<ConnId> {
        let peer = self.servers.get(server_id)?;
        if let Some(conn) = peer.conn {
            return Some(conn);
        }
        self.servers.get(&peer.via).and_then(|via| via.conn)
    }

    /// One framed line to every directly linked server except the source
    /// link. Per-link order follows call order.
    pub fn broadcast_to_servers(&self, from_server: Option<&str>, msg: &Message) {
        for peer in self.servers.values() {
            if !peer.is_direct() {
                continue;
            }
            if Some(peer.server_id.as_str()) == from_server
                || Some(peer.via.as_str()) == from_server
            {
                continue;
            }
            if let Some(conn) = peer.conn {
                self.send_to_conn(conn, msg);
            }
        }
    }

    /// Channel fan-out for PRIVMSG/NOTICE. The send list starts as every
    /// local member except the source; `channelmessage` handlers may
    /// suppress or reroute entries before delivery.
    pub fn deliver_channel_message(
        &mut self,
        source: Uuid,
        channel_name: &str,
        command: &str,
        text: &str,
        from_server: Option<&str>,
    ) {
        let key = irc_lower(channel_name);
        let Some(channel) = self.channels.get(&key) else {
            return;
        };
        let display = channel.name.clone();
        let mut send_list: Vec<Uuid> = channel
            .members
            .keys()
            .copied()
            .filter(|member| *member != source)
            .filter(|member| self.users.get(member).map(|u| u.is_local()).unwrap_or(false))
            .collect();

        let filter = ActionFilter::channels(vec![key.clone()]);
        let mut args = ActionArgs::ChannelMessage {
            send_list: &mut send_list,
            channel: key.clone(),
            source,
            command: command.to_string(),
            text: text.to_string(),
        };
        self.run_action_processing("channelmessage", &mut args, Some(&filter));

        let prefix = self
            .users
            .get(&source)
            .map(|u| u.hostmask())
            .unwrap_or_else(|| source.to_string());
        let msg = Message::with_prefix(prefix, command, vec![display.clone(), text.to_string()]);
        for member in send_list {
            self.send_to_user(member, &msg);
        }
        let wire = Message::with_prefix(
            source.to_string(),
            command,
            vec![display, text.to_string()],
        );
        self.broadcast_to_servers(from_server, &wire);
    }

    /// Tear down a local connection: the write task ends when the sender
    /// drops, and the read task's Closed event becomes a no-op.
    pub fn close_connection(&mut self, conn: ConnId, reason: &str) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let error = Message::new(
            "ERROR",
            vec![format!("Closing Link: {} ({})", connection.ip, reason)],
        );
        connection.send(&error);
        if let Some(count) = self.peer_connections.get_mut(&connection.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.peer_connections.remove(&connection.ip);
            }
        }
        debug!(conn, ip = %connection.ip, reason = %reason, "connection closed");
    }

    // ------------------------------------------------------------------
    // Standard reply bursts
    // ------------------------------------------------------------------

    /// 353/366 names listing for a channel.
    pub fn send_names_reply(&mut self, user: Uuid, channel_key: &str) {
        let Some(channel) = self.channels.get(channel_key) else {
            return;
        };
        let display = channel.name.clone();
        let mut names: Vec<String> = Vec::with_capacity(channel.members.len());
        for (member, membership) in &channel.members {
            let Some(entity) = self.users.get(member) else {
                continue;
            };
            let symbol = membership
                .status
                .chars()
                .next()
                .and_then(|letter| self.registry.modes.channel_statuses.get(&letter))
                .map(|status| status.symbol.to_string())
                .unwrap_or_default();
            names.push(format!("{symbol}{}", entity.nick));
        }
        names.sort();
        self.send_numeric(
            user,
            numerics::RPL_NAMREPLY,
            vec!["=".to_string(), display.clone(), names.join(" ")],
        );
        self.send_numeric(
            user,
            numerics::RPL_ENDOFNAMES,
            vec![display, "End of /NAMES list".to_string()],
        );
    }

    /// 332/333 topic replies; with `always`, 331 when no topic is set.
    pub fn send_topic_reply(&mut self, user: Uuid, channel_key: &str, always: bool) {
        let Some(channel) = self.channels.get(channel_key) else {
            return;
        };
        let display = channel.name.clone();
        match channel.topic.clone() {
            Some(topic) => {
                self.send_numeric(
                    user,
                    numerics::RPL_TOPIC,
                    vec![display.clone(), topic.text],
                );
                self.send_numeric(
                    user,
                    numerics::RPL_TOPICWHOTIME,
                    vec![display, topic.setter, topic.set_at.to_string()],
                );
            }
            None if always => {
                self.send_numeric(
                    user,
                    numerics::RPL_NOTOPIC,
                    vec![display, "No topic is set".to_string()],
                );
            }
            None => {}
        }
    }

    /// ISUPPORT tokens: registry-derived defaults plus whatever modules
    /// contribute through `buildisupport`.
    pub fn isupport_tokens(&mut self) -> Vec<(String, Option<String>)> {
        let mut tokens: Vec<(String, Option<String>)> = vec![
            ("CHANTYPES".to_string(), Some("#".to_string())),
            (
                "CHANMODES".to_string(),
                Some(self.registry.modes.chanmodes_token()),
            ),
            (
                "PREFIX".to_string(),
                Some(self.registry.modes.prefix_token()),
            ),
            (
                "NETWORK".to_string(),
                Some(self.server_name().to_string()),
            ),
            ("CASEMAPPING".to_string(), Some("rfc1459".to_string())),
        ];
        let mut args = ActionArgs::Isupport {
            tokens: &mut tokens,
        };
        self.run_action_standard("buildisupport", &mut args, None);
        tokens
    }

    /// The 001–005 registration burst, followed by the MOTD.
    pub fn send_welcome_burst(&mut self, user: Uuid) {
        let Some(entity) = self.users.get(&user) else {
            return;
        };
        let hostmask = entity.hostmask();
        let name = self.server_name().to_string();
        let version = self.version;
        self.send_numeric(
            user,
            numerics::RPL_WELCOME,
            vec![format!("Welcome to the Internet Relay Network {hostmask}")],
        );
        self.send_numeric(
            user,
            numerics::RPL_YOURHOST,
            vec![format!(
                "Your host is {name}, running version modircd-{version}"
            )],
        );
        self.send_numeric(
            user,
            numerics::RPL_CREATED,
            vec![format!("This server was created {}", self.created.to_rfc2822())],
        );
        let user_mode_letters: String = {
            let mut letters: Vec<char> =
                self.registry.modes.user_modes.keys().copied().collect();
            letters.sort_unstable();
            letters.into_iter().collect()
        };
        let channel_mode_letters: String = {
            let mut letters: Vec<char> = self
                .registry
                .modes
                .channel_modes
                .keys()
                .copied()
                .chain(self.registry.modes.channel_statuses.keys().copied())
                .collect();
            letters.sort_unstable();
            letters.into_iter().collect()
        };
        self.send_numeric(
            user,
            numerics::RPL_MYINFO,
            vec![
                name,
                format!("modircd-{version}"),
                user_mode_letters,
                channel_mode_letters,
            ],
        );
        let tokens = self.isupport_tokens();
        let mut rendered: Vec<String> = tokens
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{key}={value}"),
                None => key,
            })
            .collect();
        rendered.push("are supported by this server".to_string());
        self.send_numeric(user, numerics::RPL_ISUPPORT, rendered);
        self.send_motd(user);
    }

    pub fn send_motd(&mut self, user: Uuid) {
        match self.config.motd.clone() {
            Some(motd) => {
                let name = self.server_name().to_string();
                let width = self.config.motd_line_length;
                self.send_numeric(
                    user,
                    numerics::RPL_MOTDSTART,
                    vec![format!("- {name} Message of the Day -")],
                );
                for line in motd.lines() {
                    let mut line = line.to_string();
                    line.truncate(width);
                    self.send_numeric(user, numerics::RPL_MOTD, vec![format!("- {line}")]);
                }
                self.send_numeric(
                    user,
                    numerics::RPL_ENDOFMOTD,
                    vec!["End of message of the day".to_string()],
                );
            }
            None => {
                self.send_numeric(
                    user,
                    numerics::ERR_NOMOTD,
                    vec!["MOTD File is missing".to_string()],
                );
            }
        }
    }
}

//! The protocol dispatcher.
//!
//! Consumes decoded frames from the core event queue, drives the
//! registration state machine for fresh connections, and routes commands
//! from registered users and linked servers through the command registries.

use std::collections::HashMap;
use std::net::SocketAddr;

use modircd_proto::{irc_lower, numerics, Frame, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::commands::CommandContext;
use crate::config::Config;
use crate::hooks::{ActionArgs, ActionFilter, ActionValue};
use crate::network::connection::{ConnId, Connection, ConnectionKind, Event, ListenerKind};
use crate::network::{bind_endpoint, spawn_io};
use crate::state::user::{is_valid_ident, is_valid_nick};
use crate::state::{now_ts, Ircd, Peer, User};

/// Maximum nickname length accepted from clients.
const NICK_MAX_LEN: usize = 32;

/// Commands a connection may send before registering.
const UNREGISTERED_ALLOWED: [&str; 7] =
    ["PASS", "USER", "SERVICE", "SERVER", "NICK", "PING", "QUIT"];

impl Ircd {
    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accept {
                stream,
                addr,
                listener,
                secure,
            } => self.handle_accept(stream, addr, listener, secure),
            Event::Frame { conn, frame } => self.handle_frame(conn, frame),
            Event::Closed { conn } => self.handle_closed(conn),
            Event::Tick => self.handle_tick(),
            Event::Rehash => self.handle_rehash().await,
            Event::Shutdown => self.handle_shutdown(),
        }
    }

    // ------------------------------------------------------------------
    // Sockets
    // ------------------------------------------------------------------

    fn handle_accept(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        listener: ListenerKind,
        secure: bool,
    ) {
        let ip = addr.ip();
        let count = self.peer_connections.get(&ip).copied().unwrap_or(0);
        let limit = self.config.connection_limit_for(&ip);
        if count >= limit {
            debug!(%ip, count, limit, "refusing connection over per-peer limit");
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream
                    .write_all(b"ERROR :Too many connections from your IP\r\n")
                    .await;
            });
            return;
        }
        *self.peer_connections.entry(ip).or_insert(0) += 1;

        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let outbound = spawn_io(id, stream, self.event_tx.clone());
        let now = now_ts();
        self.connections.insert(
            id,
            Connection {
                id,
                kind: ConnectionKind::Unregistered,
                ip,
                secure,
                server_port: listener == ListenerKind::Server,
                pending_pass: None,
                pending_nick: None,
                pending_user: None,
                bytes_in_window: 0,
                accepted_at: now,
                last_message_at: now,
                last_data_check: now,
                next_ping_at: now + self.config.ping_interval as i64,
                outbound,
            },
        );
        debug!(conn = id, %ip, ?listener, "connection accepted");
    }

    fn handle_closed(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        match connection.kind.clone() {
            ConnectionKind::User(user) => {
                self.quit_user(user, "Connection closed", None);
            }
            ConnectionKind::Server(server) => {
                let reason = format!(
                    "{} {}",
                    self.server_name(),
                    self.servers
                        .get(&server)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| server.clone())
                );
                self.quit_server(&server, &reason, None);
            }
            ConnectionKind::Unregistered | ConnectionKind::Service(_) => {
                self.close_connection(conn, "Connection closed");
            }
        }
    }

    fn handle_frame(&mut self, conn: ConnId, frame: Frame) {
        let now = now_ts();
        let ping_interval = self.config.ping_interval as i64;
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        connection.bytes_in_window += frame.bytes() as u64;
        connection.last_message_at = now;
        connection.next_ping_at = now + ping_interval;

        let msg = match frame {
            // Malformed lines are dropped; their bytes already counted.
            Frame::Invalid { .. } => return,
            Frame::Message { msg, .. } => msg,
        };
        match connection.kind.clone() {
            ConnectionKind::Unregistered => self.handle_unregistered(conn, msg),
            ConnectionKind::User(user) => self.handle_user_message(user, msg),
            ConnectionKind::Server(server) => self.handle_server_message(&server, msg),
            ConnectionKind::Service(_) => {
                // Services have no command surface in the core.
            }
        }
    }

    // ------------------------------------------------------------------
    // Registration state machine
    // ------------------------------------------------------------------

    fn handle_unregistered(&mut self, conn: ConnId, msg: Message) {
        let command = msg.command.to_ascii_uppercase();
        if !UNREGISTERED_ALLOWED.contains(&command.as_str()) {
            self.send_numeric_to_conn(
                conn,
                numerics::ERR_NOTREGISTERED,
                vec!["You have not registered".to_string()],
            );
            return;
        }
        match command.as_str() {
            "PASS" => {
                let password = msg.params.first().cloned().unwrap_or_default();
                if password.is_empty() {
                    self.send_numeric_to_conn(
                        conn,
                        numerics::ERR_NEEDMOREPARAMS,
                        vec!["PASS".to_string(), "Not enough parameters".to_string()],
                    );
                    return;
                }
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.pending_pass = Some(password);
                }
            }
            "NICK" => {
                let Some(nick) = msg.params.first().filter(|n| !n.is_empty()).cloned() else {
                    self.send_numeric_to_conn(
                        conn,
                        numerics::ERR_NONICKNAMEGIVEN,
                        vec!["No nickname given".to_string()],
                    );
                    return;
                };
                if !is_valid_nick(&nick, NICK_MAX_LEN) {
                    self.send_numeric_to_conn(
                        conn,
                        numerics::ERR_ERRONEUSNICKNAME,
                        vec![nick, "Erroneous nickname".to_string()],
                    );
                    return;
                }
                if self.user_nicks.contains_key(&nick) {
                    self.send_numeric_to_conn(
                        conn,
                        numerics::ERR_NICKNAMEINUSE,
                        vec![nick, "Nickname is already in use".to_string()],
                    );
                    return;
                }
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.pending_nick = Some(nick);
                }
                self.try_promote_user(conn);
            }
            "USER" => {
                if msg.params.len() < 4 || msg.params[3].is_empty() {
                    self.send_numeric_to_conn(
                        conn,
                        numerics::ERR_NEEDMOREPARAMS,
                        vec!["USER".to_string(), "Not enough parameters".to_string()],
                    );
                    return;
                }
                let mut ident = msg.params[0].clone();
                ident.truncate(self.config.ident_length);
                if !is_valid_ident(&ident) {
                    self.send_numeric_to_conn(
                        conn,
                        numerics::ERR_NEEDMOREPARAMS,
                        vec!["USER".to_string(), "Your username is not valid".to_string()],
                    );
                    return;
                }
                let mut gecos = msg.params[3].clone();
                gecos.truncate(self.config.gecos_length);
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.pending_user = Some((ident, gecos));
                }
                self.try_promote_user(conn);
            }
            "SERVER" => self.handle_server_registration(conn, &msg.params),
            "SERVICE" => self.handle_service_registration(conn, &msg.params),
            "PING" => {
                let token = msg
                    .params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.server_name().to_string());
                // The server hostname is the reply prefix for pre-registration pings.
                let hostname = self.config.hostname.clone();
                let pong = Message::with_prefix(hostname.clone(), "PONG", vec![hostname, token]);
                self.send_to_conn(conn, &pong);
            }
            "QUIT" => {
                self.close_connection(conn, "Client quit");
            }
            _ => unreachable!("covered by the allow-list"),
        }
    }

    /// Registration completes once both NICK and USER have arrived.
    fn try_promote_user(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        let (Some(nick), Some((ident, gecos))) = (
            connection.pending_nick.clone(),
            connection.pending_user.clone(),
        ) else {
            return;
        };
        // The nick may have been taken since NICK was accepted; promotion
        // rejection closes the connection.
        if self.user_nicks.contains_key(&nick) {
            self.send_numeric_to_conn(
                conn,
                numerics::ERR_NICKNAMEINUSE,
                vec![nick.clone(), "Nickname is already in use".to_string()],
            );
            self.close_connection(conn, "Nickname is already in use");
            return;
        }
        let ip = connection.ip;
        let uuid = Uuid::new_v4();
        let real_host = ip.to_string();
        let host = self
            .config
            .vhosts
            .get(&real_host)
            .cloned()
            .unwrap_or_else(|| real_host.clone());
        let now = now_ts();
        let user = User {
            uuid,
            nick: nick.clone(),
            ident: ident.clone(),
            gecos: gecos.clone(),
            ip,
            host: host.clone(),
            real_host: real_host.clone(),
            channels: Vec::new(),
            modes: HashMap::new(),
            metadata: HashMap::new(),
            cache: HashMap::new(),
            idle_since: now,
            signon_at: now,
            local_only: false,
            server: self.server_id().to_string(),
            conn: Some(conn),
        };
        self.users.insert(uuid, user);
        self.user_nicks.insert(&nick, uuid);
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.kind = ConnectionKind::User(uuid);
        }
        info!(nick = %nick, %ip, "user registered");

        let mut args = ActionArgs::User { user: uuid };
        self.run_action_standard("userconnect", &mut args, None);
        // A hook (e.g. the connection limiter) may have disconnected it.
        if !self.users.contains_key(&uuid) {
            return;
        }
        self.send_welcome_burst(uuid);
        let mut args = ActionArgs::User { user: uuid };
        self.run_action_standard("welcome", &mut args, None);

        let wire = Message::with_prefix(
            self.server_id().to_string(),
            "UID",
            vec![uuid.to_string(), nick, ident, host, real_host, gecos],
        );
        self.broadcast_to_servers(None, &wire);
    }

    /// `SERVER <name> <sid>` on a server port, authenticated by the PASS
    /// sent earlier against the configured link blocks.
    fn handle_server_registration(&mut self, conn: ConnId, params: &[String]) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        if !connection.server_port {
            self.close_connection(conn, "Server registration on a client port");
            return;
        }
        if params.len() < 2 {
            self.close_connection(conn, "Malformed SERVER");
            return;
        }
        let name = params[0].clone();
        let sid = params[1].clone();
        let authorized = self
            .config
            .links
            .iter()
            .find(|link| link.name == name)
            .map(|link| Some(link.password.as_str()) == connection.pending_pass.as_deref())
            .unwrap_or(false);
        if !authorized {
            warn!(server = %name, "server link rejected: bad credentials");
            self.close_connection(conn, "Access denied");
            return;
        }
        if self.servers.contains_key(&sid) || self.server_names.contains_key(&name) || sid == self.server_id() {
            self.close_connection(conn, "Server already linked");
            return;
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.kind = ConnectionKind::Server(sid.clone());
        }
        self.servers.insert(
            sid.clone(),
            Peer {
                server_id: sid.clone(),
                name: name.clone(),
                cache: HashMap::new(),
                conn: Some(conn),
                via: self.server_id().to_string(),
            },
        );
        self.server_names.insert(&name, sid.clone());
        info!(server = %name, sid = %sid, "server linked");

        let ours = Message::new(
            "SERVER",
            vec![self.server_name().to_string(), self.server_id().to_string()],
        );
        self.send_to_conn(conn, &ours);
        self.send_burst(conn);

        let mut args = ActionArgs::Server {
            server: sid.clone(),
        };
        self.run_action_standard("serverconnect", &mut args, None);
    }

    /// Sync our view of the network to a freshly linked peer.
    fn send_burst(&mut self, conn: ConnId) {
        let sid = self.server_id().to_string();
        for user in self.users.values() {
            if user.local_only {
                continue;
            }
            let uid = Message::with_prefix(
                sid.clone(),
                "UID",
                vec![
                    user.uuid.to_string(),
                    user.nick.clone(),
                    user.ident.clone(),
                    user.host.clone(),
                    user.real_host.clone(),
                    user.gecos.clone(),
                ],
            );
            self.send_to_conn(conn, &uid);
        }
        let channel_keys: Vec<String> = self.channels.keys().cloned().collect();
        for key in channel_keys {
            let Some(channel) = self.channels.get(&key) else {
                continue;
            };
            let display = channel.name.clone();
            let mut joins = Vec::new();
            let mut status_changes = Vec::new();
            for (member, membership) in &channel.members {
                joins.push(Message::with_prefix(
                    member.to_string(),
                    "JOIN",
                    vec![display.clone()],
                ));
                for letter in membership.status.chars() {
                    status_changes.push(Message::with_prefix(
                        sid.clone(),
                        "MODE",
                        vec![
                            display.clone(),
                            format!("+{letter}"),
                            member.to_string(),
                        ],
                    ));
                }
            }
            let mut mode_lines = Vec::new();
            for (letter, value) in &channel.modes {
                match value {
                    crate::state::channel::ModeValue::Flag => {
                        mode_lines.push(vec![display.clone(), format!("+{letter}")]);
                    }
                    crate::state::channel::ModeValue::Param(param) => {
                        mode_lines
                            .push(vec![display.clone(), format!("+{letter}"), param.clone()]);
                    }
                    crate::state::channel::ModeValue::List(entries) => {
                        for entry in entries {
                            mode_lines.push(vec![
                                display.clone(),
                                format!("+{letter}"),
                                entry.param.clone(),
                            ]);
                        }
                    }
                }
            }
            let topic = channel
                .topic
                .clone()
                .map(|t| Message::with_prefix(sid.clone(), "TOPIC", vec![display.clone(), t.text]));
            for join in joins {
                self.send_to_conn(conn, &join);
            }
            for change in status_changes {
                self.send_to_conn(conn, &change);
            }
            for params in mode_lines {
                let msg = Message::with_prefix(sid.clone(), "MODE", params);
                self.send_to_conn(conn, &msg);
            }
            if let Some(topic) = topic {
                self.send_to_conn(conn, &topic);
            }
        }
    }

    /// `SERVICE <name>`: promoted directly; bad credentials close the
    /// socket, like SERVER.
    fn handle_service_registration(&mut self, conn: ConnId, params: &[String]) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        if !connection.server_port || params.is_empty() {
            self.close_connection(conn, "Service registration rejected");
            return;
        }
        let name = params[0].clone();
        let authorized = self
            .config
            .links
            .iter()
            .find(|link| link.name == name)
            .map(|link| Some(link.password.as_str()) == connection.pending_pass.as_deref())
            .unwrap_or(false);
        if !authorized {
            self.close_connection(conn, "Access denied");
            return;
        }
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.kind = ConnectionKind::Service(name.clone());
        }
        info!(service = %name, "service registered");
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    fn handle_user_message(&mut self, user: Uuid, msg: Message) {
        let command = msg.command.to_ascii_uppercase();
        let Some(entries) = self.registry.commands.user_commands.get(&command).cloned() else {
            self.send_numeric(
                user,
                numerics::ERR_UNKNOWNCOMMAND,
                vec![command, "Unknown command".to_string()],
            );
            return;
        };

        let mut ctx = CommandContext::new();
        let mut any_eligible = false;
        for entry in entries {
            if entry.handler.for_registered() == Some(false) {
                continue;
            }
            any_eligible = true;
            let Some(mut data) = entry.handler.parse_params(
                self,
                &mut ctx,
                user,
                &msg.params,
                msg.prefix.as_deref(),
                &msg.tags,
            ) else {
                continue;
            };

            let affected_users = entry.handler.affected_users(self, user, &data);
            let affected_channels = entry.handler.affected_channels(self, user, &data);
            let filter = ActionFilter {
                users: affected_users,
                channels: affected_channels.iter().map(|c| irc_lower(c)).collect(),
            };
            {
                let mut args = ActionArgs::Command {
                    user,
                    command: command.clone(),
                    data: &mut data,
                };
                let verdict = self.run_action_until_value(
                    &format!("commandpermission-{command}"),
                    &mut args,
                    Some(&filter),
                );
                if matches!(verdict, Some(ActionValue::Bool(false))) {
                    return;
                }
            }
            {
                let mut args = ActionArgs::Command {
                    user,
                    command: command.clone(),
                    data: &mut data,
                };
                self.run_action_processing(
                    &format!("commandmodify-{command}"),
                    &mut args,
                    Some(&filter),
                );
            }
            if entry.handler.resets_idle() {
                if let Some(entity) = self.users.get_mut(&user) {
                    entity.idle_since = now_ts();
                }
            }
            entry.handler.execute(self, user, &mut data);
            return;
        }
        if !any_eligible {
            self.send_numeric(
                user,
                numerics::ERR_ALREADYREGISTERED,
                vec!["You may not reregister".to_string()],
            );
        }
    }

    fn handle_server_message(&mut self, server: &str, msg: Message) {
        let command = msg.command.to_ascii_uppercase();
        let Some(entries) = self.registry.commands.server_commands.get(&command).cloned()
        else {
            debug!(server, command = %command, "unhandled server command");
            return;
        };
        let prefix = msg
            .prefix
            .clone()
            .unwrap_or_else(|| server.to_string());
        for entry in entries {
            let Some(mut data) = entry.handler.parse_params(
                self,
                server,
                &msg.params,
                Some(&prefix),
                &msg.tags,
            ) else {
                continue;
            };
            entry.handler.execute(self, server, &mut data);
            return;
        }
        debug!(server, command = %command, "server command not parsed by any handler");
    }

    // ------------------------------------------------------------------
    // Timers, rehash, shutdown
    // ------------------------------------------------------------------

    fn handle_tick(&mut self) {
        self.prune_recent_windows();
        let now = now_ts();
        let ping_interval = self.config.ping_interval as i64;
        let timeout = self.config.timeout_delay as i64;
        let max_data = self.config.max_data;

        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            // Data checker: 5-second byte window feeding flood control.
            let Some(connection) = self.connections.get_mut(&id) else {
                continue;
            };
            let kind = connection.kind.clone();
            if now - connection.last_data_check >= 5 {
                let bytes = std::mem::take(&mut connection.bytes_in_window);
                connection.last_data_check = now;
                if bytes > max_data {
                    if let ConnectionKind::User(user) = &kind {
                        let user = *user;
                        self.quit_user(user, "Excess flood", None);
                        continue;
                    }
                }
            }

            // Pinger.
            let Some(connection) = self.connections.get_mut(&id) else {
                continue;
            };
            if now < connection.next_ping_at {
                continue;
            }
            connection.next_ping_at = now + ping_interval;
            let last = connection.last_message_at;
            let accepted = connection.accepted_at;
            match kind {
                ConnectionKind::Unregistered => {
                    if now - accepted > self.config.client_timeout as i64 {
                        self.close_connection(id, "Registration timeout");
                    } else if now - last > timeout {
                        self.close_connection(id, "Ping timeout");
                    } else {
                        let name = self.config.hostname.clone();
                        let ping =
                            Message::with_prefix(name.clone(), "PING", vec![name]);
                        self.send_to_conn(id, &ping);
                    }
                }
                ConnectionKind::Service(_) => {
                    if now - last > timeout {
                        self.close_connection(id, "Ping timeout");
                    } else {
                        let name = self.server_name().to_string();
                        let ping =
                            Message::with_prefix(name.clone(), "PING", vec![name]);
                        self.send_to_conn(id, &ping);
                    }
                }
                ConnectionKind::User(user) => {
                    let mut args = ActionArgs::User { user };
                    self.run_action_standard("pinguser", &mut args, None);
                }
                ConnectionKind::Server(server) => {
                    let mut args = ActionArgs::Server { server };
                    self.run_action_standard("pingserver", &mut args, None);
                }
            }
        }

        if now % 60 == 0 {
            self.storage.flush();
        }
    }

    async fn handle_rehash(&mut self) {
        info!(path = %self.config_path, "rehash");
        let new_config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "rehash aborted: config reload failed");
                return;
            }
        };
        for record in self.registry.modules.values() {
            if let Err(e) = record.module.verify_config(&new_config) {
                error!(module = record.module.name(), error = %e, "rehash aborted");
                return;
            }
        }

        // Rebind only the endpoints that changed.
        let mut wanted: Vec<(ListenerKind, String)> = new_config
            .bind_client
            .iter()
            .map(|d| (ListenerKind::Client, d.clone()))
            .collect();
        wanted.extend(
            new_config
                .bind_server
                .iter()
                .map(|d| (ListenerKind::Server, d.clone())),
        );
        let current: Vec<(ListenerKind, String)> = self.bound_ports.keys().cloned().collect();
        for key in &current {
            if !wanted.contains(key) {
                if let Some(handle) = self.bound_ports.remove(key) {
                    handle.abort();
                    info!(desc = %key.1, "unbound");
                }
            }
        }
        self.config = new_config;
        for key in wanted {
            if self.bound_ports.contains_key(&key) {
                continue;
            }
            match bind_endpoint(&key.1, key.0, self.event_tx.clone()).await {
                Ok(handle) => {
                    self.bound_ports.insert(key, handle);
                }
                Err(e) => error!(desc = %key.1, error = %e, "could not bind"),
            }
        }

        let records: Vec<_> = self
            .registry
            .modules
            .values()
            .map(|record| std::rc::Rc::clone(&record.module))
            .collect();
        for module in records {
            module.on_rehash(self);
        }
    }

    fn handle_shutdown(&mut self) {
        info!("shutting down");
        self.shutting_down = true;
        let locals: Vec<Uuid> = self
            .users
            .values()
            .filter(|u| u.is_local())
            .map(|u| u.uuid)
            .collect();
        for user in locals {
            self.quit_user(user, "Server shutting down", None);
        }
        let remaining: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn in remaining {
            self.close_connection(conn, "Server shutting down");
        }
        for (_, handle) in self.bound_ports.drain() {
            handle.abort();
        }
        let channel_keys: Vec<String> = self.channels.keys().cloned().collect();
        for key in channel_keys {
            if let Some(channel) = self.channels.get(&key) {
                channel.log.close();
            }
        }
        self.storage.flush();
    }
}

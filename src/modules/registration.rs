//! Nick changes and quits, for users and for the server-to-server link.
//!
//! Initial registration (the NICK/USER handshake) lives in the dispatcher;
//! these commands cover the registered side: nick changes, quits, and the
//! peer-originated UID/NICK/QUIT traffic.

use std::collections::HashMap;
use std::rc::Rc;

use modircd_proto::{numerics, Message, Tag};
use tracing::warn;
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::hooks::ActionArgs;
use crate::modules::{Module, ServerCommandDef, UserCommandDef};
use crate::state::user::is_valid_nick;
use crate::state::{now_ts, Ircd, User};

const NICK_MAX_LEN: usize = 32;

pub struct NickCommand;

impl Module for NickCommand {
    fn name(&self) -> &'static str {
        "NickCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![UserCommandDef {
            command: "NICK",
            priority: 1,
            handler: Rc::new(UserNick),
        }]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![
            ServerCommandDef {
                command: "NICK",
                priority: 1,
                handler: Rc::new(ServerNick),
            },
            ServerCommandDef {
                command: "UID",
                priority: 1,
                handler: Rc::new(ServerUid),
            },
        ]
    }
}

/// Rewire the nick tables and tell everyone who shares a channel.
fn change_nick(ircd: &mut Ircd, user: Uuid, new_nick: &str, from_server: Option<&str>) {
    let Some(entity) = ircd.users.get(&user) else {
        return;
    };
    let old_nick = entity.nick.clone();
    let old_hostmask = entity.hostmask();
    let channels = entity.channels.clone();

    if ircd.user_nicks.get(&old_nick) == Some(&user) {
        ircd.user_nicks.remove(&old_nick);
    }
    ircd.user_nicks.insert(new_nick, user);
    if let Some(entity) = ircd.users.get_mut(&user) {
        entity.nick = new_nick.to_string();
    }

    let announce = Message::with_prefix(old_hostmask, "NICK", vec![new_nick.to_string()]);
    let mut notified: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
    notified.insert(user);
    ircd.send_to_user(user, &announce);
    for channel_name in &channels {
        let members: Vec<Uuid> = ircd
            .channels
            .get(channel_name)
            .map(|c| c.members.keys().copied().collect())
            .unwrap_or_default();
        for member in members {
            if notified.insert(member) {
                ircd.send_to_user(member, &announce);
            }
        }
    }

    let wire = Message::with_prefix(user.to_string(), "NICK", vec![new_nick.to_string()]);
    ircd.broadcast_to_servers(from_server, &wire);

    // The nick is part of every hostmask, so ban caches must be redone.
    let mut args = ActionArgs::User { user };
    ircd.run_action_standard("updateuserbancache", &mut args, None);
}

struct UserNick;

impl UserCommand for UserNick {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let Some(nick) = params.first().filter(|n| !n.is_empty()).cloned() else {
            ctx.send_single_error(
                ircd,
                user,
                "NickCmd",
                numerics::ERR_NONICKNAMEGIVEN,
                vec!["No nickname given".to_string()],
            );
            return None;
        };
        if !is_valid_nick(&nick, NICK_MAX_LEN) {
            ctx.send_single_error(
                ircd,
                user,
                "NickCmd",
                numerics::ERR_ERRONEUSNICKNAME,
                vec![nick, "Erroneous nickname".to_string()],
            );
            return None;
        }
        if let Some(holder) = ircd.find_user_by_nick(&nick) {
            // A case-only change of one's own nick is allowed.
            if holder != user {
                ctx.send_single_error(
                    ircd,
                    user,
                    "NickCmd",
                    numerics::ERR_NICKNAMEINUSE,
                    vec![nick, "Nickname is already in use".to_string()],
                );
                return None;
            }
        }
        Some(CommandData {
            new_nick: Some(nick),
            ..CommandData::default()
        })
    }

    fn affected_users(&self, _ircd: &Ircd, user: Uuid, _data: &CommandData) -> Vec<Uuid> {
        vec![user]
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        let Some(new_nick) = data.new_nick.take() else {
            return false;
        };
        if ircd.users.get(&user).map(|u| u.nick == new_nick).unwrap_or(true) {
            return true;
        }
        change_nick(ircd, user, &new_nick, None);
        true
    }
}

pub struct QuitCommand;

impl Module for QuitCommand {
    fn name(&self) -> &'static str {
        "QuitCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![UserCommandDef {
            command: "QUIT",
            priority: 1,
            handler: Rc::new(UserQuit),
        }]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![ServerCommandDef {
            command: "QUIT",
            priority: 1,
            handler: Rc::new(ServerQuit),
        }]
    }
}

struct UserQuit;

impl UserCommand for UserQuit {
    fn resets_idle(&self) -> bool {
        false
    }

    fn parse_params(
        &self,
        _ircd: &mut Ircd,
        _ctx: &mut CommandContext,
        _user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        Some(CommandData {
            reason: params.first().cloned(),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        let reason = match data.reason.take() {
            Some(text) if !text.is_empty() => format!("Quit: {text}"),
            _ => "Client quit".to_string(),
        };
        ircd.quit_user(user, &reason, None);
        true
    }
}

struct ServerQuit;

impl ServerCommand for ServerQuit {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let prefix = prefix?;
        let Some(user) = prefix.parse::<Uuid>().ok().filter(|u| ircd.users.contains_key(u))
        else {
            if ircd.recently_quit_users.contains_key(prefix) {
                return Some(CommandData {
                    lost_source: true,
                    ..CommandData::default()
                });
            }
            return None;
        };
        Some(CommandData {
            target_user: Some(user),
            reason: params.first().cloned(),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source {
            return true;
        }
        let Some(user) = data.target_user else {
            return false;
        };
        let reason = data.reason.clone().unwrap_or_else(|| "Quit".to_string());
        ircd.quit_user(user, &reason, Some(server));
        true
    }
}

struct ServerNick;

impl ServerCommand for ServerNick {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let prefix = prefix?;
        if params.is_empty() {
            return None;
        }
        let Some(user) = prefix.parse::<Uuid>().ok().filter(|u| ircd.users.contains_key(u))
        else {
            if ircd.recently_quit_users.contains_key(prefix) {
                return Some(CommandData {
                    lost_source: true,
                    ..CommandData::default()
                });
            }
            return None;
        };
        Some(CommandData {
            target_user: Some(user),
            new_nick: Some(params[0].clone()),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source {
            return true;
        }
        let (Some(user), Some(new_nick)) = (data.target_user, data.new_nick.take()) else {
            return false;
        };
        if let Some(holder) = ircd.find_user_by_nick(&new_nick) {
            if holder != user {
                // Cross-link nick race; dropping the change keeps our side
                // consistent and the window tolerance absorbs the rest.
                warn!(nick = %new_nick, "remote nick change collides, dropped");
                return true;
            }
        }
        change_nick(ircd, user, &new_nick, Some(server));
        true
    }
}

struct ServerUid;

impl ServerCommand for ServerUid {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let prefix = prefix?;
        if params.len() < 6 {
            return None;
        }
        if !ircd.servers.contains_key(prefix) {
            if ircd.recently_quit_servers.contains_key(prefix) {
                return Some(CommandData {
                    lost_source: true,
                    ..CommandData::default()
                });
            }
            return None;
        }
        Some(CommandData {
            source_server: Some(prefix.to_string()),
            params: params.to_vec(),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source {
            return true;
        }
        let fields = std::mem::take(&mut data.params);
        if fields.len() < 6 {
            return false;
        }
        let Ok(uuid) = fields[0].parse::<Uuid>() else {
            return false;
        };
        let (nick, ident, host, real_host, gecos) =
            (&fields[1], &fields[2], &fields[3], &fields[4], &fields[5]);
        if ircd.users.contains_key(&uuid) {
            return true;
        }
        if ircd.user_nicks.contains_key(nick) {
            warn!(nick = %nick, "remote user collides with existing nick, dropped");
            return true;
        }
        let origin = data.source_server.clone().unwrap_or_else(|| server.to_string());
        let ip = real_host.parse().unwrap_or_else(|_| "0.0.0.0".parse().expect("valid literal"));
        let now = now_ts();
        let user = User {
            uuid,
            nick: nick.to_string(),
            ident: ident.to_string(),
            gecos: gecos.to_string(),
            ip,
            host: host.to_string(),
            real_host: real_host.to_string(),
            channels: Vec::new(),
            modes: HashMap::new(),
            metadata: HashMap::new(),
            cache: HashMap::new(),
            idle_since: now,
            signon_at: now,
            local_only: false,
            server: origin,
            conn: None,
        };
        ircd.users.insert(uuid, user);
        ircd.user_nicks.insert(nick, uuid);

        let mut args = ActionArgs::User { user: uuid };
        ircd.run_action_standard("remoteregister", &mut args, None);
        if !ircd.users.contains_key(&uuid) {
            return true;
        }

        let wire = Message::with_prefix(
            data.source_server.clone().unwrap_or_default(),
            "UID",
            fields,
        );
        ircd.broadcast_to_servers(Some(server), &wire);
        true
    }
}

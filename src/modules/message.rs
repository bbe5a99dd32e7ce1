//! PRIVMSG and NOTICE.
//!
//! Targets are split into channels and nicks at parse time; the
//! `commandmodify-*` hooks (the ban engine among them) may strip channel
//! targets before delivery. NOTICE follows the RFC rule of never
//! generating error replies.

use std::rc::Rc;

use modircd_proto::{irc_lower, numerics, Message, Tag};
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::modules::{Module, ServerCommandDef, UserCommandDef};
use crate::state::Ircd;

pub struct MessageCommands;

impl Module for MessageCommands {
    fn name(&self) -> &'static str {
        "MessageCommands"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![
            UserCommandDef {
                command: "PRIVMSG",
                priority: 1,
                handler: Rc::new(UserMessage { command: "PRIVMSG" }),
            },
            UserCommandDef {
                command: "NOTICE",
                priority: 1,
                handler: Rc::new(UserMessage { command: "NOTICE" }),
            },
        ]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![
            ServerCommandDef {
                command: "PRIVMSG",
                priority: 1,
                handler: Rc::new(ServerMessage { command: "PRIVMSG" }),
            },
            ServerCommandDef {
                command: "NOTICE",
                priority: 1,
                handler: Rc::new(ServerMessage { command: "NOTICE" }),
            },
        ]
    }
}

struct UserMessage {
    command: &'static str,
}

impl UserCommand for UserMessage {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let quiet = self.command == "NOTICE";
        if params.len() < 2 || params[1].is_empty() {
            if !quiet {
                ctx.send_single_error(
                    ircd,
                    user,
                    "MsgCmd",
                    numerics::ERR_NEEDMOREPARAMS,
                    vec![self.command.to_string(), "Not enough parameters".to_string()],
                );
            }
            return None;
        }
        let text = params[1].clone();
        let mut data = CommandData::default();
        for target in params[0].split(',') {
            if target.is_empty() {
                continue;
            }
            if target.starts_with('#') {
                let key = irc_lower(target);
                if !ircd.channels.contains_key(&key) {
                    if !quiet {
                        ctx.send_single_error(
                            ircd,
                            user,
                            "MsgCmd",
                            numerics::ERR_NOSUCHCHANNEL,
                            vec![target.to_string(), "No such channel".to_string()],
                        );
                    }
                    continue;
                }
                data.target_chans.push((key, text.clone()));
            } else {
                let Some(found) = ircd.find_user_by_nick(target) else {
                    if !quiet {
                        ctx.send_single_error(
                            ircd,
                            user,
                            "MsgCmd",
                            numerics::ERR_NOSUCHNICK,
                            vec![target.to_string(), "No such nick".to_string()],
                        );
                    }
                    continue;
                };
                data.target_users.push((found, text.clone()));
            }
        }
        if data.target_chans.is_empty() && data.target_users.is_empty() {
            return None;
        }
        Some(data)
    }

    fn affected_users(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<Uuid> {
        data.target_users.iter().map(|(target, _)| *target).collect()
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<String> {
        data.target_chans.iter().map(|(key, _)| key.clone()).collect()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        for (key, text) in std::mem::take(&mut data.target_chans) {
            ircd.deliver_channel_message(user, &key, self.command, &text, None);
        }
        let prefix = ircd
            .users
            .get(&user)
            .map(|u| u.hostmask())
            .unwrap_or_default();
        for (target, text) in std::mem::take(&mut data.target_users) {
            deliver_to_user(ircd, &prefix, user, target, self.command, &text, None);
        }
        true
    }
}

/// Local targets get the line directly; remote targets are forwarded
/// toward their server with uuids on the wire.
fn deliver_to_user(
    ircd: &mut Ircd,
    display_prefix: &str,
    source: Uuid,
    target: Uuid,
    command: &str,
    text: &str,
    from_server: Option<&str>,
) {
    let Some(entity) = ircd.users.get(&target) else {
        return;
    };
    if entity.is_local() {
        let nick = entity.nick.clone();
        let msg = Message::with_prefix(
            display_prefix.to_string(),
            command,
            vec![nick, text.to_string()],
        );
        ircd.send_to_user(target, &msg);
        return;
    }
    let server = entity.server.clone();
    if Some(server.as_str()) == from_server {
        return;
    }
    if let Some(conn) = ircd.server_link_conn(&server) {
        let wire = Message::with_prefix(
            source.to_string(),
            command,
            vec![target.to_string(), text.to_string()],
        );
        ircd.send_to_conn(conn, &wire);
    }
}

struct ServerMessage {
    command: &'static str,
}

impl ServerCommand for ServerMessage {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let prefix = prefix?;
        if params.len() < 2 {
            return None;
        }
        let Some(source) = prefix.parse::<Uuid>().ok().filter(|u| ircd.users.contains_key(u))
        else {
            if ircd.recently_quit_users.contains_key(prefix) {
                return Some(CommandData {
                    lost_source: true,
                    ..CommandData::default()
                });
            }
            return None;
        };
        let mut data = CommandData {
            source_user: Some(source),
            text: Some(params[1].clone()),
            ..CommandData::default()
        };
        let target = &params[0];
        if target.starts_with('#') {
            let key = irc_lower(target);
            if !ircd.channels.contains_key(&key) {
                if ircd.recently_destroyed_channels.contains_key(&key) {
                    data.lost_target = true;
                    return Some(data);
                }
                return None;
            }
            data.channel = Some(key);
        } else {
            let Some(found) = target.parse::<Uuid>().ok().filter(|u| ircd.users.contains_key(u))
            else {
                if ircd.recently_quit_users.contains_key(target.as_str()) {
                    data.lost_target = true;
                    return Some(data);
                }
                return None;
            };
            data.target_user = Some(found);
        }
        Some(data)
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source || data.lost_target {
            return true;
        }
        let (Some(source), Some(text)) = (data.source_user, data.text.take()) else {
            return false;
        };
        if let Some(key) = data.channel.take() {
            ircd.deliver_channel_message(source, &key, self.command, &text, Some(server));
            return true;
        }
        if let Some(target) = data.target_user {
            let prefix = ircd
                .users
                .get(&source)
                .map(|u| u.hostmask())
                .unwrap_or_else(|| source.to_string());
            deliver_to_user(ircd, &prefix, source, target, self.command, &text, Some(server));
            return true;
        }
        false
    }
}

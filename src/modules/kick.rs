//! KICK, with rank checking and network propagation.

use std::rc::Rc;

use modircd_proto::{irc_lower, numerics, Message, Tag};
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::hooks::{ActionArgs, ActionFilter, ActionValue, LeaveDetail, LeaveType};
use crate::modules::{ActionDef, Module, ServerCommandDef, UserCommandDef};
use crate::state::Ircd;

pub struct KickCommand;

impl Module for KickCommand {
    fn name(&self) -> &'static str {
        "KickCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![
            ActionDef {
                action: "commandpermission-KICK".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| check_kick_level(ircd, args)),
                scope: None,
            },
            ActionDef {
                action: "leavemessage".to_string(),
                priority: 101,
                func: Rc::new(|ircd, args| {
                    broadcast_kick(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "leavemessage".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| {
                    send_kick_message(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "buildisupport".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::Isupport { tokens } = args {
                        tokens.push((
                            "KICKLEN".to_string(),
                            Some(ircd.config.kick_length.to_string()),
                        ));
                    }
                    None
                }),
                scope: None,
            },
        ]
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![UserCommandDef {
            command: "KICK",
            priority: 1,
            handler: Rc::new(UserKick),
        }]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![ServerCommandDef {
            command: "KICK",
            priority: 1,
            handler: Rc::new(ServerKick),
        }]
    }
}

fn check_kick_level(ircd: &mut Ircd, args: &mut ActionArgs<'_>) -> Option<ActionValue> {
    let ActionArgs::Command { user, data, .. } = args else {
        return None;
    };
    let user = *user;
    let Some(channel_key) = data.channel.clone() else {
        return None;
    };
    let Some(target) = data.target_user else {
        return None;
    };
    let (display, is_member, actor_rank, target_rank) = {
        let Some(channel) = ircd.channels.get(&channel_key) else {
            return None;
        };
        (
            channel.name.clone(),
            channel.members.contains_key(&user),
            channel.user_rank(&ircd.registry.modes, user),
            channel.user_rank(&ircd.registry.modes, target),
        )
    };
    if !is_member {
        ircd.send_numeric(
            user,
            numerics::ERR_NOTONCHANNEL,
            vec![display, "You're not on that channel".to_string()],
        );
        return Some(ActionValue::Bool(false));
    }
    if actor_rank < target_rank {
        ircd.send_numeric(
            user,
            numerics::ERR_CHANOPRIVSNEEDED,
            vec![
                display,
                "You don't have permission to kick this user".to_string(),
            ],
        );
        return Some(ActionValue::Bool(false));
    }
    let filter = ActionFilter {
        users: vec![user],
        channels: vec![channel_key.clone()],
    };
    let mut level_args = ActionArgs::ChannelLevel {
        level_type: "kick".to_string(),
        channel: channel_key.clone(),
        user,
    };
    let allowed = ircd
        .run_action_until_value("checkchannellevel", &mut level_args, Some(&filter))
        .map(|v| v.truthy())
        .unwrap_or(false);
    if !allowed {
        ircd.send_numeric(
            user,
            numerics::ERR_CHANOPRIVSNEEDED,
            vec![
                display.clone(),
                format!("You don't have permission to kick users from {display}"),
            ],
        );
        return Some(ActionValue::Bool(false));
    }
    None
}

fn broadcast_kick(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::Leave {
        channel,
        user,
        leave_type: LeaveType::Kick,
        detail,
        from_server,
        ..
    } = args
    else {
        return;
    };
    let display = ircd
        .channels
        .get(channel)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| channel.clone());
    let prefix = match (&detail.by_user, &detail.by_server) {
        (Some(by), _) => by.to_string(),
        (None, Some(server)) => server.clone(),
        (None, None) => return,
    };
    let wire = Message::with_prefix(
        prefix,
        "KICK",
        vec![display, user.to_string(), detail.reason.clone()],
    );
    ircd.broadcast_to_servers(from_server.as_deref(), &wire);
}

fn send_kick_message(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::Leave {
        send_list,
        channel,
        user,
        leave_type: LeaveType::Kick,
        detail,
        ..
    } = args
    else {
        return;
    };
    let display = ircd
        .channels
        .get(channel)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| channel.clone());
    let prefix = match (&detail.by_user, &detail.by_server) {
        (Some(by), _) => ircd
            .users
            .get(by)
            .map(|u| u.hostmask())
            .unwrap_or_else(|| by.to_string()),
        (None, Some(server)) => ircd.display_prefix(server),
        (None, None) => return,
    };
    let target_nick = ircd
        .users
        .get(user)
        .map(|u| u.nick.clone())
        .unwrap_or_else(|| user.to_string());
    let msg = Message::with_prefix(
        prefix,
        "KICK",
        vec![display, target_nick, detail.reason.clone()],
    );
    for target in send_list.drain(..) {
        ircd.send_to_user(target, &msg);
    }
}

struct UserKick;

impl UserCommand for UserKick {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        if params.len() < 2 {
            ctx.send_single_error(
                ircd,
                user,
                "KickCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["KICK".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        }
        let key = irc_lower(&params[0]);
        if !ircd.channels.contains_key(&key) {
            ctx.send_single_error(
                ircd,
                user,
                "KickCmd",
                numerics::ERR_NOSUCHCHANNEL,
                vec![params[0].clone(), "No such channel".to_string()],
            );
            return None;
        }
        let Some(target) = ircd.find_user_by_nick(&params[1]) else {
            ctx.send_single_error(
                ircd,
                user,
                "KickCmd",
                numerics::ERR_NOSUCHNICK,
                vec![params[1].clone(), "No such nick".to_string()],
            );
            return None;
        };
        let (display, target_member) = {
            let channel = ircd.channels.get(&key).expect("checked above");
            (channel.name.clone(), channel.members.contains_key(&target))
        };
        if !target_member {
            let target_nick = ircd
                .users
                .get(&target)
                .map(|u| u.nick.clone())
                .unwrap_or_default();
            ctx.send_single_error(
                ircd,
                user,
                "KickCmd",
                numerics::ERR_USERNOTINCHANNEL,
                vec![
                    target_nick,
                    display,
                    "They are not on that channel".to_string(),
                ],
            );
            return None;
        }
        let mut reason = params.get(2).cloned().unwrap_or_else(|| {
            ircd.users
                .get(&user)
                .map(|u| u.nick.clone())
                .unwrap_or_default()
        });
        reason.truncate(ircd.config.kick_length);
        Some(CommandData {
            channel: Some(key),
            target_user: Some(target),
            reason: Some(reason),
            ..CommandData::default()
        })
    }

    fn affected_users(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<Uuid> {
        data.target_user.iter().copied().collect()
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<String> {
        data.channel.iter().cloned().collect()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        let (Some(channel), Some(target), Some(reason)) =
            (data.channel.take(), data.target_user, data.reason.take())
        else {
            return false;
        };
        ircd.leave_channel(
            target,
            &channel,
            LeaveType::Kick,
            LeaveDetail {
                by_user: Some(user),
                by_server: None,
                reason,
            },
            None,
        );
        true
    }
}

struct ServerKick;

impl ServerCommand for ServerKick {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let prefix = prefix?;
        if params.len() != 3 {
            return None;
        }
        let mut data = CommandData::default();
        if let Some(user) = prefix.parse::<Uuid>().ok().filter(|u| ircd.users.contains_key(u)) {
            data.source_user = Some(user);
        } else if ircd.servers.contains_key(prefix) {
            data.source_server = Some(prefix.to_string());
        } else if ircd.recently_quit_users.contains_key(prefix)
            || ircd.recently_quit_servers.contains_key(prefix)
        {
            data.lost_source = true;
            return Some(data);
        } else {
            return None;
        }
        let key = irc_lower(&params[0]);
        if !ircd.channels.contains_key(&key) {
            if ircd.recently_destroyed_channels.contains_key(&key) {
                data.lost_target = true;
                return Some(data);
            }
            return None;
        }
        let Some(target) = params[1].parse::<Uuid>().ok().filter(|u| ircd.users.contains_key(u))
        else {
            if ircd.recently_quit_users.contains_key(params[1].as_str()) {
                data.lost_target = true;
                return Some(data);
            }
            return None;
        };
        data.channel = Some(key);
        data.target_user = Some(target);
        data.reason = Some(params[2].clone());
        Some(data)
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source || data.lost_target {
            return true;
        }
        let (Some(channel), Some(target), Some(reason)) =
            (data.channel.take(), data.target_user, data.reason.take())
        else {
            return false;
        };
        ircd.leave_channel(
            target,
            &channel,
            LeaveType::Kick,
            LeaveDetail {
                by_user: data.source_user,
                by_server: data.source_server.clone(),
                reason,
            },
            Some(server),
        );
        true
    }
}

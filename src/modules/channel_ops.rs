//! JOIN and PART.
//!
//! Joins are gated by the `joinpermission` action (the ban engine vetoes
//! there); parts route their announcements through `leavemessage` so other
//! modules can reshape delivery.

use std::rc::Rc;

use modircd_proto::{irc_lower, numerics, Message, Tag};
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::hooks::{ActionArgs, ActionFilter, ActionValue, LeaveDetail, LeaveType};
use crate::modules::{ActionDef, Module, ServerCommandDef, UserCommandDef};
use crate::state::channel::is_valid_channel_name;
use crate::state::Ircd;

pub struct JoinCommand;

impl Module for JoinCommand {
    fn name(&self) -> &'static str {
        "JoinCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![
            UserCommandDef {
                command: "JOIN",
                priority: 1,
                handler: Rc::new(UserJoin),
            },
            UserCommandDef {
                command: "NAMES",
                priority: 1,
                handler: Rc::new(UserNames),
            },
        ]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![ServerCommandDef {
            command: "JOIN",
            priority: 1,
            handler: Rc::new(ServerJoin),
        }]
    }
}

struct UserNames;

impl UserCommand for UserNames {
    fn resets_idle(&self) -> bool {
        false
    }

    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let Some(name) = params.first().filter(|p| !p.is_empty()) else {
            ctx.send_single_error(
                ircd,
                user,
                "NamesCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["NAMES".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        };
        let key = irc_lower(name);
        if !ircd.channels.contains_key(&key) {
            ctx.send_single_error(
                ircd,
                user,
                "NamesCmd",
                numerics::ERR_NOSUCHCHANNEL,
                vec![name.to_string(), "No such channel".to_string()],
            );
            return None;
        }
        Some(CommandData {
            channel: Some(key),
            ..CommandData::default()
        })
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<String> {
        data.channel.iter().cloned().collect()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        let Some(key) = data.channel.take() else {
            return false;
        };
        ircd.send_names_reply(user, &key);
        true
    }
}

struct UserJoin;

impl UserCommand for UserJoin {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let Some(raw) = params.first().filter(|p| !p.is_empty()) else {
            ctx.send_single_error(
                ircd,
                user,
                "JoinCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["JOIN".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        };
        let mut target_chans = Vec::new();
        for name in raw.split(',') {
            if !is_valid_channel_name(name) {
                ctx.send_single_error(
                    ircd,
                    user,
                    "JoinCmd",
                    numerics::ERR_NOSUCHCHANNEL,
                    vec![name.to_string(), "No such channel".to_string()],
                );
                continue;
            }
            target_chans.push((name.to_string(), String::new()));
        }
        if target_chans.is_empty() {
            return None;
        }
        Some(CommandData {
            target_chans,
            ..CommandData::default()
        })
    }

    fn affected_users(&self, _ircd: &Ircd, user: Uuid, _data: &CommandData) -> Vec<Uuid> {
        vec![user]
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<String> {
        data.target_chans.iter().map(|(name, _)| name.clone()).collect()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        for (name, _) in std::mem::take(&mut data.target_chans) {
            let key = irc_lower(&name);
            let already = ircd
                .channels
                .get(&key)
                .map(|c| c.members.contains_key(&user))
                .unwrap_or(false);
            if already {
                continue;
            }
            let filter = ActionFilter {
                users: vec![user],
                channels: vec![key.clone()],
            };
            let mut args = ActionArgs::ChannelUser {
                channel: key.clone(),
                user,
            };
            let verdict = ircd.run_action_until_value("joinpermission", &mut args, Some(&filter));
            if matches!(verdict, Some(ActionValue::Bool(false))) {
                continue;
            }
            ircd.join_channel(user, &name, None);
        }
        true
    }
}

struct ServerJoin;

impl ServerCommand for ServerJoin {
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
            channel: Some(params[0].clone()),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source {
            return true;
        }
        let (Some(user), Some(channel)) = (data.target_user, data.channel.take()) else {
            return false;
        };
        ircd.join_channel(user, &channel, Some(server));
        true
    }
}

pub struct PartCommand;

impl Module for PartCommand {
    fn name(&self) -> &'static str {
        "PartCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![
            ActionDef {
                action: "leavemessage".to_string(),
                priority: 101,
                func: Rc::new(|ircd, args| {
                    broadcast_part(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "leavemessage".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| {
                    send_part_message(ircd, args);
                    None
                }),
                scope: None,
            },
        ]
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![UserCommandDef {
            command: "PART",
            priority: 1,
            handler: Rc::new(UserPart),
        }]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![ServerCommandDef {
            command: "PART",
            priority: 1,
            handler: Rc::new(ServerPart),
        }]
    }
}

fn broadcast_part(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::Leave {
        channel,
        user,
        leave_type: LeaveType::Part,
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
    let wire = Message::with_prefix(
        user.to_string(),
        "PART",
        vec![display, detail.reason.clone()],
    );
    ircd.broadcast_to_servers(from_server.as_deref(), &wire);
}

fn send_part_message(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::Leave {
        send_list,
        channel,
        user,
        leave_type: LeaveType::Part,
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
    let prefix = ircd
        .users
        .get(user)
        .map(|u| u.hostmask())
        .unwrap_or_else(|| user.to_string());
    let msg = Message::with_prefix(prefix, "PART", vec![display, detail.reason.clone()]);
    for target in send_list.drain(..) {
        ircd.send_to_user(target, &msg);
    }
}

struct UserPart;

impl UserCommand for UserPart {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let Some(name) = params.first().filter(|p| !p.is_empty()).cloned() else {
            ctx.send_single_error(
                ircd,
                user,
                "PartCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["PART".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        };
        let key = irc_lower(&name);
        let Some(channel) = ircd.channels.get(&key) else {
            ctx.send_single_error(
                ircd,
                user,
                "PartCmd",
                numerics::ERR_NOSUCHCHANNEL,
                vec![name, "No such channel".to_string()],
            );
            return None;
        };
        if !channel.members.contains_key(&user) {
            let display = channel.name.clone();
            ctx.send_single_error(
                ircd,
                user,
                "PartCmd",
                numerics::ERR_NOTONCHANNEL,
                vec![display, "You're not on that channel".to_string()],
            );
            return None;
        }
        let mut reason = params
            .get(1)
            .cloned()
            .unwrap_or_else(|| {
                ircd.users
                    .get(&user)
                    .map(|u| u.nick.clone())
                    .unwrap_or_default()
            });
        reason.truncate(ircd.config.part_message_length);
        Some(CommandData {
            channel: Some(key),
            reason: Some(reason),
            ..CommandData::default()
        })
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<String> {
        data.channel.iter().cloned().collect()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        let (Some(channel), Some(reason)) = (data.channel.take(), data.reason.take()) else {
            return false;
        };
        ircd.leave_channel(
            user,
            &channel,
            LeaveType::Part,
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

struct ServerPart;

impl ServerCommand for ServerPart {
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
        let key = irc_lower(&params[0]);
        if !ircd.channels.contains_key(&key) {
            if ircd.recently_destroyed_channels.contains_key(&key) {
                return Some(CommandData {
                    lost_target: true,
                    ..CommandData::default()
                });
            }
            return None;
        }
        Some(CommandData {
            target_user: Some(user),
            channel: Some(key),
            reason: params.get(1).cloned(),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source || data.lost_target {
            return true;
        }
        let (Some(user), Some(channel)) = (data.target_user, data.channel.take()) else {
            return false;
        };
        let reason = data.reason.take().unwrap_or_default();
        ircd.leave_channel(
            user,
            &channel,
            LeaveType::Part,
            LeaveDetail {
                by_user: Some(user),
                by_server: None,
                reason,
            },
            Some(server),
        );
        true
    }
}

//! The MODE command, for channels and for the user's own modes.

use std::rc::Rc;

use modircd_proto::{irc_lower, numerics, Tag};
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::hooks::{ActionArgs, ActionFilter, ActionValue};
use crate::modes::{ModeCategory, ModeChangeRequest};
use crate::modules::{Module, ServerCommandDef, UserCommandDef};
use crate::state::channel::ModeValue;
use crate::state::Ircd;

pub struct ModeCommand;

impl Module for ModeCommand {
    fn name(&self) -> &'static str {
        "ModeCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![UserCommandDef {
            command: "MODE",
            priority: 1,
            handler: Rc::new(UserMode),
        }]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![ServerCommandDef {
            command: "MODE",
            priority: 1,
            handler: Rc::new(ServerMode),
        }]
    }
}

/// Split a mode string plus trailing params into change requests. List
/// modes queried while adding with no parameter left become list queries
/// (ban list display and friends).
fn parse_channel_modes(
    ircd: &Ircd,
    modestring: &str,
    params: &[String],
) -> (Vec<ModeChangeRequest>, Vec<char>) {
    let mut requests = Vec::new();
    let mut queries = Vec::new();
    let mut adding = true;
    let mut param_iter = params.iter();
    for letter in modestring.chars() {
        match letter {
            '+' => adding = true,
            '-' => adding = false,
            letter => {
                let category = ircd.registry.modes.channel_mode_category(letter);
                let wants_param = match category {
                    Some(ModeCategory::Status) => true,
                    Some(ModeCategory::ParamOnUnset) => true,
                    Some(ModeCategory::Param) => adding,
                    Some(ModeCategory::List) => true,
                    Some(ModeCategory::NoParam) | None => false,
                };
                let param = if wants_param {
                    param_iter.next().cloned()
                } else {
                    None
                };
                if category == Some(ModeCategory::List) && adding && param.is_none() {
                    queries.push(letter);
                    continue;
                }
                if wants_param && param.is_none() {
                    continue;
                }
                requests.push(ModeChangeRequest {
                    adding,
                    letter,
                    param,
                });
            }
        }
    }
    (requests, queries)
}

struct UserMode;

impl UserCommand for UserMode {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        _prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let Some(target) = params.first().filter(|t| !t.is_empty()).cloned() else {
            ctx.send_single_error(
                ircd,
                user,
                "ModeCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["MODE".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        };
        if target.starts_with('#') {
            let key = irc_lower(&target);
            if !ircd.channels.contains_key(&key) {
                ctx.send_single_error(
                    ircd,
                    user,
                    "ModeCmd",
                    numerics::ERR_NOSUCHCHANNEL,
                    vec![target, "No such channel".to_string()],
                );
                return None;
            }
            let mut data = CommandData {
                channel: Some(key),
                ..CommandData::default()
            };
            if let Some(modestring) = params.get(1) {
                let (requests, queries) =
                    parse_channel_modes(ircd, modestring, params.get(2..).unwrap_or(&[]));
                data.mode_changes = requests;
                data.text = Some(queries.into_iter().collect());
            }
            return Some(data);
        }
        let Some(found) = ircd.find_user_by_nick(&target) else {
            ctx.send_single_error(
                ircd,
                user,
                "ModeCmd",
                numerics::ERR_NOSUCHNICK,
                vec![target, "No such nick".to_string()],
            );
            return None;
        };
        if found != user {
            ctx.send_single_error(
                ircd,
                user,
                "ModeCmd",
                numerics::ERR_USERSDONTMATCH,
                vec!["Can't change mode for other users".to_string()],
            );
            return None;
        }
        let mut data = CommandData {
            target_user: Some(user),
            ..CommandData::default()
        };
        if let Some(modestring) = params.get(1) {
            let mut adding = true;
            for letter in modestring.chars() {
                match letter {
                    '+' => adding = true,
                    '-' => adding = false,
                    letter => data.mode_changes.push(ModeChangeRequest {
                        adding,
                        letter,
                        param: None,
                    }),
                }
            }
        }
        Some(data)
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, data: &CommandData) -> Vec<String> {
        data.channel.iter().cloned().collect()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        if let Some(key) = data.channel.take() {
            return execute_channel_mode(ircd, user, &key, data);
        }
        if data.target_user == Some(user) {
            if data.mode_changes.is_empty() {
                let modes: String = ircd
                    .users
                    .get(&user)
                    .map(|u| {
                        let mut letters: Vec<char> = u.modes.keys().copied().collect();
                        letters.sort_unstable();
                        letters.into_iter().collect()
                    })
                    .unwrap_or_default();
                ircd.send_numeric(user, numerics::RPL_UMODEIS, vec![format!("+{modes}")]);
                return true;
            }
            let changes = std::mem::take(&mut data.mode_changes);
            ircd.set_user_modes(user, changes, &user.to_string(), None);
            return true;
        }
        false
    }
}

fn execute_channel_mode(ircd: &mut Ircd, user: Uuid, key: &str, data: &mut CommandData) -> bool {
    let queries: Vec<char> = data.text.take().unwrap_or_default().chars().collect();
    for letter in queries {
        if let Some(handler) = ircd.registry.modes.channel_mode_handler(letter) {
            handler.show_list_params(ircd, user, key);
        }
    }
    if data.mode_changes.is_empty() {
        return mode_query_reply(ircd, user, key);
    }

    let (display, is_member, actor_rank) = {
        let Some(channel) = ircd.channels.get(key) else {
            return false;
        };
        (
            channel.name.clone(),
            channel.members.contains_key(&user),
            channel.user_rank(&ircd.registry.modes, user),
        )
    };
    if !is_member {
        ircd.send_numeric(
            user,
            numerics::ERR_NOTONCHANNEL,
            vec![display, "You're not on that channel".to_string()],
        );
        return false;
    }
    let filter = ActionFilter {
        users: vec![user],
        channels: vec![key.to_string()],
    };
    let mut level_args = ActionArgs::ChannelLevel {
        level_type: "mode".to_string(),
        channel: key.to_string(),
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
            vec![display, "You're not channel operator".to_string()],
        );
        return false;
    }

    // Handing out a status above your own needs an explicit override.
    let mut requests = Vec::new();
    for request in std::mem::take(&mut data.mode_changes) {
        if let Some(status) = ircd.registry.modes.channel_statuses.get(&request.letter) {
            let rank = status.rank;
            if actor_rank < rank {
                let mut override_args = ActionArgs::StatusOverride {
                    channel: key.to_string(),
                    user,
                    mode: request.letter,
                    param: request.param.clone().unwrap_or_default(),
                };
                let allowed = ircd
                    .run_action_until_value("channelstatusoverride", &mut override_args, Some(&filter))
                    .map(|v| v.truthy())
                    .unwrap_or(false);
                if !allowed {
                    let display = ircd
                        .channels
                        .get(key)
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    ircd.send_numeric(
                        user,
                        numerics::ERR_CHANOPRIVSNEEDED,
                        vec![
                            display,
                            format!("You don't have permission to set mode +{}", request.letter),
                        ],
                    );
                    continue;
                }
            }
        }
        requests.push(request);
    }
    if !requests.is_empty() {
        ircd.set_channel_modes(key, requests, &user.to_string(), None);
    }
    true
}

/// 324 current modes plus 329 creation time.
fn mode_query_reply(ircd: &mut Ircd, user: Uuid, key: &str) -> bool {
    let Some(channel) = ircd.channels.get(key) else {
        return false;
    };
    let display = channel.name.clone();
    let created = channel.created;
    let mut letters: Vec<(char, Option<String>)> = channel
        .modes
        .iter()
        .filter_map(|(letter, value)| match value {
            ModeValue::Flag => Some((*letter, None)),
            ModeValue::Param(param) => Some((*letter, Some(param.clone()))),
            ModeValue::List(_) => None,
        })
        .collect();
    letters.sort_by_key(|(letter, _)| *letter);
    let mut modestring = String::from("+");
    let mut params = Vec::new();
    for (letter, param) in letters {
        modestring.push(letter);
        if let Some(param) = param {
            params.push(param);
        }
    }
    let mut reply = vec![display.clone(), modestring];
    reply.extend(params);
    ircd.send_numeric(user, numerics::RPL_CHANNELMODEIS, reply);
    ircd.send_numeric(
        user,
        numerics::RPL_CREATIONTIME,
        vec![display, created.to_string()],
    );
    true
}

struct ServerMode;

impl ServerCommand for ServerMode {
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
        // The prefix may be a uuid, a server id, or a channel name (for
        // self-sourced auto-status); departed sources become a no-op.
        if ircd.recently_quit_users.contains_key(prefix)
            || ircd.recently_quit_servers.contains_key(prefix)
        {
            return Some(CommandData {
                lost_source: true,
                ..CommandData::default()
            });
        }
        let target = &params[0];
        let mut data = CommandData {
            source_server: Some(prefix.to_string()),
            ..CommandData::default()
        };
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
            let (requests, _) =
                parse_channel_modes(ircd, &params[1], params.get(2..).unwrap_or(&[]));
            data.mode_changes = requests;
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
            let mut adding = true;
            for letter in params[1].chars() {
                match letter {
                    '+' => adding = true,
                    '-' => adding = false,
                    letter => data.mode_changes.push(ModeChangeRequest {
                        adding,
                        letter,
                        param: None,
                    }),
                }
            }
        }
        Some(data)
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source || data.lost_target {
            return true;
        }
        let source = data.source_server.clone().unwrap_or_default();
        let changes = std::mem::take(&mut data.mode_changes);
        if let Some(key) = data.channel.take() {
            ircd.set_channel_modes(&key, changes, &source, Some(server));
            return true;
        }
        if let Some(target) = data.target_user {
            ircd.set_user_modes(target, changes, &source, Some(server));
            return true;
        }
        false
    }
}

//! TOPIC: query and set, with the `topic` notification action.

use std::rc::Rc;

use modircd_proto::{irc_lower, numerics, Message, Tag};
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::hooks::ActionArgs;
use crate::modules::{Module, ServerCommandDef, UserCommandDef};
use crate::state::channel::Topic;
use crate::state::{now_ts, Ircd};

pub struct TopicCommand;

impl Module for TopicCommand {
    fn name(&self) -> &'static str {
        "TopicCommand"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![UserCommandDef {
            command: "TOPIC",
            priority: 1,
            handler: Rc::new(UserTopic),
        }]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![ServerCommandDef {
            command: "TOPIC",
            priority: 1,
            handler: Rc::new(ServerTopic),
        }]
    }
}

/// Store a topic, fire the `topic` action, announce locally.
fn apply_topic(
    ircd: &mut Ircd,
    key: &str,
    text: String,
    setter_display: String,
    wire_source: String,
    from_server: Option<&str>,
) {
    let old_topic = {
        let Some(channel) = ircd.channels.get_mut(key) else {
            return;
        };
        let old = channel.topic.as_ref().map(|t| t.text.clone());
        channel.topic = Some(Topic {
            text: text.clone(),
            setter: setter_display.clone(),
            set_at: now_ts(),
        });
        old
    };
    let mut args = ActionArgs::Topic {
        channel: key.to_string(),
        setter: setter_display.clone(),
        old_topic,
    };
    ircd.run_action_standard("topic", &mut args, None);

    let (display, members): (String, Vec<Uuid>) = {
        let Some(channel) = ircd.channels.get(key) else {
            return;
        };
        (channel.name.clone(), channel.members.keys().copied().collect())
    };
    let local = Message::with_prefix(setter_display, "TOPIC", vec![display.clone(), text.clone()]);
    for member in members {
        ircd.send_to_user(member, &local);
    }
    let wire = Message::with_prefix(wire_source, "TOPIC", vec![display, text]);
    ircd.broadcast_to_servers(from_server, &wire);
}

struct UserTopic;

impl UserCommand for UserTopic {
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
                "TopicCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["TOPIC".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        };
        let key = irc_lower(&name);
        let Some(channel) = ircd.channels.get(&key) else {
            ctx.send_single_error(
                ircd,
                user,
                "TopicCmd",
                numerics::ERR_NOSUCHCHANNEL,
                vec![name, "No such channel".to_string()],
            );
            return None;
        };
        if params.len() > 1 && !channel.members.contains_key(&user) {
            let display = channel.name.clone();
            ctx.send_single_error(
                ircd,
                user,
                "TopicCmd",
                numerics::ERR_NOTONCHANNEL,
                vec![display, "You're not on that channel".to_string()],
            );
            return None;
        }
        Some(CommandData {
            channel: Some(key),
            text: params.get(1).cloned(),
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
        match data.text.take() {
            None => {
                ircd.send_topic_reply(user, &key, true);
            }
            Some(text) => {
                let setter = ircd
                    .users
                    .get(&user)
                    .map(|u| u.hostmask())
                    .unwrap_or_default();
                apply_topic(ircd, &key, text, setter, user.to_string(), None);
            }
        }
        true
    }
}

struct ServerTopic;

impl ServerCommand for ServerTopic {
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
        if ircd.recently_quit_users.contains_key(prefix)
            || ircd.recently_quit_servers.contains_key(prefix)
        {
            return Some(CommandData {
                lost_source: true,
                ..CommandData::default()
            });
        }
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
            source_server: Some(prefix.to_string()),
            channel: Some(key),
            text: Some(params[1].clone()),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool {
        if data.lost_source || data.lost_target {
            return true;
        }
        let (Some(key), Some(text)) = (data.channel.take(), data.text.take()) else {
            return false;
        };
        let source = data.source_server.clone().unwrap_or_default();
        let setter = ircd.display_prefix(&source);
        apply_topic(ircd, &key, text, setter, source, Some(server));
        true
    }
}

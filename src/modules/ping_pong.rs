//! Liveness checking for users and for server links.
//!
//! The connection timer fires `pinguser`/`pingserver` on the configured
//! interval; the handlers here keep `pingtime`/`pongtime` in the entity
//! caches and disconnect anything whose last pong predates the last ping.

use std::rc::Rc;

use modircd_proto::{numerics, Message, Tag};
use uuid::Uuid;

use crate::commands::{CommandContext, CommandData, ServerCommand, UserCommand};
use crate::hooks::ActionArgs;
use crate::modules::{ActionDef, Module, ServerCommandDef, UserCommandDef};
use crate::state::{now_ts, Ircd};

pub struct PingPong;

impl Module for PingPong {
    fn name(&self) -> &'static str {
        "PingPong"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![
            ActionDef {
                action: "pinguser".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::User { user } = args {
                        ping_user(ircd, *user);
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "pingserver".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::Server { server } = args {
                        ping_server(ircd, server.clone());
                    }
                    None
                }),
                scope: None,
            },
        ]
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        vec![
            UserCommandDef {
                command: "PING",
                priority: 1,
                handler: Rc::new(UserPing),
            },
            UserCommandDef {
                command: "PONG",
                priority: 1,
                handler: Rc::new(UserPong),
            },
        ]
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        vec![
            ServerCommandDef {
                command: "PING",
                priority: 1,
                handler: Rc::new(ServerPing),
            },
            ServerCommandDef {
                command: "PONG",
                priority: 1,
                handler: Rc::new(ServerPong),
            },
        ]
    }
}

enum PingVerdict {
    TimedOut,
    Active,
    SendPing,
}

fn ping_verdict(cache: &mut std::collections::HashMap<String, i64>, idle_since: i64, now: i64) -> PingVerdict {
    if !cache.contains_key("pingtime") || !cache.contains_key("pongtime") {
        cache.insert("pingtime".to_string(), now);
        cache.insert("pongtime".to_string(), now);
    }
    let ping_time = cache["pingtime"];
    let pong_time = cache["pongtime"];
    if pong_time < ping_time {
        return PingVerdict::TimedOut;
    }
    if idle_since > pong_time {
        // Active since the last pong; skip this tick.
        cache.insert("pingtime".to_string(), now);
        cache.insert("pongtime".to_string(), now);
        return PingVerdict::Active;
    }
    cache.insert("pingtime".to_string(), now);
    PingVerdict::SendPing
}

fn ping_user(ircd: &mut Ircd, user: Uuid) {
    let now = now_ts();
    let verdict = {
        let Some(entity) = ircd.users.get_mut(&user) else {
            return;
        };
        let idle_since = entity.idle_since;
        ping_verdict(&mut entity.cache, idle_since, now)
    };
    match verdict {
        PingVerdict::TimedOut => ircd.quit_user(user, "Ping timeout", None),
        PingVerdict::Active => {}
        PingVerdict::SendPing => {
            let name = ircd.server_name().to_string();
            ircd.send_to_user(user, &Message::new("PING", vec![name]));
        }
    }
}

fn ping_server(ircd: &mut Ircd, server: String) {
    let now = now_ts();
    let verdict = {
        let Some(peer) = ircd.servers.get_mut(&server) else {
            return;
        };
        ping_verdict(&mut peer.cache, 0, now)
    };
    match verdict {
        PingVerdict::TimedOut => ircd.quit_server(&server, "Ping timeout", None),
        PingVerdict::Active => {}
        PingVerdict::SendPing => {
            let our_id = ircd.server_id().to_string();
            let conn = ircd.servers.get(&server).and_then(|p| p.conn);
            if let Some(conn) = conn {
                let ping = Message::with_prefix(our_id.clone(), "PING", vec![our_id, server]);
                ircd.send_to_conn(conn, &ping);
            }
        }
    }
}

struct UserPing;

impl UserCommand for UserPing {
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
        let Some(token) = params.first().cloned() else {
            ctx.send_single_error(
                ircd,
                user,
                "PingCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["PING".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        };
        Some(CommandData {
            token: Some(token),
            ..CommandData::default()
        })
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool {
        let token = data.token.take().unwrap_or_default();
        let name = ircd.server_name().to_string();
        let pong = Message::with_prefix(name.clone(), "PONG", vec![name, token]);
        ircd.send_to_user(user, &pong);
        true
    }
}

struct UserPong;

impl UserCommand for UserPong {
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
        if params.is_empty() {
            ctx.send_single_error(
                ircd,
                user,
                "PongCmd",
                numerics::ERR_NEEDMOREPARAMS,
                vec!["PONG".to_string(), "Not enough parameters".to_string()],
            );
            return None;
        }
        Some(CommandData::default())
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, _data: &mut CommandData) -> bool {
        if let Some(entity) = ircd.users.get_mut(&user) {
            entity.cache.insert("pongtime".to_string(), now_ts());
        }
        true
    }
}

/// Resolve a PING/PONG endpoint id against the live and recently-quit
/// server tables.
fn resolve_server_pair(
    ircd: &Ircd,
    params: &[String],
) -> Option<CommandData> {
    if params.len() != 2 {
        return None;
    }
    for id in &params[..2] {
        if id == ircd.server_id() || ircd.servers.contains_key(id.as_str()) {
            continue;
        }
        if ircd.recently_quit_servers.contains_key(id.as_str()) {
            return Some(CommandData {
                lost_target: true,
                ..CommandData::default()
            });
        }
        return None;
    }
    Some(CommandData {
        token: Some(params[0].clone()),
        dest: Some(params[1].clone()),
        ..CommandData::default()
    })
}

struct ServerPing;

impl ServerCommand for ServerPing {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let mut data = resolve_server_pair(ircd, params)?;
        data.source_server = prefix.map(str::to_string);
        Some(data)
    }

    fn execute(&self, ircd: &mut Ircd, _server: &str, data: &mut CommandData) -> bool {
        if data.lost_target {
            return true;
        }
        let (Some(source), Some(dest)) = (data.token.take(), data.dest.take()) else {
            return false;
        };
        let prefix = data.source_server.clone().unwrap_or_else(|| source.clone());
        if dest == ircd.server_id() {
            let conn = ircd.servers.get(&source).and_then(|p| p.conn);
            if let Some(conn) = conn {
                let pong = Message::with_prefix(prefix, "PONG", vec![dest, source]);
                ircd.send_to_conn(conn, &pong);
            }
            return true;
        }
        if let Some(conn) = ircd.server_link_conn(&dest) {
            let ping = Message::with_prefix(prefix, "PING", vec![source, dest]);
            ircd.send_to_conn(conn, &ping);
        }
        true
    }
}

struct ServerPong;

impl ServerCommand for ServerPong {
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        _server: &str,
        params: &[String],
        prefix: Option<&str>,
        _tags: &[Tag],
    ) -> Option<CommandData> {
        let mut data = resolve_server_pair(ircd, params)?;
        data.source_server = prefix.map(str::to_string);
        Some(data)
    }

    fn execute(&self, ircd: &mut Ircd, _server: &str, data: &mut CommandData) -> bool {
        if data.lost_target {
            return true;
        }
        let (Some(source), Some(dest)) = (data.token.take(), data.dest.take()) else {
            return false;
        };
        if dest == ircd.server_id() {
            if let Some(peer) = ircd.servers.get_mut(&source) {
                peer.cache.insert("pongtime".to_string(), now_ts());
            }
            return true;
        }
        if let Some(conn) = ircd.server_link_conn(&dest) {
            let prefix = data.source_server.clone().unwrap_or_else(|| source.clone());
            let pong = Message::with_prefix(prefix, "PONG", vec![source, dest]);
            ircd.send_to_conn(conn, &pong);
        }
        true
    }
}

//! Registered channels: the `+r` parameter mode backed by the services
//! namespace of the blob store.
//!
//! A registered channel survives emptiness, is rehydrated (topic and
//! modes) at module load, and grants its owning account full status and
//! level overrides. Dropping the registration requires being logged into
//! the owning account; violations answer with the services numeric
//! `955 CHANNEL DROP WRONGACCOUNT`.

use std::rc::Rc;

use modircd_proto::{irc_lower, numerics};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::chanlog::open_channel_log;
use crate::hooks::{ActionArgs, ActionValue};
use crate::modes::{ModeCategory, ModeChangeRequest, ModeHandler, ModeTarget};
use crate::modules::{ActionDef, ChannelModeDef, Module};
use crate::state::channel::ModeValue;
use crate::state::{now_ts, Channel, Ircd};
use crate::storage::ensure_object_path;

pub struct ChannelRegister;

impl Module for ChannelRegister {
    fn name(&self) -> &'static str {
        "ChannelRegister"
    }

    fn channel_modes(&self) -> Vec<ChannelModeDef> {
        vec![ChannelModeDef {
            letter: 'r',
            category: ModeCategory::Param,
            handler: Rc::new(RegisterModeHandler),
            rank: None,
            symbol: None,
            affected_actions: Vec::new(),
        }]
    }

    fn on_load(&self, ircd: &mut Ircd) {
        rehydrate_registered_channels(ircd);
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![
            ActionDef {
                action: "modepermission-channel-r".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| check_drop_permission(ircd, args)),
                scope: None,
            },
            ActionDef {
                action: "modechange-channel-r".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    update_registration(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "modechanges-channel".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    persist_channel_modes(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "topic".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    persist_channel_topic(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "keepchannelalive".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    let ActionArgs::ChannelKeep { channel } = args else {
                        return None;
                    };
                    let registered = ircd
                        .channels
                        .get(channel)
                        .map(|c| c.has_mode('r'))
                        .unwrap_or(false);
                    registered.then_some(ActionValue::Bool(true))
                }),
                scope: None,
            },
            ActionDef {
                action: "handledeleteaccount".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::Account {
                        name,
                        renamed_to: None,
                    } = args
                    {
                        unregister_for_account_delete(ircd, &name.clone());
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "handleaccountchangename".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::Account {
                        name,
                        renamed_to: Some(new_name),
                    } = args
                    {
                        rename_account(ircd, &name.clone(), &new_name.clone());
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "channelstatusoverride".to_string(),
                priority: 50,
                func: Rc::new(|ircd, args| {
                    let ActionArgs::StatusOverride { channel, user, .. } = args else {
                        return None;
                    };
                    owner_check(ircd, channel, *user)
                }),
                scope: None,
            },
            ActionDef {
                action: "checkchannellevel".to_string(),
                priority: 50,
                func: Rc::new(|ircd, args| {
                    let ActionArgs::ChannelLevel { channel, user, .. } = args else {
                        return None;
                    };
                    owner_check(ircd, channel, *user)
                }),
                scope: None,
            },
        ]
    }
}

/// The channel owner passes every status and level check.
fn owner_check(ircd: &Ircd, channel: &str, user: Uuid) -> Option<ActionValue> {
    let owner = ircd.channels.get(channel)?.mode_param('r')?.to_string();
    let account = ircd.users.get(&user)?.metadata_value("account")?;
    if account == owner {
        Some(ActionValue::Bool(true))
    } else {
        None
    }
}

/// Dropping `-r` requires being logged into the owning account.
fn check_drop_permission(ircd: &mut Ircd, args: &mut ActionArgs<'_>) -> Option<ActionValue> {
    let ActionArgs::ModePermission {
        target: ModeTarget::Channel(channel),
        user: Some(user),
        adding: false,
        ..
    } = args
    else {
        return None;
    };
    let (channel, user) = (channel.clone(), *user);
    let Some(owner) = ircd
        .channels
        .get(&channel)
        .and_then(|c| c.mode_param('r'))
        .map(str::to_string)
    else {
        return None;
    };
    if ircd
        .users
        .get(&user)
        .and_then(|u| u.metadata_value("account"))
        == Some(owner.as_str())
    {
        return None;
    }
    ircd.send_numeric(
        user,
        numerics::ERR_SERVICES,
        vec![
            "CHANNEL".to_string(),
            "DROP".to_string(),
            "WRONGACCOUNT".to_string(),
        ],
    );
    let notice = modircd_proto::Message::with_prefix(
        ircd.server_name().to_string(),
        "NOTICE",
        vec![
            ircd.users
                .get(&user)
                .map(|u| u.nick.clone())
                .unwrap_or_default(),
            "You can't drop the channel unless you're logged into the owning account."
                .to_string(),
        ],
    );
    ircd.send_to_user(user, &notice);
    Some(ActionValue::Bool(false))
}

struct RegisterModeHandler;

impl ModeHandler for RegisterModeHandler {
    /// The parameter is the owning account. With an account module loaded,
    /// `checkaccountexists` validates (and `accountfromnick` normalizes)
    /// it; without one, the name is taken as given.
    fn check_set(
        &self,
        ircd: &mut Ircd,
        _target: &ModeTarget,
        param: &str,
    ) -> Option<Vec<String>> {
        let mut args = ActionArgs::Account {
            name: param.to_string(),
            renamed_to: None,
        };
        match ircd.run_action_until_value("checkaccountexists", &mut args, None) {
            Some(value) if !value.truthy() => None,
            Some(_) => {
                let mut args = ActionArgs::Account {
                    name: param.to_string(),
                    renamed_to: None,
                };
                match ircd.run_action_until_value("accountfromnick", &mut args, None) {
                    Some(ActionValue::Text(account)) if !account.is_empty() => {
                        Some(vec![account])
                    }
                    _ => None,
                }
            }
            None => Some(vec![param.to_string()]),
        }
    }
}

// ----------------------------------------------------------------------
// Storage plumbing
//
// services -> channel -> { data: { name -> {regtime, regname, topic,
// topicsetter, topictime, modes: [[letter, param, setter, setAt], ...] } },
// index: { regname: { account -> [channelName, ...] } } }
// ----------------------------------------------------------------------

fn channel_namespace(ircd: &mut Ircd) -> &mut Map<String, Value> {
    let services = ircd.storage.entry_object("services");
    ensure_object_path(services, &["channel"])
}

fn serialize_modes(channel: &Channel) -> Value {
    let mut modes = Vec::new();
    for (letter, value) in &channel.modes {
        match value {
            ModeValue::Flag => modes.push(json!([letter.to_string(), Value::Null])),
            ModeValue::Param(param) => modes.push(json!([letter.to_string(), param])),
            ModeValue::List(entries) => {
                for entry in entries {
                    modes.push(json!([
                        letter.to_string(),
                        entry.param,
                        entry.setter,
                        entry.set_at
                    ]));
                }
            }
        }
    }
    Value::Array(modes)
}

/// `modechange-channel-r`: create or drop the stored registration.
fn update_registration(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::ModeChange {
        target: ModeTarget::Channel(channel),
        adding,
        param: Some(account),
        ..
    } = args
    else {
        return;
    };
    let (key, adding, account) = (channel.clone(), *adding, account.clone());
    let Some(channel) = ircd.channels.get(&key) else {
        return;
    };
    let name = channel.name.clone();
    let snapshot = (
        channel.topic.clone(),
        serialize_modes(channel),
    );

    let namespace = channel_namespace(ircd);
    if adding {
        let data = ensure_object_path(namespace, &["data"]);
        let old_owner = data
            .get(&name)
            .and_then(|info| info.get("regname"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let info = data
            .entry(name.clone())
            .or_insert_with(|| json!({"regtime": now_ts()}));
        let (topic, modes) = snapshot;
        if let Some(info) = info.as_object_mut() {
            info.insert("regname".to_string(), json!(account));
            info.insert(
                "topic".to_string(),
                json!(topic.as_ref().map(|t| t.text.clone()).unwrap_or_default()),
            );
            info.insert(
                "topicsetter".to_string(),
                json!(topic.as_ref().map(|t| t.setter.clone()).unwrap_or_default()),
            );
            info.insert(
                "topictime".to_string(),
                json!(topic.as_ref().map(|t| t.set_at).unwrap_or(0)),
            );
            info.insert("modes".to_string(), modes);
        }
        let index = ensure_object_path(namespace, &["index", "regname"]);
        if let Some(old_owner) = old_owner {
            index.remove(&old_owner);
        }
        let list = index.entry(account).or_insert_with(|| json!([]));
        if let Some(list) = list.as_array_mut() {
            if !list.iter().any(|v| v.as_str() == Some(name.as_str())) {
                list.push(json!(name));
            }
        }
    } else {
        let data = ensure_object_path(namespace, &["data"]);
        data.remove(&name);
        let index = ensure_object_path(namespace, &["index", "regname"]);
        if let Some(list) = index.get_mut(&account).and_then(Value::as_array_mut) {
            list.retain(|v| v.as_str() != Some(name.as_str()));
        }
    }
}

/// `modechanges-channel`: keep the stored mode list current.
fn persist_channel_modes(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::ModeChanges {
        target: ModeTarget::Channel(channel),
        ..
    } = args
    else {
        return;
    };
    let key = channel.clone();
    let Some(channel) = ircd.channels.get(&key) else {
        return;
    };
    if !channel.has_mode('r') {
        return;
    }
    let name = channel.name.clone();
    let modes = serialize_modes(channel);
    let namespace = channel_namespace(ircd);
    let data = ensure_object_path(namespace, &["data"]);
    if let Some(info) = data.get_mut(&name).and_then(Value::as_object_mut) {
        info.insert("modes".to_string(), modes);
    }
}

/// `topic`: keep the stored topic current.
fn persist_channel_topic(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::Topic {
        channel, setter, ..
    } = args
    else {
        return;
    };
    let (key, setter) = (channel.clone(), setter.clone());
    let Some(channel) = ircd.channels.get(&key) else {
        return;
    };
    if !channel.has_mode('r') {
        return;
    }
    let name = channel.name.clone();
    let topic = channel.topic.clone();
    let namespace = channel_namespace(ircd);
    let data = ensure_object_path(namespace, &["data"]);
    if let Some(info) = data.get_mut(&name).and_then(Value::as_object_mut) {
        info.insert(
            "topic".to_string(),
            json!(topic.as_ref().map(|t| t.text.clone()).unwrap_or_default()),
        );
        info.insert("topicsetter".to_string(), json!(setter));
        info.insert(
            "topictime".to_string(),
            json!(topic.as_ref().map(|t| t.set_at).unwrap_or(0)),
        );
    }
}

/// Bring every stored registration back to life at module load.
fn rehydrate_registered_channels(ircd: &mut Ircd) {
    let stored: Vec<(String, Value)> = {
        let namespace = channel_namespace(ircd);
        let data = ensure_object_path(namespace, &["data"]);
        data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    };
    // Make sure the index namespaces exist even when empty.
    {
        let namespace = channel_namespace(ircd);
        ensure_object_path(namespace, &["index", "regname"]);
    }
    let server_id = ircd.server_id().to_string();
    for (name, info) in stored {
        let key = irc_lower(&name);
        if !ircd.channels.contains_key(&key) {
            let log = open_channel_log(ircd.config.log_dir.as_deref(), &name);
            ircd.channels
                .insert(&key, Channel::new(&name, now_ts(), log));
        }
        if let Some(topic_text) = info.get("topic").and_then(Value::as_str) {
            if !topic_text.is_empty() {
                let setter = info
                    .get("topicsetter")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let set_at = info.get("topictime").and_then(Value::as_i64).unwrap_or(0);
                if let Some(channel) = ircd.channels.get_mut(&key) {
                    channel.topic = Some(crate::state::channel::Topic {
                        text: topic_text.to_string(),
                        setter,
                        set_at,
                    });
                }
            }
        }
        let mut changes = Vec::new();
        if let Some(modes) = info.get("modes").and_then(Value::as_array) {
            for entry in modes {
                let Some(fields) = entry.as_array() else {
                    continue;
                };
                let Some(letter) = fields
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| s.chars().next())
                else {
                    continue;
                };
                let param = fields.get(1).and_then(Value::as_str).map(str::to_string);
                changes.push(ModeChangeRequest {
                    adding: true,
                    letter,
                    param,
                });
            }
        }
        if changes.is_empty() {
            warn!(channel = %name, "stored registration carries no modes");
        } else {
            ircd.set_channel_modes(&key, changes, &server_id, None);
        }
    }
}

/// Account deleted: drop every registration it owned.
fn unregister_for_account_delete(ircd: &mut Ircd, account: &str) {
    let owned: Vec<String> = {
        let namespace = channel_namespace(ircd);
        let index = ensure_object_path(namespace, &["index", "regname"]);
        index
            .get(account)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let server_id = ircd.server_id().to_string();
    for name in &owned {
        let key = irc_lower(name);
        if ircd.channels.contains_key(&key) {
            ircd.set_channel_modes(
                &key,
                vec![ModeChangeRequest {
                    adding: false,
                    letter: 'r',
                    param: Some(account.to_string()),
                }],
                &server_id,
                None,
            );
        } else {
            let namespace = channel_namespace(ircd);
            let data = ensure_object_path(namespace, &["data"]);
            data.remove(name);
        }
    }
    let namespace = channel_namespace(ircd);
    let index = ensure_object_path(namespace, &["index", "regname"]);
    index.remove(account);
}

/// Account renamed: re-own everything it registered.
fn rename_account(ircd: &mut Ircd, old_account: &str, new_account: &str) {
    let owned: Vec<String> = {
        let namespace = channel_namespace(ircd);
        let index = ensure_object_path(namespace, &["index", "regname"]);
        index
            .get(old_account)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let server_id = ircd.server_id().to_string();
    for name in &owned {
        let key = irc_lower(name);
        if ircd.channels.contains_key(&key) {
            ircd.set_channel_modes(
                &key,
                vec![ModeChangeRequest {
                    adding: true,
                    letter: 'r',
                    param: Some(new_account.to_string()),
                }],
                &server_id,
                None,
            );
        } else {
            let namespace = channel_namespace(ircd);
            let data = ensure_object_path(namespace, &["data"]);
            if let Some(info) = data.get_mut(name).and_then(Value::as_object_mut) {
                info.insert("regname".to_string(), json!(new_account));
                if let Some(modes) = info.get_mut("modes").and_then(Value::as_array_mut) {
                    for entry in modes {
                        if let Some(fields) = entry.as_array_mut() {
                            if fields.first().and_then(Value::as_str) == Some("r") {
                                fields[1] = json!(new_account);
                            }
                        }
                    }
                }
            }
        }
    }
    let namespace = channel_namespace(ircd);
    let index = ensure_object_path(namespace, &["index", "regname"]);
    if let Some(list) = index.remove(old_account) {
        index.insert(new_account.to_string(), list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{add_user, test_ircd};

    fn ircd_with_register() -> crate::state::Ircd {
        let mut ircd = test_ircd();
        ircd.load_module(Rc::new(ChannelRegister)).expect("module loads");
        ircd
    }

    fn register(ircd: &mut crate::state::Ircd, channel: &str, account: &str) {
        let server_id = ircd.server_id().to_string();
        let applied = ircd.set_channel_modes(
            channel,
            vec![ModeChangeRequest {
                adding: true,
                letter: 'r',
                param: Some(account.to_string()),
            }],
            &server_id,
            None,
        );
        assert_eq!(applied.len(), 1, "registration applied");
    }

    #[test]
    fn registered_channel_survives_emptiness() {
        let mut ircd = ircd_with_register();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#keep", None);
        register(&mut ircd, "#keep", "alice");

        ircd.leave_channel(
            alice,
            "#keep",
            crate::hooks::LeaveType::Part,
            crate::hooks::LeaveDetail {
                by_user: Some(alice),
                by_server: None,
                reason: "bye".to_string(),
            },
            None,
        );
        assert!(ircd.channels.get("#keep").is_some(), "registered channel kept");
    }

    #[test]
    fn registration_is_persisted_and_indexed() {
        let mut ircd = ircd_with_register();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#persist", None);
        register(&mut ircd, "#persist", "acct");

        let services = ircd.storage.get("services").expect("namespace written");
        let info = &services["channel"]["data"]["#persist"];
        assert_eq!(info["regname"], "acct");
        assert!(info["regtime"].is_i64());
        let index = &services["channel"]["index"]["regname"]["acct"];
        assert_eq!(index[0], "#persist");
    }

    #[test]
    fn drop_requires_owning_account() {
        let mut ircd = ircd_with_register();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#owned", None);
        register(&mut ircd, "#owned", "someoneelse");

        let removed = ircd.set_channel_modes(
            "#owned",
            vec![ModeChangeRequest {
                adding: false,
                letter: 'r',
                param: Some("someoneelse".to_string()),
            }],
            &alice.to_string(),
            None,
        );
        assert!(removed.is_empty(), "drop vetoed without the owning account");
        assert!(ircd.channels.get("#owned").expect("exists").has_mode('r'));

        // Logged into the owning account, the drop goes through.
        ircd.users
            .get_mut(&alice)
            .expect("alice exists")
            .metadata
            .insert("account".to_string(), "someoneelse".to_string());
        let removed = ircd.set_channel_modes(
            "#owned",
            vec![ModeChangeRequest {
                adding: false,
                letter: 'r',
                param: Some("someoneelse".to_string()),
            }],
            &alice.to_string(),
            None,
        );
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn owner_passes_level_checks() {
        let mut ircd = ircd_with_register();
        let alice = add_user(&mut ircd, "alice");
        let bob = add_user(&mut ircd, "bob");
        ircd.join_channel(alice, "#lvl", None);
        ircd.join_channel(bob, "#lvl", None);
        register(&mut ircd, "#lvl", "bobacct");
        ircd.users
            .get_mut(&bob)
            .expect("bob exists")
            .metadata
            .insert("account".to_string(), "bobacct".to_string());

        // Bob holds no status, but owns the channel.
        let mut args = crate::hooks::ActionArgs::ChannelLevel {
            level_type: "kick".to_string(),
            channel: "#lvl".to_string(),
            user: bob,
        };
        let verdict = ircd.run_action_until_value("checkchannellevel", &mut args, None);
        assert_eq!(verdict, Some(ActionValue::Bool(true)));
    }

    #[test]
    fn stored_channels_rehydrate_on_load() {
        let mut ircd = test_ircd();
        ircd.storage.set(
            "services",
            json!({
                "channel": {
                    "data": {
                        "#saved": {
                            "regtime": 1000,
                            "regname": "acct",
                            "topic": "kept topic",
                            "topicsetter": "services",
                            "topictime": 1000,
                            "modes": [["r", "acct"]]
                        }
                    },
                    "index": {"regname": {"acct": ["#saved"]}}
                }
            }),
        );
        ircd.load_module(Rc::new(ChannelRegister)).expect("module loads");

        let channel = ircd.channels.get("#saved").expect("rehydrated");
        assert_eq!(channel.mode_param('r'), Some("acct"));
        assert_eq!(
            channel.topic.as_ref().map(|t| t.text.as_str()),
            Some("kept topic")
        );
    }
}

//! Channel bans: the `+b` list mode and its extended-ban grammar.
//!
//! A ban parameter is `[action[:param];][[~]match:]mask`. The optional
//! matching extban delegates "does this user match?" to
//! `usermatchban-<letter>` handlers; the optional action extban turns the
//! entry from a join/speak denial into an automatic mode action applied to
//! matching users (auto-voice and the like). Plain entries deny joins and
//! messages from outside the channel.
//!
//! Each membership carries a cache mapping action extban to action
//! parameter (empty key = plain denial); it is populated on join, patched
//! on every `+b` change, and rebuilt through `updateuserbancache` when a
//! user's identity changes.

use std::collections::HashMap;
use std::rc::Rc;

use modircd_proto::{irc_lower, matches_mask, numerics};
use uuid::Uuid;

use crate::hooks::{ActionArgs, ActionValue};
use crate::modes::{ModeCategory, ModeChangeRequest, ModeHandler, ModeTarget};
use crate::modules::{ActionDef, ChannelModeDef, Module};
use crate::state::Ircd;

pub struct BanMode;

impl Module for BanMode {
    fn name(&self) -> &'static str {
        "BanMode"
    }

    fn is_core(&self) -> bool {
        true
    }

    fn channel_modes(&self) -> Vec<ChannelModeDef> {
        vec![ChannelModeDef {
            letter: 'b',
            category: ModeCategory::List,
            handler: Rc::new(BanModeHandler),
            rank: None,
            symbol: None,
            affected_actions: vec![
                ("joinpermission".to_string(), 10),
                ("commandmodify-PRIVMSG".to_string(), 10),
                ("commandmodify-NOTICE".to_string(), 10),
            ],
        }]
    }

    fn actions(&self) -> Vec<ActionDef> {
        vec![
            ActionDef {
                action: "modeactioncheck-channel-withuser".to_string(),
                priority: 100,
                func: Rc::new(|ircd, args| check_action(ircd, args)),
                scope: None,
            },
            ActionDef {
                action: "modechange-channel-b".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| {
                    on_change(ircd, args);
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "modepermission-channel-b".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| check_autostatus_permission(ircd, args)),
                scope: None,
            },
            ActionDef {
                action: "userbancheck".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| match_bans(ircd, args)),
                scope: None,
            },
            ActionDef {
                action: "join".to_string(),
                priority: 10,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::ChannelUser { channel, user } = args {
                        populate_ban_cache(ircd, &channel.clone(), *user);
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "join".to_string(),
                priority: 9,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::ChannelUser { channel, user } = args {
                        auto_status(ircd, &channel.clone(), *user);
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "updateuserbancache".to_string(),
                priority: 1,
                func: Rc::new(|ircd, args| {
                    if let ActionArgs::User { user } = args {
                        update_user_caches(ircd, *user);
                    }
                    None
                }),
                scope: None,
            },
        ]
    }
}

// ----------------------------------------------------------------------
// Ban parameter grammar
// ----------------------------------------------------------------------

/// The three syntactic pieces of a ban parameter.
pub struct BanParts<'a> {
    /// Action extban, `~` included when negated; empty when absent.
    pub action_ext: String,
    pub action_param: String,
    /// Everything after the `;`, or the whole parameter.
    pub matchpart: &'a str,
}

pub fn split_ban(param: &str) -> BanParts<'_> {
    match param.split_once(';') {
        Some((action, matchpart)) => {
            let (ext, ap) = match action.split_once(':') {
                Some((ext, ap)) => (ext.to_string(), ap.to_string()),
                None => (action.to_string(), String::new()),
            };
            BanParts {
                action_ext: ext,
                action_param: ap,
                matchpart,
            }
        }
        None => BanParts {
            action_ext: String::new(),
            action_param: String::new(),
            matchpart: param,
        },
    }
}

pub fn strip_negation(ext: &str) -> (bool, &str) {
    match ext.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, ext),
    }
}

/// A matching extban is a `:`-prefixed segment that appears before any
/// `@`, so `nick!ident@host:port`-style masks are not misread.
pub fn has_matching_extban(mask: &str) -> bool {
    match (mask.find(':'), mask.find('@')) {
        (Some(colon), Some(at)) => colon < at,
        (Some(_), None) => true,
        _ => false,
    }
}

pub fn split_matching(mask: &str) -> (Option<(bool, String)>, &str) {
    if !has_matching_extban(mask) {
        return (None, mask);
    }
    let (ext, rest) = mask.split_once(':').expect("checked for ':'");
    let (negated, ext) = strip_negation(ext);
    (Some((negated, ext.to_string())), rest)
}

/// Complete a bare mask to the full `nick!ident@host` shape.
fn complete_hostmask(mask: &mut String) {
    if !mask.contains('!') {
        mask.push_str("!*@*");
    } else if !mask.contains('@') {
        mask.push_str("@*");
    }
}

// ----------------------------------------------------------------------
// Matching
// ----------------------------------------------------------------------

fn match_hostmask(ircd: &Ircd, user: Uuid, banmask: &str) -> bool {
    let Some(entity) = ircd.users.get(&user) else {
        return false;
    };
    matches_mask(banmask, &entity.hostmask())
        || matches_mask(banmask, &entity.hostmask_with_real_host())
        || matches_mask(banmask, &entity.hostmask_with_ip())
}

/// Does this ban's matchpart apply to the user? Delegates to
/// `usermatchban-<letter>` when a matching extban is present.
pub fn ban_matches_user(ircd: &mut Ircd, user: Uuid, banmask: &str) -> bool {
    let (matching, rest) = split_matching(banmask);
    if let Some((negated, ext)) = matching {
        if !ext.is_empty() {
            let mut args = ActionArgs::BanMatch {
                user,
                negated,
                mask: rest.to_string(),
            };
            return ircd
                .run_action_until_true(&format!("usermatchban-{ext}"), &mut args, None)
                .is_some();
        }
    }
    match_hostmask(ircd, user, rest)
}

// ----------------------------------------------------------------------
// Action handlers
// ----------------------------------------------------------------------

/// `modeactioncheck-channel-withuser`: is this user restricted under mode
/// X in this channel? Answers from the membership cache when present,
/// otherwise walks the ban list.
fn check_action(ircd: &mut Ircd, args: &mut ActionArgs<'_>) -> Option<ActionValue> {
    let ActionArgs::ModeActionCheck {
        mode,
        channel,
        user,
        ..
    } = args
    else {
        return None;
    };
    let (mode, channel, user) = (*mode, channel.clone(), *user);
    let entries: Vec<String> = {
        let ch = ircd.channels.get(&channel)?;
        if !ch.has_mode('b') {
            return None;
        }
        if mode == 'b' {
            // The ban mode handles its own iteration.
            return Some(ActionValue::Text(String::new()));
        }
        if let Some(bans) = ch.members.get(&user).and_then(|m| m.bans.as_ref()) {
            return bans
                .get(&mode.to_string())
                .map(|param| ActionValue::Text(param.clone()));
        }
        ch.list_entries('b').iter().map(|e| e.param.clone()).collect()
    };
    for param in entries {
        let parts = split_ban(&param);
        let (negated, ext) = strip_negation(&parts.action_ext);
        if ext != mode.to_string() {
            continue;
        }
        if ban_matches_user(ircd, user, parts.matchpart) {
            if negated {
                return None;
            }
            return Some(ActionValue::Text(parts.action_param));
        }
    }
    None
}

/// `modechange-channel-b`: patch only the affected membership caches.
fn on_change(ircd: &mut Ircd, args: &mut ActionArgs<'_>) {
    let ActionArgs::ModeChange {
        target: ModeTarget::Channel(channel),
        adding,
        param: Some(param),
        ..
    } = args
    else {
        return;
    };
    let (channel, adding, param) = (channel.clone(), *adding, param.clone());
    let parts = split_ban(&param);
    let action_ext = parts.action_ext.clone();
    let action_param = parts.action_param.clone();
    let (matching, matchmask) = split_matching(parts.matchpart);
    let matchmask = matchmask.to_string();

    let members: Vec<Uuid> = ircd
        .channels
        .get(&channel)
        .map(|c| c.members.keys().copied().collect())
        .unwrap_or_default();
    for member in members {
        let cached = ircd
            .channels
            .get(&channel)
            .and_then(|c| c.members.get(&member))
            .map(|m| {
                m.bans
                    .as_ref()
                    .and_then(|bans| bans.get(&action_ext).cloned())
            });
        let Some(cached) = cached else {
            continue;
        };
        // An entry that never affected them cannot stop affecting them,
        // and a cache already carrying this action needs no rework.
        if cached.is_none() && !adding {
            continue;
        }
        if adding && cached.as_deref() == Some(action_param.as_str()) {
            continue;
        }
        let matches = match &matching {
            Some((negated, ext)) if !ext.is_empty() => {
                let mut match_args = ActionArgs::BanMatch {
                    user: member,
                    negated: *negated,
                    mask: matchmask.clone(),
                };
                ircd.run_action_until_true(
                    &format!("usermatchban-{ext}"),
                    &mut match_args,
                    None,
                )
                .is_some()
            }
            _ => match_hostmask(ircd, member, &matchmask),
        };
        if !matches {
            continue;
        }
        if let Some(membership) = ircd
            .channels
            .get_mut(&channel)
            .and_then(|c| c.members.get_mut(&member))
        {
            let bans = membership.bans.get_or_insert_with(HashMap::new);
            if adding {
                bans.insert(action_ext.clone(), action_param.clone());
            } else {
                bans.remove(&action_ext);
            }
        }
    }
}

/// `userbancheck`: the cached (or freshly computed) action map for a user
/// in a channel.
fn match_bans(ircd: &mut Ircd, args: &mut ActionArgs<'_>) -> Option<ActionValue> {
    let ActionArgs::ChannelUser { channel, user } = args else {
        return None;
    };
    let (channel, user) = (channel.clone(), *user);
    let entries: Vec<String> = {
        let ch = ircd.channels.get(&channel)?;
        if let Some(bans) = ch.members.get(&user).and_then(|m| m.bans.as_ref()) {
            return Some(ActionValue::Map(bans.clone()));
        }
        if !ch.has_mode('b') {
            return Some(ActionValue::Map(HashMap::new()));
        }
        ch.list_entries('b').iter().map(|e| e.param.clone()).collect()
    };
    let mut matches_actions: HashMap<String, String> = HashMap::new();
    for param in entries {
        let parts = split_ban(&param);
        if matches_actions.contains_key(&parts.action_ext) {
            continue;
        }
        if ban_matches_user(ircd, user, parts.matchpart) {
            matches_actions.insert(parts.action_ext, parts.action_param);
        }
    }
    Some(ActionValue::Map(matches_actions))
}

/// `modepermission-channel-b`: setting an auto-status entry for a status
/// above your own needs an override.
fn check_autostatus_permission(ircd: &mut Ircd, args: &mut ActionArgs<'_>) -> Option<ActionValue> {
    let ActionArgs::ModePermission {
        target: ModeTarget::Channel(channel),
        user: Some(user),
        param: Some(param),
        ..
    } = args
    else {
        return None;
    };
    let (channel, user, param) = (channel.clone(), *user, param.clone());
    let parts = split_ban(&param);
    let (_, ext) = strip_negation(&parts.action_ext);
    if ext.len() != 1 {
        return None;
    }
    let letter = ext.chars().next().expect("checked length");
    let Some(status) = ircd.registry.modes.channel_statuses.get(&letter) else {
        return None;
    };
    let status_rank = status.rank;
    let rank = ircd
        .channels
        .get(&channel)
        .map(|c| c.user_rank(&ircd.registry.modes, user))
        .unwrap_or(0);
    if rank >= status_rank {
        return None;
    }
    let filter = crate::hooks::ActionFilter {
        users: vec![user],
        channels: vec![channel.clone()],
    };
    let mut override_args = ActionArgs::StatusOverride {
        channel: channel.clone(),
        user,
        mode: letter,
        param: param.clone(),
    };
    let overridden = ircd
        .run_action_until_value("channelstatusoverride", &mut override_args, Some(&filter))
        .map(|v| v.truthy())
        .unwrap_or(false);
    if overridden {
        return None;
    }
    let display = ircd
        .channels
        .get(&channel)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| channel.clone());
    ircd.send_numeric(
        user,
        numerics::ERR_CHANOPRIVSNEEDED,
        vec![
            display,
            format!("You do not have permission to modify autostatus for mode {letter}"),
        ],
    );
    Some(ActionValue::Bool(false))
}

/// Walk the ban list and fill this membership's action cache.
fn populate_ban_cache(ircd: &mut Ircd, channel: &str, user: Uuid) {
    let entries: Vec<String> = {
        let Some(ch) = ircd.channels.get(channel) else {
            return;
        };
        if !ch.has_mode('b') {
            return;
        }
        ch.list_entries('b').iter().map(|e| e.param.clone()).collect()
    };
    if let Some(membership) = ircd
        .channels
        .get_mut(channel)
        .and_then(|c| c.members.get_mut(&user))
    {
        membership.bans.get_or_insert_with(HashMap::new);
    }
    for param in entries {
        let parts = split_ban(&param);
        let already = ircd
            .channels
            .get(channel)
            .and_then(|c| c.members.get(&user))
            .and_then(|m| m.bans.as_ref())
            .map(|bans| bans.contains_key(&parts.action_ext))
            .unwrap_or(true);
        if already {
            continue;
        }
        let action_ext = parts.action_ext.clone();
        let action_param = parts.action_param.clone();
        if ban_matches_user(ircd, user, parts.matchpart) {
            if let Some(bans) = ircd
                .channels
                .get_mut(channel)
                .and_then(|c| c.members.get_mut(&user))
                .and_then(|m| m.bans.as_mut())
            {
                bans.insert(action_ext, action_param);
            }
        }
    }
}

/// Grant every status whose letter sits in the membership's action cache,
/// highest rank first, with the channel as source.
fn auto_status(ircd: &mut Ircd, channel: &str, user: Uuid) {
    let cached: Vec<String> = {
        let Some(bans) = ircd
            .channels
            .get(channel)
            .and_then(|c| c.members.get(&user))
            .and_then(|m| m.bans.as_ref())
        else {
            return;
        };
        bans.keys().cloned().collect()
    };
    let order = ircd.registry.modes.channel_status_order.clone();
    let mut apply_modes = Vec::new();
    for letter in order {
        if cached.iter().any(|ext| ext == &letter.to_string()) {
            apply_modes.push(ModeChangeRequest {
                adding: true,
                letter,
                param: Some(user.to_string()),
            });
        }
    }
    if apply_modes.is_empty() {
        return;
    }
    let source = ircd
        .channels
        .get(channel)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| channel.to_string());
    ircd.set_channel_modes(channel, apply_modes, &source, None);
}

/// `updateuserbancache`: identity changed, redo every joined channel.
fn update_user_caches(ircd: &mut Ircd, user: Uuid) {
    let channels = ircd
        .users
        .get(&user)
        .map(|u| u.channels.clone())
        .unwrap_or_default();
    for channel in channels {
        populate_ban_cache(ircd, &channel, user);
        auto_status(ircd, &channel, user);
    }
}

// ----------------------------------------------------------------------
// The +b mode implementation
// ----------------------------------------------------------------------

pub struct BanModeHandler;

impl ModeHandler for BanModeHandler {
    /// Canonicalize a comma-separated list of ban parameters: reject empty
    /// extban segments, validate action extbans against the mode registry,
    /// expand action parameters through the referenced mode, and complete
    /// bare hostmasks with `!*@*` / `@*`.
    fn check_set(
        &self,
        ircd: &mut Ircd,
        target: &ModeTarget,
        param: &str,
    ) -> Option<Vec<String>> {
        let mut valid = Vec::new();
        'masks: for full in param.split(',') {
            let mut full = full.to_string();
            let full_copy = full.clone();
            if let Some((action_raw, mask)) = full_copy.split_once(';') {
                if action_raw.is_empty() || mask.is_empty() {
                    continue;
                }
                let (ext_raw, action_param) = match action_raw.split_once(':') {
                    Some((_, ap)) if ap.is_empty() => continue,
                    Some((ext, ap)) => (ext, ap.to_string()),
                    None => (action_raw, String::new()),
                };
                let (negated, ext) = strip_negation(ext_raw);
                if ext.chars().count() != 1 {
                    continue;
                }
                let letter = ext.chars().next().expect("checked length");
                let Some(category) = ircd.registry.modes.channel_mode_category(letter) else {
                    continue;
                };
                match category {
                    ModeCategory::List => continue,
                    ModeCategory::NoParam | ModeCategory::Status
                        if !action_param.is_empty() =>
                    {
                        continue;
                    }
                    ModeCategory::ParamOnUnset if action_param.is_empty() => continue,
                    ModeCategory::Param if !negated && action_param.is_empty() => continue,
                    _ => {}
                }
                if category != ModeCategory::Status {
                    let handler = ircd
                        .registry
                        .modes
                        .channel_mode_handler(letter)
                        .expect("category resolved above");
                    let Some(expanded) = handler.check_set(ircd, target, &action_param)
                    else {
                        continue;
                    };
                    let ext_prefix = if negated {
                        format!("~{ext}")
                    } else {
                        ext.to_string()
                    };
                    for expanded_param in expanded {
                        let mut updated = format!("{ext_prefix}:{expanded_param};{mask}");
                        if has_matching_extban(mask) {
                            if mask.split(':').next().unwrap_or("").is_empty() {
                                continue;
                            }
                        } else if !mask.contains('!') {
                            updated.push_str("!*@*");
                        } else if !mask.contains('@') {
                            updated.push_str("@*");
                        }
                        valid.push(updated);
                    }
                    continue 'masks;
                }
                // Status action extbans carry no inner parameter to
                // validate; only the mask needs completion.
                if has_matching_extban(mask) {
                    if mask.split(':').next().unwrap_or("").is_empty() {
                        continue;
                    }
                } else {
                    complete_hostmask(&mut full);
                }
                valid.push(full);
                continue;
            }
            if has_matching_extban(&full) {
                if full.split(':').next().unwrap_or("").is_empty() {
                    continue;
                }
            } else {
                complete_hostmask(&mut full);
            }
            valid.push(full);
        }
        Some(valid)
    }

    /// Mirror of `check_set`, resolving each candidate case-insensitively
    /// against the stored `+b` list so `AAA!*@*` unsets `aaa!*@*`.
    fn check_unset(
        &self,
        ircd: &mut Ircd,
        target: &ModeTarget,
        param: &str,
    ) -> Option<Vec<String>> {
        let ModeTarget::Channel(channel) = target else {
            return None;
        };
        let channel = channel.clone();
        let mut valid = Vec::new();
        for full in param.split(',') {
            let mut candidates: Vec<String> = Vec::new();
            let mut full = full.to_string();
            let full_copy = full.clone();
            if let Some((action_raw, mask)) = full_copy.split_once(';') {
                let (ext_raw, action_param) = match action_raw.split_once(':') {
                    Some((ext, ap)) => (ext, ap.to_string()),
                    None => (action_raw, String::new()),
                };
                let (negated, ext) = strip_negation(ext_raw);
                let letter = ext.chars().next();
                let category =
                    letter.and_then(|l| ircd.registry.modes.channel_mode_category(l));
                match (letter, category) {
                    (Some(letter), Some(category))
                        if ext.chars().count() == 1 && category != ModeCategory::Status =>
                    {
                        let handler = ircd
                            .registry
                            .modes
                            .channel_mode_handler(letter)
                            .expect("category resolved above");
                        let expanded = handler
                            .check_unset(ircd, target, &action_param)
                            .unwrap_or_default();
                        let ext_prefix = if negated {
                            format!("~{ext}")
                        } else {
                            ext.to_string()
                        };
                        for expanded_param in expanded {
                            let mut updated =
                                format!("{ext_prefix}:{expanded_param};{mask}");
                            if !has_matching_extban(mask) {
                                if !mask.contains('!') {
                                    updated.push_str("!*@*");
                                } else if !mask.contains('@') {
                                    updated.push_str("@*");
                                }
                            }
                            candidates.push(updated);
                        }
                    }
                    _ => {
                        // Unknown action (module unloaded since): let the
                        // entry out of the system as-is, mask completed.
                        if !has_matching_extban(mask) {
                            complete_hostmask(&mut full);
                        }
                        candidates.push(full.clone());
                    }
                }
            } else {
                if !has_matching_extban(&full) {
                    complete_hostmask(&mut full);
                }
                candidates.push(full.clone());
            }

            for candidate in candidates {
                let stored = ircd.channels.get(&channel).and_then(|ch| {
                    ch.list_entries('b')
                        .iter()
                        .find(|entry| irc_lower(&entry.param) == irc_lower(&candidate))
                        .map(|entry| entry.param.clone())
                });
                valid.push(stored.unwrap_or(candidate));
            }
        }
        Some(valid)
    }

    fn apply(
        &self,
        ircd: &mut Ircd,
        action: &str,
        channel: &str,
        _param: &str,
        args: &mut ActionArgs<'_>,
    ) -> Option<ActionValue> {
        match action {
            "joinpermission" => {
                let ActionArgs::ChannelUser { user, .. } = args else {
                    return None;
                };
                let user = *user;
                let entries: Vec<String> = ircd
                    .channels
                    .get(channel)
                    .map(|c| c.list_entries('b').iter().map(|e| e.param.clone()).collect())
                    .unwrap_or_default();
                for param in entries {
                    if param.contains(';') {
                        // Action entries apply effects instead of denying.
                        continue;
                    }
                    if ban_matches_user(ircd, user, &param) {
                        let display = ircd
                            .channels
                            .get(channel)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| channel.to_string());
                        ircd.send_numeric(
                            user,
                            numerics::ERR_BANNEDFROMCHAN,
                            vec![display, "Cannot join channel (You're banned)".to_string()],
                        );
                        return Some(ActionValue::Bool(false));
                    }
                }
                None
            }
            "commandmodify-PRIVMSG" | "commandmodify-NOTICE" => {
                let ActionArgs::Command { user, data, .. } = args else {
                    return None;
                };
                let user = *user;
                if !data.target_chans.iter().any(|(key, _)| key == channel) {
                    return None;
                }
                // Only senders outside the channel are stripped here.
                let is_member = ircd
                    .channels
                    .get(channel)
                    .map(|c| c.members.contains_key(&user))
                    .unwrap_or(false);
                if is_member {
                    return None;
                }
                let entries: Vec<String> = ircd
                    .channels
                    .get(channel)
                    .map(|c| c.list_entries('b').iter().map(|e| e.param.clone()).collect())
                    .unwrap_or_default();
                for param in entries {
                    if param.contains(';') {
                        continue;
                    }
                    if ban_matches_user(ircd, user, &param) {
                        let display = ircd
                            .channels
                            .get(channel)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| channel.to_string());
                        ircd.send_numeric(
                            user,
                            numerics::ERR_BANNEDFROMCHAN,
                            vec![
                                display,
                                "Cannot send message to channel (You're banned)".to_string(),
                            ],
                        );
                        data.target_chans.retain(|(key, _)| key != channel);
                        return None;
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn show_list_params(&self, ircd: &mut Ircd, user: Uuid, channel: &str) {
        let listing = {
            let Some(ch) = ircd.channels.get(channel) else {
                return;
            };
            if !ch.members.contains_key(&user) || !ch.has_mode('b') {
                None
            } else {
                Some((
                    ch.name.clone(),
                    ch.list_entries('b').to_vec(),
                ))
            }
        };
        let display = ircd
            .channels
            .get(channel)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| channel.to_string());
        if let Some((display, entries)) = listing {
            for entry in entries {
                ircd.send_numeric(
                    user,
                    numerics::RPL_BANLIST,
                    vec![
                        display.clone(),
                        entry.param,
                        entry.setter,
                        entry.set_at.to_string(),
                    ],
                );
            }
        }
        ircd.send_numeric(
            user,
            numerics::RPL_ENDOFBANLIST,
            vec![display, "End of channel ban list".to_string()],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ban_plain() {
        let parts = split_ban("nick!user@host");
        assert!(parts.action_ext.is_empty());
        assert_eq!(parts.matchpart, "nick!user@host");
    }

    #[test]
    fn split_ban_action_with_param() {
        let parts = split_ban("l:50;*!*@spam.example");
        assert_eq!(parts.action_ext, "l");
        assert_eq!(parts.action_param, "50");
        assert_eq!(parts.matchpart, "*!*@spam.example");
    }

    #[test]
    fn split_ban_negated_action() {
        let parts = split_ban("~v;*!*@x");
        assert_eq!(parts.action_ext, "~v");
        let (negated, ext) = strip_negation(&parts.action_ext);
        assert!(negated);
        assert_eq!(ext, "v");
    }

    #[test]
    fn matching_extban_detection() {
        assert!(has_matching_extban("a:account"));
        assert!(has_matching_extban("~a:account"));
        assert!(!has_matching_extban("nick!user@host"));
        // The colon sits after the '@': part of the host, not an extban.
        assert!(!has_matching_extban("*!*@2001:db8::1"));
    }

    #[test]
    fn split_matching_negation() {
        let (matching, rest) = split_matching("~a:spammer");
        assert_eq!(matching, Some((true, "a".to_string())));
        assert_eq!(rest, "spammer");
        let (matching, rest) = split_matching("*!*@host");
        assert!(matching.is_none());
        assert_eq!(rest, "*!*@host");
    }

    #[test]
    fn hostmask_completion() {
        let mut mask = "alice".to_string();
        complete_hostmask(&mut mask);
        assert_eq!(mask, "alice!*@*");
        let mut mask = "alice!a".to_string();
        complete_hostmask(&mut mask);
        assert_eq!(mask, "alice!a@*");
        let mut mask = "alice!a@b".to_string();
        complete_hostmask(&mut mask);
        assert_eq!(mask, "alice!a@b");
    }

    mod engine {
        use super::super::*;
        use crate::hooks::{ActionArgs, ActionFilter, ActionValue};
        use crate::modes::{ModeChangeRequest, ModeTarget};
        use crate::testutil::{add_user_with_host, test_ircd};

        fn set_ban(ircd: &mut crate::state::Ircd, channel: &str, mask: &str) {
            let server_id = ircd.server_id().to_string();
            let applied = ircd.set_channel_modes(
                channel,
                vec![ModeChangeRequest {
                    adding: true,
                    letter: 'b',
                    param: Some(mask.to_string()),
                }],
                &server_id,
                None,
            );
            assert!(!applied.is_empty(), "ban {mask} was rejected");
        }

        fn join_denied(ircd: &mut crate::state::Ircd, user: uuid::Uuid, channel: &str) -> bool {
            let filter = ActionFilter {
                users: vec![user],
                channels: vec![channel.to_string()],
            };
            let mut args = ActionArgs::ChannelUser {
                channel: channel.to_string(),
                user,
            };
            matches!(
                ircd.run_action_until_value("joinpermission", &mut args, Some(&filter)),
                Some(ActionValue::Bool(false))
            )
        }

        #[test]
        fn plain_ban_denies_join() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            let alice = add_user_with_host(&mut ircd, "alice", "10.0.0.2");
            let bob = add_user_with_host(&mut ircd, "bob", "10.0.0.3");
            ircd.join_channel(op, "#c", None);
            set_ban(&mut ircd, "#c", "alice!*@*");

            assert!(join_denied(&mut ircd, alice, "#c"));
            assert!(!join_denied(&mut ircd, bob, "#c"));
        }

        #[test]
        fn bare_masks_are_completed() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            set_ban(&mut ircd, "#c", "alice");
            let channel = ircd.channels.get("#c").expect("channel exists");
            assert_eq!(channel.list_entries('b')[0].param, "alice!*@*");
        }

        #[test]
        fn unknown_action_extban_is_rejected() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            let server_id = ircd.server_id().to_string();
            let applied = ircd.set_channel_modes(
                "#c",
                vec![ModeChangeRequest {
                    adding: true,
                    letter: 'b',
                    param: Some("x:1;alice".to_string()),
                }],
                &server_id,
                None,
            );
            assert!(applied.is_empty());
        }

        #[test]
        fn cache_matches_direct_evaluation() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            set_ban(&mut ircd, "#c", "v;*!*@trusted.example");
            set_ban(&mut ircd, "#c", "lurker!*@*");

            let carol = add_user_with_host(&mut ircd, "carol", "trusted.example");
            ircd.join_channel(carol, "#c", None);

            let expected: Vec<(String, bool)> = {
                let entries: Vec<String> = ircd
                    .channels
                    .get("#c")
                    .expect("channel exists")
                    .list_entries('b')
                    .iter()
                    .map(|e| e.param.clone())
                    .collect();
                entries
                    .into_iter()
                    .map(|param| {
                        let parts = split_ban(&param);
                        let matchpart = parts.matchpart.to_string();
                        let matched = ban_matches_user(&mut ircd, carol, &matchpart);
                        (parts.action_ext, matched)
                    })
                    .collect()
            };
            let cache = ircd
                .channels
                .get("#c")
                .and_then(|c| c.members.get(&carol))
                .and_then(|m| m.bans.clone())
                .expect("cache populated on join");
            for (ext, matched) in expected {
                assert_eq!(cache.contains_key(&ext), matched, "cache disagrees for {ext:?}");
            }
        }

        #[test]
        fn action_extban_grants_auto_voice_and_cache_drops_on_part() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            set_ban(&mut ircd, "#c", "v;*!*@trusted.example");

            let carol = add_user_with_host(&mut ircd, "carol", "trusted.example");
            assert!(!join_denied(&mut ircd, carol, "#c"));
            ircd.join_channel(carol, "#c", None);
            {
                let channel = ircd.channels.get("#c").expect("channel exists");
                assert!(channel.members[&carol].status.contains('v'));
            }

            ircd.leave_channel(
                carol,
                "#c",
                crate::hooks::LeaveType::Part,
                crate::hooks::LeaveDetail {
                    by_user: Some(carol),
                    by_server: None,
                    reason: "bye".to_string(),
                },
                None,
            );
            let channel = ircd.channels.get("#c").expect("op remains");
            assert!(!channel.members.contains_key(&carol));
        }

        #[test]
        fn unset_is_case_insensitive() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            set_ban(&mut ircd, "#c", "AAA!*@*");

            let server_id = ircd.server_id().to_string();
            let removed = ircd.set_channel_modes(
                "#c",
                vec![ModeChangeRequest {
                    adding: false,
                    letter: 'b',
                    param: Some("aaa!*@*".to_string()),
                }],
                &server_id,
                None,
            );
            assert_eq!(removed.len(), 1);
            assert_eq!(removed[0].param.as_deref(), Some("AAA!*@*"));
            let channel = ircd.channels.get("#c").expect("channel exists");
            assert!(channel.list_entries('b').is_empty());
        }

        #[test]
        fn set_unset_round_trip_under_case_permutation() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            let server_id = ircd.server_id().to_string();
            for mask in ["Spammer!*@*", "v;*!*@Trusted.Example", "baddie"] {
                let handler = BanModeHandler;
                let target = ModeTarget::Channel("#c".to_string());
                let stored = handler
                    .check_set(&mut ircd, &target, mask)
                    .expect("check_set returns a list");
                assert_eq!(stored.len(), 1, "{mask} should resolve to one entry");
                ircd.set_channel_modes(
                    "#c",
                    vec![ModeChangeRequest {
                        adding: true,
                        letter: 'b',
                        param: Some(mask.to_string()),
                    }],
                    &server_id,
                    None,
                );
                let permuted: String = mask
                    .chars()
                    .map(|c| {
                        if c.is_ascii_lowercase() {
                            c.to_ascii_uppercase()
                        } else {
                            c.to_ascii_lowercase()
                        }
                    })
                    .collect();
                let removed = ircd.set_channel_modes(
                    "#c",
                    vec![ModeChangeRequest {
                        adding: false,
                        letter: 'b',
                        param: Some(permuted),
                    }],
                    &server_id,
                    None,
                );
                assert_eq!(removed.len(), 1, "{mask} did not unset");
                let channel = ircd.channels.get("#c").expect("channel exists");
                assert!(channel.list_entries('b').is_empty(), "{mask} left residue");
            }
        }

        #[test]
        fn mode_action_check_reads_cache_and_list() {
            let mut ircd = test_ircd();
            let op = add_user_with_host(&mut ircd, "op", "10.0.0.1");
            ircd.join_channel(op, "#c", None);
            set_ban(&mut ircd, "#c", "v;*!*@trusted.example");
            let carol = add_user_with_host(&mut ircd, "carol", "trusted.example");

            // Not a member: answered from the list walk.
            let mut args = ActionArgs::ModeActionCheck {
                action: "test".to_string(),
                mode: 'v',
                channel: "#c".to_string(),
                user: carol,
            };
            let verdict =
                ircd.run_action_until_value("modeactioncheck-channel-withuser", &mut args, None);
            assert_eq!(verdict, Some(ActionValue::Text(String::new())));

            // After joining: answered from the membership cache.
            ircd.join_channel(carol, "#c", None);
            let mut args = ActionArgs::ModeActionCheck {
                action: "test".to_string(),
                mode: 'v',
                channel: "#c".to_string(),
                user: carol,
            };
            let verdict =
                ircd.run_action_until_value("modeactioncheck-channel-withuser", &mut args, None);
            assert_eq!(verdict, Some(ActionValue::Text(String::new())));
        }
    }
}

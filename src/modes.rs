//! The mode system.
//!
//! Modes come in four parameter categories plus status modes (per-member
//! prefix modes with a rank and a display symbol). Every letter belongs to
//! at most one category; status modes additionally own a unique symbol and
//! a unique rank, and `channel_status_order` stays sorted rank-descending.
//!
//! `set_channel_modes` is the single write path for channel modes: each
//! change is normalized by the implementing handler (`check_set` /
//! `check_unset`), gated by `modepermission-*` hooks, applied, and
//! announced through `modechange-*` / `modechanges-*` plus the wire.

use std::collections::HashMap;
use std::rc::Rc;

use modircd_proto::{irc_eq, irc_lower, Message};
use tracing::warn;
use uuid::Uuid;

use crate::hooks::{ActionArgs, ActionValue};
use crate::state::channel::{ListEntry, ModeValue};
use crate::state::{now_ts, Ircd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCategory {
    /// Boolean flag.
    NoParam,
    /// Parameter on set only.
    Param,
    /// Parameter on set and unset (keyed).
    ParamOnUnset,
    /// Multi-valued; stores `(param, setter, set_at)` tuples.
    List,
    /// Per-member prefix mode with rank and symbol.
    Status,
}

/// What a mode change applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeTarget {
    /// Folded channel name.
    Channel(String),
    User(Uuid),
}

/// A requested single mode change, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChangeRequest {
    pub adding: bool,
    pub letter: char,
    pub param: Option<String>,
}

/// An accepted, applied mode change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub adding: bool,
    pub letter: char,
    pub param: Option<String>,
}

/// Behavior contract of a mode implementation. The category is data kept by
/// the registry, not part of the implementation.
pub trait ModeHandler {
    /// Normalize a parameter being set. May expand to several parameters
    /// (e.g. comma-separated ban masks). `None` rejects the change.
    fn check_set(
        &self,
        _ircd: &mut Ircd,
        _target: &ModeTarget,
        param: &str,
    ) -> Option<Vec<String>> {
        Some(vec![param.to_string()])
    }

    /// Normalize a parameter being unset.
    fn check_unset(
        &self,
        _ircd: &mut Ircd,
        _target: &ModeTarget,
        param: &str,
    ) -> Option<Vec<String>> {
        Some(vec![param.to_string()])
    }

    /// Apply-binding callback: invoked by the action bus for actions this
    /// mode bound itself to, once per filtered channel carrying the mode.
    fn apply(
        &self,
        _ircd: &mut Ircd,
        _action: &str,
        _channel: &str,
        _param: &str,
        _args: &mut ActionArgs<'_>,
    ) -> Option<ActionValue> {
        None
    }

    /// Reply to a list query (`MODE #chan <letter>` with no parameter).
    fn show_list_params(&self, _ircd: &mut Ircd, _user: Uuid, _channel: &str) {}
}

#[derive(Clone)]
pub struct ChannelModeEntry {
    pub category: ModeCategory,
    pub handler: Rc<dyn ModeHandler>,
    pub module: String,
}

#[derive(Clone)]
pub struct StatusEntry {
    pub rank: i32,
    pub symbol: char,
    pub handler: Rc<dyn ModeHandler>,
    pub module: String,
}

#[derive(Clone)]
pub struct UserModeEntry {
    pub category: ModeCategory,
    pub handler: Rc<dyn ModeHandler>,
    pub module: String,
}

#[derive(Default)]
pub struct ModeRegistry {
    /// Non-status channel modes.
    pub channel_modes: HashMap<char, ChannelModeEntry>,
    pub channel_statuses: HashMap<char, StatusEntry>,
    /// symbol -> letter.
    pub channel_status_symbols: HashMap<char, char>,
    /// Status letters, rank-descending.
    pub channel_status_order: Vec<char>,
    pub user_modes: HashMap<char, UserModeEntry>,
    /// action name -> (priority, letter) apply bindings, from module
    /// channel-mode declarations.
    pub mode_action_bindings: HashMap<String, Vec<(i32, char)>>,
}

impl ModeRegistry {
    pub fn channel_mode_category(&self, letter: char) -> Option<ModeCategory> {
        if self.channel_statuses.contains_key(&letter) {
            return Some(ModeCategory::Status);
        }
        self.channel_modes.get(&letter).map(|entry| entry.category)
    }

    pub fn channel_mode_handler(&self, letter: char) -> Option<Rc<dyn ModeHandler>> {
        if let Some(status) = self.channel_statuses.get(&letter) {
            return Some(Rc::clone(&status.handler));
        }
        self.channel_modes
            .get(&letter)
            .map(|entry| Rc::clone(&entry.handler))
    }

    pub fn user_mode_category(&self, letter: char) -> Option<ModeCategory> {
        self.user_modes.get(&letter).map(|entry| entry.category)
    }

    /// Insert a status mode at its rank position in the order list.
    pub fn insert_status(&mut self, letter: char, entry: StatusEntry) {
        self.channel_status_symbols.insert(entry.symbol, letter);
        let rank = entry.rank;
        self.channel_statuses.insert(letter, entry);
        let position = self
            .channel_status_order
            .iter()
            .position(|&existing| {
                self.channel_statuses
                    .get(&existing)
                    .map(|e| e.rank < rank)
                    .unwrap_or(false)
            })
            .unwrap_or(self.channel_status_order.len());
        self.channel_status_order.insert(position, letter);
    }

    pub fn remove_status(&mut self, letter: char) {
        if let Some(entry) = self.channel_statuses.remove(&letter) {
            self.channel_status_symbols.remove(&entry.symbol);
            self.channel_status_order.retain(|&l| l != letter);
        }
    }

    /// The ISUPPORT `PREFIX` token, e.g. `(ov)@+`.
    pub fn prefix_token(&self) -> String {
        let mut letters = String::new();
        let mut symbols = String::new();
        for letter in &self.channel_status_order {
            if let Some(entry) = self.channel_statuses.get(letter) {
                letters.push(*letter);
                symbols.push(entry.symbol);
            }
        }
        format!("({letters}){symbols}")
    }

    /// The ISUPPORT `CHANMODES` token: list,keyed,param,flag letters.
    pub fn chanmodes_token(&self) -> String {
        let mut groups: [Vec<char>; 4] = Default::default();
        for (letter, entry) in &self.channel_modes {
            let slot = match entry.category {
                ModeCategory::List => 0,
                ModeCategory::ParamOnUnset => 1,
                ModeCategory::Param => 2,
                ModeCategory::NoParam => 3,
                ModeCategory::Status => continue,
            };
            groups[slot].push(*letter);
        }
        groups
            .iter_mut()
            .map(|group| {
                group.sort_unstable();
                group.iter().collect::<String>()
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Ircd {
    /// Apply a batch of channel mode changes from `source` (a user uuid, a
    /// server id, or a channel name for self-sourced changes such as
    /// auto-status). Returns the accepted changes.
    pub fn set_channel_modes(
        &mut self,
        channel_name: &str,
        changes: Vec<ModeChangeRequest>,
        source: &str,
        from_server: Option<&str>,
    ) -> Vec<AppliedChange> {
        let channel_key = irc_lower(channel_name);
        if !self.channels.contains_key(&channel_key) {
            return Vec::new();
        }
        let source_user = source.parse::<Uuid>().ok().filter(|u| self.users.contains_key(u));
        let source_name = self.display_prefix(source);
        let target = ModeTarget::Channel(channel_key.clone());

        let mut applied: Vec<AppliedChange> = Vec::new();
        for request in changes {
            let Some(category) = self.registry.modes.channel_mode_category(request.letter) else {
                if let Some(user) = source_user {
                    self.send_numeric(
                        user,
                        modircd_proto::numerics::ERR_UNKNOWNMODE,
                        vec![
                            request.letter.to_string(),
                            format!("is unknown mode char to me for {channel_name}"),
                        ],
                    );
                }
                continue;
            };

            match category {
                ModeCategory::Status => {
                    self.apply_status_change(
                        &channel_key,
                        &request,
                        source,
                        source_user,
                        &mut applied,
                    );
                }
                ModeCategory::List => {
                    self.apply_list_change(
                        &channel_key,
                        &request,
                        source,
                        source_user,
                        &source_name,
                        &target,
                        &mut applied,
                    );
                }
                ModeCategory::NoParam => {
                    let exists = self
                        .channels
                        .get(&channel_key)
                        .map(|c| c.has_mode(request.letter))
                        .unwrap_or(false);
                    if request.adding == exists {
                        continue;
                    }
                    if self.mode_change_vetoed(&target, source, source_user, &request, None) {
                        continue;
                    }
                    if let Some(channel) = self.channels.get_mut(&channel_key) {
                        if request.adding {
                            channel.modes.insert(request.letter, ModeValue::Flag);
                        } else {
                            channel.modes.remove(&request.letter);
                        }
                    }
                    self.record_channel_change(
                        &channel_key,
                        source,
                        request.adding,
                        request.letter,
                        None,
                        &mut applied,
                    );
                }
                ModeCategory::Param | ModeCategory::ParamOnUnset => {
                    self.apply_param_change(
                        &channel_key,
                        &request,
                        category,
                        source,
                        source_user,
                        &target,
                        &mut applied,
                    );
                }
            }
        }

        if !applied.is_empty() {
            let mut args = ActionArgs::ModeChanges {
                target: ModeTarget::Channel(channel_key.clone()),
                source: source.to_string(),
                source_name: source_name.clone(),
                changes: applied.clone(),
            };
            self.run_action_standard("modechanges-channel", &mut args, None);
            self.announce_channel_modes(&channel_key, &applied, source, &source_name, from_server);
        }
        applied
    }

    fn mode_change_vetoed(
        &mut self,
        target: &ModeTarget,
        source: &str,
        source_user: Option<Uuid>,
        request: &ModeChangeRequest,
        param: Option<&str>,
    ) -> bool {
        // Server-sourced changes are not subject to permission hooks.
        let Some(user) = source_user else {
            return false;
        };
        let scope = match target {
            ModeTarget::Channel(_) => "channel",
            ModeTarget::User(_) => "user",
        };
        let mut args = ActionArgs::ModePermission {
            target: target.clone(),
            source: source.to_string(),
            user: Some(user),
            adding: request.adding,
            param: param.map(str::to_string).or_else(|| request.param.clone()),
        };
        let name = format!("modepermission-{scope}-{}", request.letter);
        matches!(
            self.run_action_until_value(&name, &mut args, None),
            Some(ActionValue::Bool(false))
        )
    }

    fn record_channel_change(
        &mut self,
        channel_key: &str,
        source: &str,
        adding: bool,
        letter: char,
        param: Option<String>,
        applied: &mut Vec<AppliedChange>,
    ) {
        let mut args = ActionArgs::ModeChange {
            target: ModeTarget::Channel(channel_key.to_string()),
            source: source.to_string(),
            adding,
            param: param.clone(),
        };
        let name = format!("modechange-channel-{letter}");
        self.run_action_standard(&name, &mut args, None);
        applied.push(AppliedChange {
            adding,
            letter,
            param,
        });
    }

    fn apply_status_change(
        &mut self,
        channel_key: &str,
        request: &ModeChangeRequest,
        source: &str,
        source_user: Option<Uuid>,
        applied: &mut Vec<AppliedChange>,
    ) {
        let Some(param) = &request.param else {
            return;
        };
        // Status params are user references: a uuid internally, a nick at
        // the command boundary.
        let target_user = param
            .parse::<Uuid>()
            .ok()
            .filter(|u| self.users.contains_key(u))
            .or_else(|| self.user_nicks.get(param).copied());
        let Some(target_user) = target_user else {
            if let Some(user) = source_user {
                self.send_numeric(
                    user,
                    modircd_proto::numerics::ERR_NOSUCHNICK,
                    vec![param.clone(), "No such nick".to_string()],
                );
            }
            return;
        };
        let is_member = self
            .channels
            .get(channel_key)
            .map(|c| c.members.contains_key(&target_user))
            .unwrap_or(false);
        if !is_member {
            if let Some(user) = source_user {
                let (nick, channel_name) = (
                    self.users
                        .get(&target_user)
                        .map(|u| u.nick.clone())
                        .unwrap_or_default(),
                    self.channels
                        .get(channel_key)
                        .map(|c| c.name.clone())
                        .unwrap_or_default(),
                );
                self.send_numeric(
                    user,
                    modircd_proto::numerics::ERR_USERNOTINCHANNEL,
                    vec![nick, channel_name, "They aren't on that channel".to_string()],
                );
            }
            return;
        }
        let has_status = self
            .channels
            .get(channel_key)
            .and_then(|c| c.members.get(&target_user))
            .map(|m| m.status.contains(request.letter))
            .unwrap_or(false);
        if request.adding == has_status {
            return;
        }
        let target = ModeTarget::Channel(channel_key.to_string());
        if self.mode_change_vetoed(
            &target,
            source,
            source_user,
            request,
            Some(&target_user.to_string()),
        ) {
            return;
        }
        let order = self.registry.modes.channel_status_order.clone();
        if let Some(member) = self
            .channels
            .get_mut(channel_key)
            .and_then(|c| c.members.get_mut(&target_user))
        {
            if request.adding {
                let mut status: Vec<char> = member.status.chars().collect();
                status.push(request.letter);
                status.sort_by_key(|letter| {
                    order.iter().position(|l| l == letter).unwrap_or(usize::MAX)
                });
                member.status = status.into_iter().collect();
            } else {
                member.status.retain(|l| l != request.letter);
            }
        }
        self.record_channel_change(
            channel_key,
            source,
            request.adding,
            request.letter,
            Some(target_user.to_string()),
            applied,
        );
    }

    fn apply_list_change(
        &mut self,
        channel_key: &str,
        request: &ModeChangeRequest,
        source: &str,
        source_user: Option<Uuid>,
        source_name: &str,
        target: &ModeTarget,
        applied: &mut Vec<AppliedChange>,
    ) {
        let Some(raw_param) = &request.param else {
            return;
        };
        let Some(handler) = self.registry.modes.channel_mode_handler(request.letter) else {
            return;
        };
        let params = if request.adding {
            handler.check_set(self, target, raw_param)
        } else {
            handler.check_unset(self, target, raw_param)
        };
        let Some(params) = params else {
            return;
        };
        for param in params {
            if request.adding {
                let present = self
                    .channels
                    .get(channel_key)
                    .map(|c| {
                        c.list_entries(request.letter)
                            .iter()
                            .any(|entry| irc_eq(&entry.param, &param))
                    })
                    .unwrap_or(false);
                if present {
                    continue;
                }
                if self.mode_change_vetoed(target, source, source_user, request, Some(&param)) {
                    continue;
                }
                let entry = ListEntry {
                    param: param.clone(),
                    setter: source_name.to_string(),
                    set_at: now_ts(),
                };
                if let Some(channel) = self.channels.get_mut(channel_key) {
                    match channel
                        .modes
                        .entry(request.letter)
                        .or_insert_with(|| ModeValue::List(Vec::new()))
                    {
                        ModeValue::List(entries) => entries.push(entry),
                        other => {
                            warn!(letter = %request.letter, "list mode slot held a non-list value");
                            *other = ModeValue::List(vec![entry]);
                        }
                    }
                }
                self.record_channel_change(
                    channel_key,
                    source,
                    true,
                    request.letter,
                    Some(param),
                    applied,
                );
            } else {
                let removed = self
                    .channels
                    .get_mut(channel_key)
                    .map(|channel| match channel.modes.get_mut(&request.letter) {
                        Some(ModeValue::List(entries)) => {
                            let before = entries.len();
                            entries.retain(|entry| !irc_eq(&entry.param, &param));
                            let removed = entries.len() != before;
                            if entries.is_empty() {
                                channel.modes.remove(&request.letter);
                            }
                            removed
                        }
                        _ => false,
                    })
                    .unwrap_or(false);
                if removed {
                    self.record_channel_change(
                        channel_key,
                        source,
                        false,
                        request.letter,
                        Some(param),
                        applied,
                    );
                }
            }
        }
    }

    fn apply_param_change(
        &mut self,
        channel_key: &str,
        request: &ModeChangeRequest,
        category: ModeCategory,
        source: &str,
        source_user: Option<Uuid>,
        target: &ModeTarget,
        applied: &mut Vec<AppliedChange>,
    ) {
        let Some(handler) = self.registry.modes.channel_mode_handler(request.letter) else {
            return;
        };
        if request.adding {
            let Some(raw_param) = &request.param else {
                return;
            };
            let Some(params) = handler.check_set(self, target, raw_param) else {
                return;
            };
            let Some(param) = params.into_iter().next() else {
                return;
            };
            let current = self
                .channels
                .get(channel_key)
                .and_then(|c| c.mode_param(request.letter).map(str::to_string));
            if current.as_deref() == Some(param.as_str()) {
                return;
            }
            if self.mode_change_vetoed(target, source, source_user, request, Some(&param)) {
                return;
            }
            if let Some(channel) = self.channels.get_mut(channel_key) {
                channel
                    .modes
                    .insert(request.letter, ModeValue::Param(param.clone()));
            }
            self.record_channel_change(
                channel_key,
                source,
                true,
                request.letter,
                Some(param),
                applied,
            );
        } else {
            if category == ModeCategory::ParamOnUnset && request.param.is_none() {
                return;
            }
            let current = self
                .channels
                .get(channel_key)
                .and_then(|c| c.mode_param(request.letter).map(str::to_string));
            let Some(current) = current else {
                return;
            };
            if self.mode_change_vetoed(target, source, source_user, request, Some(&current)) {
                return;
            }
            if let Some(channel) = self.channels.get_mut(channel_key) {
                channel.modes.remove(&request.letter);
            }
            self.record_channel_change(
                channel_key,
                source,
                false,
                request.letter,
                Some(current),
                applied,
            );
        }
    }

    /// Apply user mode changes. Only NoParam and Param categories are in
    /// use for user modes.
    pub fn set_user_modes(
        &mut self,
        user: Uuid,
        changes: Vec<ModeChangeRequest>,
        source: &str,
        from_server: Option<&str>,
    ) -> Vec<AppliedChange> {
        if !self.users.contains_key(&user) {
            return Vec::new();
        }
        let source_user = source.parse::<Uuid>().ok().filter(|u| self.users.contains_key(u));
        let target = ModeTarget::User(user);
        let mut applied = Vec::new();
        for request in changes {
            let Some(category) = self.registry.modes.user_mode_category(request.letter) else {
                continue;
            };
            let param = match category {
                ModeCategory::NoParam => None,
                _ => {
                    if request.adding && request.param.is_none() {
                        continue;
                    }
                    request.param.clone()
                }
            };
            let exists = self
                .users
                .get(&user)
                .map(|u| u.modes.contains_key(&request.letter))
                .unwrap_or(false);
            if request.adding && exists && category == ModeCategory::NoParam {
                continue;
            }
            if !request.adding && !exists {
                continue;
            }
            if self.mode_change_vetoed(&target, source, source_user, &request, param.as_deref()) {
                continue;
            }
            if let Some(entity) = self.users.get_mut(&user) {
                if request.adding {
                    entity.modes.insert(request.letter, param.clone());
                } else {
                    entity.modes.remove(&request.letter);
                }
            }
            let mut args = ActionArgs::ModeChange {
                target: target.clone(),
                source: source.to_string(),
                adding: request.adding,
                param: param.clone(),
            };
            self.run_action_standard(&format!("modechange-user-{}", request.letter), &mut args, None);
            applied.push(AppliedChange {
                adding: request.adding,
                letter: request.letter,
                param,
            });
        }
        if !applied.is_empty() {
            let source_name = self.display_prefix(source);
            let mut args = ActionArgs::ModeChanges {
                target,
                source: source.to_string(),
                source_name: source_name.clone(),
                changes: applied.clone(),
            };
            self.run_action_standard("modechanges-user", &mut args, None);
            self.announce_user_modes(user, &applied, source, &source_name, from_server);
        }
        applied
    }

    /// Render applied changes as a MODE argument list, translating status
    /// params from uuids to nicks when `display` is set.
    pub fn format_mode_changes(&self, changes: &[AppliedChange], display: bool) -> Vec<String> {
        let mut modestring = String::new();
        let mut params = Vec::new();
        let mut last_sign = None;
        for change in changes {
            let sign = if change.adding { '+' } else { '-' };
            if last_sign != Some(sign) {
                modestring.push(sign);
                last_sign = Some(sign);
            }
            modestring.push(change.letter);
            if let Some(param) = &change.param {
                if display {
                    let shown = param
                        .parse::<Uuid>()
                        .ok()
                        .and_then(|u| self.users.get(&u))
                        .map(|u| u.nick.clone())
                        .unwrap_or_else(|| param.clone());
                    params.push(shown);
                } else {
                    params.push(param.clone());
                }
            }
        }
        let mut out = vec![modestring];
        out.extend(params);
        out
    }

    fn announce_channel_modes(
        &mut self,
        channel_key: &str,
        applied: &[AppliedChange],
        source: &str,
        source_name: &str,
        from_server: Option<&str>,
    ) {
        let Some(channel) = self.channels.get(channel_key) else {
            return;
        };
        let channel_name = channel.name.clone();
        let members: Vec<Uuid> = channel.members.keys().copied().collect();

        let mut display_params = vec![channel_name.clone()];
        display_params.extend(self.format_mode_changes(applied, true));
        let local = Message::with_prefix(source_name, "MODE", display_params);
        for member in members {
            self.send_to_user(member, &local);
        }

        let mut wire_params = vec![channel_name];
        wire_params.extend(self.format_mode_changes(applied, false));
        let remote = Message::with_prefix(source, "MODE", wire_params);
        self.broadcast_to_servers(from_server, &remote);
    }

    fn announce_user_modes(
        &mut self,
        user: Uuid,
        applied: &[AppliedChange],
        source: &str,
        source_name: &str,
        from_server: Option<&str>,
    ) {
        let Some(entity) = self.users.get(&user) else {
            return;
        };
        let nick = entity.nick.clone();
        let mut display_params = vec![nick];
        display_params.extend(self.format_mode_changes(applied, true));
        let local = Message::with_prefix(source_name, "MODE", display_params);
        self.send_to_user(user, &local);

        let mut wire_params = vec![user.to_string()];
        wire_params.extend(self.format_mode_changes(applied, false));
        let remote = Message::with_prefix(source, "MODE", wire_params);
        self.broadcast_to_servers(from_server, &remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{add_user, test_ircd};

    struct Passthrough;
    impl ModeHandler for Passthrough {}

    #[test]
    fn status_order_stays_rank_descending() {
        let mut registry = ModeRegistry::default();
        for (letter, rank, symbol) in [('v', 10, '+'), ('o', 100, '@'), ('h', 50, '%')] {
            registry.insert_status(
                letter,
                StatusEntry {
                    rank,
                    symbol,
                    handler: Rc::new(Passthrough),
                    module: "test".to_string(),
                },
            );
        }
        assert_eq!(registry.channel_status_order, vec!['o', 'h', 'v']);

        registry.remove_status('h');
        assert_eq!(registry.channel_status_order, vec!['o', 'v']);
        registry.insert_status(
            'q',
            StatusEntry {
                rank: 200,
                symbol: '~',
                handler: Rc::new(Passthrough),
                module: "test".to_string(),
            },
        );
        assert_eq!(registry.channel_status_order, vec!['q', 'o', 'v']);
    }

    #[test]
    fn prefix_and_chanmodes_tokens() {
        let ircd = test_ircd();
        assert_eq!(ircd.registry.modes.prefix_token(), "(ov)@+");
        // b is the only core non-status channel mode: a list mode.
        assert_eq!(ircd.registry.modes.chanmodes_token(), "b,,,");
    }

    #[test]
    fn reapplying_current_modes_changes_nothing() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#test", None);
        let server_id = ircd.server_id().to_string();

        // The creator already holds +o.
        let applied = ircd.set_channel_modes(
            "#test",
            vec![ModeChangeRequest {
                adding: true,
                letter: 'o',
                param: Some(alice.to_string()),
            }],
            &server_id,
            None,
        );
        assert!(applied.is_empty());

        let first = ircd.set_channel_modes(
            "#test",
            vec![ModeChangeRequest {
                adding: true,
                letter: 'b',
                param: Some("spammer!*@*".to_string()),
            }],
            &server_id,
            None,
        );
        assert_eq!(first.len(), 1);
        let again = ircd.set_channel_modes(
            "#test",
            vec![ModeChangeRequest {
                adding: true,
                letter: 'b',
                param: Some("spammer!*@*".to_string()),
            }],
            &server_id,
            None,
        );
        assert!(again.is_empty());
    }

    #[test]
    fn unknown_letter_is_skipped() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        ircd.join_channel(alice, "#test", None);
        let server_id = ircd.server_id().to_string();
        let applied = ircd.set_channel_modes(
            "#test",
            vec![ModeChangeRequest {
                adding: true,
                letter: 'z',
                param: None,
            }],
            &server_id,
            None,
        );
        assert!(applied.is_empty());
    }

    #[test]
    fn status_changes_reorder_membership_letters() {
        let mut ircd = test_ircd();
        let alice = add_user(&mut ircd, "alice");
        let bob = add_user(&mut ircd, "bob");
        ircd.join_channel(alice, "#test", None);
        ircd.join_channel(bob, "#test", None);
        let server_id = ircd.server_id().to_string();

        ircd.set_channel_modes(
            "#test",
            vec![
                ModeChangeRequest {
                    adding: true,
                    letter: 'v',
                    param: Some(bob.to_string()),
                },
                ModeChangeRequest {
                    adding: true,
                    letter: 'o',
                    param: Some(bob.to_string()),
                },
            ],
            &server_id,
            None,
        );
        let channel = ircd.channels.get("#test").expect("channel exists");
        // Highest rank first regardless of grant order.
        assert_eq!(channel.members[&bob].status, "ov");
        assert_eq!(channel.user_rank(&ircd.registry.modes, bob), 100);
    }

    #[test]
    fn format_groups_signs() {
        let ircd = test_ircd();
        let changes = vec![
            AppliedChange {
                adding: true,
                letter: 'o',
                param: Some("alice".to_string()),
            },
            AppliedChange {
                adding: true,
                letter: 'v',
                param: Some("bob".to_string()),
            },
            AppliedChange {
                adding: false,
                letter: 'b',
                param: Some("x!*@*".to_string()),
            },
        ];
        let rendered = ircd.format_mode_changes(&changes, false);
        assert_eq!(rendered[0], "+ov-b");
        assert_eq!(&rendered[1..], &["alice", "bob", "x!*@*"]);
    }
}

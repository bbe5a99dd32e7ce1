//! The action bus.
//!
//! Modules cooperate through named actions. Each action holds a
//! priority-descending list of handlers; equal priorities run in
//! registration order. Channel modes may additionally bind themselves to
//! actions ("apply" bindings): when an action runs with a channel filter,
//! every bound mode that is set on a filtered channel gets its `apply`
//! method invoked at the binding's priority.
//!
//! Four invocation styles exist: standard (run everything), until-true
//! (short-circuit on the first truthy value), until-value (short-circuit on
//! the first value at all), and processing (standard, but handlers mutate
//! shared lists carried in the arguments, e.g. a delivery list).

use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

use uuid::Uuid;

use crate::commands::CommandData;
use crate::modes::{AppliedChange, ModeTarget};
use crate::state::Ircd;

pub type ActionFn = Rc<dyn for<'a> Fn(&mut Ircd, &mut ActionArgs<'a>) -> Option<ActionValue>>;
pub type ScopeFn = Rc<dyn Fn(&Ircd, &ActionFilter) -> bool>;

/// A registered action handler.
#[derive(Clone)]
pub struct ActionEntry {
    pub module: String,
    pub priority: i32,
    pub func: ActionFn,
    /// Optional locality check consulted when the caller passes a filter.
    pub scope: Option<ScopeFn>,
}

/// Call-time target filter: restricts which handlers fire and which
/// channels mode-apply bindings consider.
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub users: Vec<Uuid>,
    /// Folded channel names.
    pub channels: Vec<String>,
}

impl ActionFilter {
    pub fn channels(channels: Vec<String>) -> ActionFilter {
        ActionFilter {
            users: Vec::new(),
            channels,
        }
    }
}

/// Value returned by an action handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionValue {
    Bool(bool),
    Text(String),
    Map(HashMap<String, String>),
}

impl ActionValue {
    pub fn truthy(&self) -> bool {
        match self {
            ActionValue::Bool(b) => *b,
            ActionValue::Text(t) => !t.is_empty(),
            ActionValue::Map(m) => !m.is_empty(),
        }
    }
}

/// How a user left a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveType {
    Part,
    Kick,
    Quit,
}

/// Who caused the leave and why.
#[derive(Debug, Clone)]
pub struct LeaveDetail {
    pub by_user: Option<Uuid>,
    pub by_server: Option<String>,
    pub reason: String,
}

/// Typed argument shapes, one variant per family of action signatures.
pub enum ActionArgs<'a> {
    /// `userconnect`, `remoteregister`, `welcome`, `pinguser`,
    /// `updateuserbancache`.
    User { user: Uuid },
    /// `quit`, `remotequit`.
    Quit { user: Uuid, reason: String },
    /// `pingserver`, `serverconnect`, `serverquit`.
    Server { server: String },
    /// `moduleload`, `moduleunload`.
    Module { name: String },
    /// `changeipaddress`.
    IpChange { user: Uuid, old_ip: IpAddr },
    /// `join`, `joinpermission`, `userbancheck`.
    ChannelUser { channel: String, user: Uuid },
    /// `modepermission-<scope>-<letter>`.
    ModePermission {
        target: ModeTarget,
        source: String,
        user: Option<Uuid>,
        adding: bool,
        param: Option<String>,
    },
    /// `modechange-<scope>-<letter>`.
    ModeChange {
        target: ModeTarget,
        source: String,
        adding: bool,
        param: Option<String>,
    },
    /// `modechanges-<scope>`.
    ModeChanges {
        target: ModeTarget,
        source: String,
        source_name: String,
        changes: Vec<AppliedChange>,
    },
    /// `modeactioncheck-channel-withuser`.
    ModeActionCheck {
        action: String,
        mode: char,
        channel: String,
        user: Uuid,
    },
    /// `usermatchban-<letter>`.
    BanMatch {
        user: Uuid,
        negated: bool,
        mask: String,
    },
    /// `commandpermission-<CMD>`, `commandmodify-<CMD>`.
    Command {
        user: Uuid,
        command: String,
        data: &'a mut CommandData,
    },
    /// `leavemessage` (processing; handlers consume `send_list`).
    Leave {
        send_list: &'a mut Vec<Uuid>,
        channel: String,
        user: Uuid,
        leave_type: LeaveType,
        detail: LeaveDetail,
        from_server: Option<String>,
    },
    /// `channelmessage` (processing).
    ChannelMessage {
        send_list: &'a mut Vec<Uuid>,
        channel: String,
        source: Uuid,
        command: String,
        text: String,
    },
    /// `topic`.
    Topic {
        channel: String,
        setter: String,
        old_topic: Option<String>,
    },
    /// `checkchannellevel`.
    ChannelLevel {
        level_type: String,
        channel: String,
        user: Uuid,
    },
    /// `channelstatusoverride`.
    StatusOverride {
        channel: String,
        user: Uuid,
        mode: char,
        param: String,
    },
    /// `buildisupport`.
    Isupport {
        tokens: &'a mut Vec<(String, Option<String>)>,
    },
    /// `keepchannelalive`.
    ChannelKeep { channel: String },
    /// `handledeleteaccount`, `handleaccountchangename`.
    Account {
        name: String,
        renamed_to: Option<String>,
    },
}

enum Invocation {
    Handler(ActionEntry),
    ModeApply {
        handler: Rc<dyn crate::modes::ModeHandler>,
        /// `(folded channel, stored mode param)` pairs to apply against.
        channels: Vec<(String, String)>,
    },
}

impl Ircd {
    fn collect_invocations(&self, name: &str, filter: Option<&ActionFilter>) -> Vec<Invocation> {
        let mut out: Vec<(i32, usize, Invocation)> = Vec::new();
        let mut seq = 0usize;

        if let Some(entries) = self.registry.actions.get(name) {
            for entry in entries {
                if let (Some(scope), Some(filter)) = (&entry.scope, filter) {
                    if !scope(self, filter) {
                        continue;
                    }
                }
                out.push((entry.priority, seq, Invocation::Handler(entry.clone())));
                seq += 1;
            }
        }

        // Mode-apply bindings only fire with a channel filter, against the
        // filtered channels that actually carry the mode.
        if let Some(filter) = filter {
            if !filter.channels.is_empty() {
                if let Some(bindings) = self.registry.modes.mode_action_bindings.get(name) {
                    for (priority, letter) in bindings {
                        let mut channels = Vec::new();
                        for channel_name in &filter.channels {
                            let Some(channel) = self.channels.get(channel_name) else {
                                continue;
                            };
                            if let Some(value) = channel.modes.get(letter) {
                                let param = match value {
                                    crate::state::channel::ModeValue::Param(p) => p.clone(),
                                    _ => String::new(),
                                };
                                channels.push((channel_name.clone(), param));
                            }
                        }
                        if channels.is_empty() {
                            continue;
                        }
                        let Some(handler) = self.registry.modes.channel_mode_handler(*letter)
                        else {
                            continue;
                        };
                        out.push((
                            *priority,
                            seq,
                            Invocation::ModeApply { handler, channels },
                        ));
                        seq += 1;
                    }
                }
            }
        }

        out.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        out.into_iter().map(|(_, _, inv)| inv).collect()
    }

    fn run_invocation(
        &mut self,
        name: &str,
        invocation: &Invocation,
        args: &mut ActionArgs<'_>,
    ) -> Option<ActionValue> {
        match invocation {
            Invocation::Handler(entry) => (entry.func)(self, args),
            Invocation::ModeApply { handler, channels } => {
                for (channel, param) in channels {
                    let result = handler.apply(self, name, channel, param, args);
                    if result.is_some() {
                        return result;
                    }
                }
                None
            }
        }
    }

    /// Run every handler in priority order; return values are ignored.
    pub fn run_action_standard(
        &mut self,
        name: &str,
        args: &mut ActionArgs<'_>,
        filter: Option<&ActionFilter>,
    ) {
        for invocation in self.collect_invocations(name, filter) {
            self.run_invocation(name, &invocation, args);
        }
    }

    /// Short-circuit on the first truthy value.
    pub fn run_action_until_true(
        &mut self,
        name: &str,
        args: &mut ActionArgs<'_>,
        filter: Option<&ActionFilter>,
    ) -> Option<ActionValue> {
        for invocation in self.collect_invocations(name, filter) {
            if let Some(value) = self.run_invocation(name, &invocation, args) {
                if value.truthy() {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Short-circuit on the first returned value, truthy or not.
    pub fn run_action_until_value(
        &mut self,
        name: &str,
        args: &mut ActionArgs<'_>,
        filter: Option<&ActionFilter>,
    ) -> Option<ActionValue> {
        for invocation in self.collect_invocations(name, filter) {
            if let Some(value) = self.run_invocation(name, &invocation, args) {
                return Some(value);
            }
        }
        None
    }

    /// Run every handler; by convention the handlers mutate shared in/out
    /// lists carried in `args` (delivery suppression, rerouting).
    pub fn run_action_processing(
        &mut self,
        name: &str,
        args: &mut ActionArgs<'_>,
        filter: Option<&ActionFilter>,
    ) {
        self.run_action_standard(name, args, filter);
    }
}

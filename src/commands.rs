//! The command contract and registries.
//!
//! Commands are contributed by modules. Each command name maps to a
//! priority-descending handler list; dispatch walks the list and the first
//! handler whose `parse_params` accepts the message executes. User and
//! server connections use separate tables.

use std::collections::HashMap;
use std::rc::Rc;

use modircd_proto::Tag;
use uuid::Uuid;

use crate::modes::ModeChangeRequest;
use crate::state::Ircd;

/// Parsed command payload handed from `parse_params` to `execute`.
///
/// A flat bag of typed fields; each command fills the fields it needs.
#[derive(Debug, Default, Clone)]
pub struct CommandData {
    pub channel: Option<String>,
    pub target_user: Option<Uuid>,
    pub reason: Option<String>,
    pub text: Option<String>,
    /// Channel message routing: `(folded channel, message)` pairs.
    /// `commandmodify-*` handlers may strip entries.
    pub target_chans: Vec<(String, String)>,
    pub target_users: Vec<(Uuid, String)>,
    pub mode_changes: Vec<ModeChangeRequest>,
    pub source_user: Option<Uuid>,
    pub source_server: Option<String>,
    pub new_nick: Option<String>,
    pub token: Option<String>,
    pub dest: Option<String>,
    /// Raw positional params for commands that carry several fields.
    pub params: Vec<String>,
    /// Server-command race tolerance: the prefix resolved to a recently
    /// quit entity; drop the command as a successful no-op.
    pub lost_source: bool,
    /// Same, for the destination.
    pub lost_target: bool,
}

/// Per-invocation error dedup: the first error key wins, later keys are
/// dropped, repeated sends under the winning key go through.
pub struct CommandContext {
    error_key: Option<String>,
}

impl CommandContext {
    pub fn new() -> CommandContext {
        CommandContext { error_key: None }
    }

    pub fn send_single_error(
        &mut self,
        ircd: &mut Ircd,
        user: Uuid,
        key: &str,
        numeric: &str,
        params: Vec<String>,
    ) {
        match &self.error_key {
            Some(existing) if existing != key => return,
            _ => {}
        }
        self.error_key = Some(key.to_string());
        ircd.send_numeric(user, numeric, params);
    }
}

impl Default for CommandContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A command issued by a local user connection.
pub trait UserCommand {
    /// `Some(true)`: registered connections only. `Some(false)`: only
    /// before registration. `None`: either.
    fn for_registered(&self) -> Option<bool> {
        Some(true)
    }

    fn resets_idle(&self) -> bool {
        true
    }

    fn parse_params(
        &self,
        ircd: &mut Ircd,
        ctx: &mut CommandContext,
        user: Uuid,
        params: &[String],
        prefix: Option<&str>,
        tags: &[Tag],
    ) -> Option<CommandData>;

    fn affected_users(&self, _ircd: &Ircd, _user: Uuid, _data: &CommandData) -> Vec<Uuid> {
        Vec::new()
    }

    fn affected_channels(&self, _ircd: &Ircd, _user: Uuid, _data: &CommandData) -> Vec<String> {
        Vec::new()
    }

    fn execute(&self, ircd: &mut Ircd, user: Uuid, data: &mut CommandData) -> bool;
}

/// A command received from a linked server.
pub trait ServerCommand {
    /// `server` is the id of the directly linked peer the line arrived on.
    fn parse_params(
        &self,
        ircd: &mut Ircd,
        server: &str,
        params: &[String],
        prefix: Option<&str>,
        tags: &[Tag],
    ) -> Option<CommandData>;

    fn execute(&self, ircd: &mut Ircd, server: &str, data: &mut CommandData) -> bool;
}

#[derive(Clone)]
pub struct UserCommandEntry {
    pub priority: i32,
    pub module: String,
    pub handler: Rc<dyn UserCommand>,
}

#[derive(Clone)]
pub struct ServerCommandEntry {
    pub priority: i32,
    pub module: String,
    pub handler: Rc<dyn ServerCommand>,
}

#[derive(Default)]
pub struct CommandRegistry {
    pub user_commands: HashMap<String, Vec<UserCommandEntry>>,
    pub server_commands: HashMap<String, Vec<ServerCommandEntry>>,
}

impl CommandRegistry {
    /// Insert keeping the list priority-descending, ties appended.
    pub fn insert_user(&mut self, name: &str, entry: UserCommandEntry) {
        let list = self.user_commands.entry(name.to_string()).or_default();
        let position = list
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(list.len());
        list.insert(position, entry);
    }

    pub fn insert_server(&mut self, name: &str, entry: ServerCommandEntry) {
        let list = self.server_commands.entry(name.to_string()).or_default();
        let position = list
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(list.len());
        list.insert(position, entry);
    }

    pub fn remove_module(&mut self, module: &str) {
        for list in self.user_commands.values_mut() {
            list.retain(|entry| entry.module != module);
        }
        self.user_commands.retain(|_, list| !list.is_empty());
        for list in self.server_commands.values_mut() {
            list.retain(|entry| entry.module != module);
        }
        self.server_commands.retain(|_, list| !list.is_empty());
    }
}

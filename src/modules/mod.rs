//! The module system.
//!
//! A module contributes channel modes, user modes, actions, user commands
//! and server commands, plus lifecycle hooks. Loading is atomic: every
//! contribution is staged and checked for collisions first, and nothing is
//! registered if anything is rejected.

pub mod ban;
pub mod channel_ops;
pub mod channel_register;
pub mod conn_limit;
pub mod kick;
pub mod message;
pub mod mode_cmd;
pub mod ping_pong;
pub mod registration;
pub mod status;
pub mod topic;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, info};

use crate::commands::{
    CommandRegistry, ServerCommand, ServerCommandEntry, UserCommand, UserCommandEntry,
};
use crate::config::Config;
use crate::error::{ConfigValidationError, ModuleLoadError};
use crate::hooks::{ActionArgs, ActionEntry, ActionFn, ScopeFn};
use crate::modes::{
    ChannelModeEntry, ModeCategory, ModeHandler, ModeRegistry, StatusEntry, UserModeEntry,
};
use crate::state::Ircd;

/// A channel mode contributed by a module. Status modes must carry a rank
/// and a symbol; other categories must not.
pub struct ChannelModeDef {
    pub letter: char,
    pub category: ModeCategory,
    pub handler: Rc<dyn ModeHandler>,
    pub rank: Option<i32>,
    pub symbol: Option<char>,
    /// Actions this mode binds its `apply` method to, with priorities.
    pub affected_actions: Vec<(String, i32)>,
}

pub struct UserModeDef {
    pub letter: char,
    pub category: ModeCategory,
    pub handler: Rc<dyn ModeHandler>,
}

pub struct ActionDef {
    pub action: String,
    pub priority: i32,
    pub func: ActionFn,
    pub scope: Option<ScopeFn>,
}

pub struct UserCommandDef {
    pub command: &'static str,
    pub priority: i32,
    pub handler: Rc<dyn UserCommand>,
}

pub struct ServerCommandDef {
    pub command: &'static str,
    pub priority: i32,
    pub handler: Rc<dyn ServerCommand>,
}

/// The module contract.
pub trait Module {
    fn name(&self) -> &'static str;

    /// Core modules are always loaded, regardless of configuration.
    fn is_core(&self) -> bool {
        false
    }

    /// Whether every linked server must carry this module even if it
    /// contributes nothing visible.
    fn required_on_all_servers(&self) -> bool {
        false
    }

    fn channel_modes(&self) -> Vec<ChannelModeDef> {
        Vec::new()
    }

    fn user_modes(&self) -> Vec<UserModeDef> {
        Vec::new()
    }

    fn actions(&self) -> Vec<ActionDef> {
        Vec::new()
    }

    fn user_commands(&self) -> Vec<UserCommandDef> {
        Vec::new()
    }

    fn server_commands(&self) -> Vec<ServerCommandDef> {
        Vec::new()
    }

    fn verify_config(&self, _config: &Config) -> Result<(), ConfigValidationError> {
        Ok(())
    }

    fn on_load(&self, _ircd: &mut Ircd) {}
    fn on_unload(&self, _ircd: &mut Ircd) {}
    fn on_full_unload(&self, _ircd: &mut Ircd) {}
    fn on_rehash(&self, _ircd: &mut Ircd) {}
}

pub struct ModuleRecord {
    pub module: Rc<dyn Module>,
}

/// Process-wide registries: modes, commands, actions, loaded modules.
#[derive(Default)]
pub struct Registry {
    pub modes: ModeRegistry,
    pub commands: CommandRegistry,
    pub actions: HashMap<String, Vec<ActionEntry>>,
    pub modules: HashMap<String, ModuleRecord>,
    /// Modules that contribute network-visible behavior (or declare
    /// `required_on_all_servers`).
    pub common_modules: HashSet<String>,
}

impl Registry {
    /// Insert keeping the list priority-descending, ties appended.
    pub fn insert_action(&mut self, name: &str, entry: ActionEntry) {
        let list = self.actions.entry(name.to_string()).or_default();
        let position = list
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(list.len());
        list.insert(position, entry);
    }

    fn remove_module_actions(&mut self, module: &str) {
        for list in self.actions.values_mut() {
            list.retain(|entry| entry.module != module);
        }
        self.actions.retain(|_, list| !list.is_empty());
    }
}

/// The core module set, always loaded.
pub fn core_modules() -> Vec<Rc<dyn Module>> {
    vec![
        Rc::new(registration::NickCommand),
        Rc::new(registration::QuitCommand),
        Rc::new(ping_pong::PingPong),
        Rc::new(channel_ops::JoinCommand),
        Rc::new(channel_ops::PartCommand),
        Rc::new(kick::KickCommand),
        Rc::new(message::MessageCommands),
        Rc::new(mode_cmd::ModeCommand),
        Rc::new(topic::TopicCommand),
        Rc::new(status::StatusOp),
        Rc::new(status::StatusVoice),
        Rc::new(ban::BanMode),
    ]
}

/// Optional modules selectable through the `modules` config key.
pub fn optional_module(name: &str) -> Option<Rc<dyn Module>> {
    match name {
        "ConnectionLimit" => Some(Rc::new(conn_limit::ConnectionLimit::new())),
        "ChannelRegister" => Some(Rc::new(channel_register::ChannelRegister)),
        _ => None,
    }
}

impl Ircd {
    /// Load a module atomically. On error, nothing was registered.
    pub fn load_module(&mut self, module: Rc<dyn Module>) -> Result<(), ModuleLoadError> {
        let name = module.name();
        if name.is_empty() {
            return Err(ModuleLoadError::new("???", "Module did not provide a name"));
        }
        if self.registry.modules.contains_key(name) {
            return Ok(());
        }
        module
            .verify_config(&self.config)
            .map_err(|e| ModuleLoadError::new(name, e.to_string()))?;

        let channel_modes = module.channel_modes();
        let user_modes = module.user_modes();
        let actions = module.actions();
        let user_commands = module.user_commands();
        let server_commands = module.server_commands();

        // Stage: check every collision before touching the registries.
        let mut staged_letters: HashSet<char> = HashSet::new();
        let mut staged_symbols: HashSet<char> = HashSet::new();
        let mut staged_ranks: HashSet<i32> = HashSet::new();
        for def in &channel_modes {
            if self.registry.modes.channel_mode_category(def.letter).is_some()
                || !staged_letters.insert(def.letter)
            {
                return Err(ModuleLoadError::new(
                    name,
                    format!(
                        "Tries to implement channel mode +{} when that mode is already implemented",
                        def.letter
                    ),
                ));
            }
            if def.category == ModeCategory::Status {
                let (Some(rank), Some(symbol)) = (def.rank, def.symbol) else {
                    return Err(ModuleLoadError::new(
                        name,
                        format!(
                            "Specifies channel status mode {} without a rank or symbol",
                            def.letter
                        ),
                    ));
                };
                if self.registry.modes.channel_status_symbols.contains_key(&symbol)
                    || !staged_symbols.insert(symbol)
                {
                    return Err(ModuleLoadError::new(
                        name,
                        format!(
                            "Tries to create a channel rank with symbol {symbol} when that symbol is already in use"
                        ),
                    ));
                }
                let rank_taken = self
                    .registry
                    .modes
                    .channel_statuses
                    .values()
                    .any(|entry| entry.rank == rank);
                if rank_taken || !staged_ranks.insert(rank) {
                    return Err(ModuleLoadError::new(
                        name,
                        format!("Tries to create a channel rank {rank} that is already in use"),
                    ));
                }
            } else if def.rank.is_some() || def.symbol.is_some() {
                return Err(ModuleLoadError::new(
                    name,
                    format!("Gives non-status channel mode +{} a rank or symbol", def.letter),
                ));
            }
        }
        let mut staged_user_letters: HashSet<char> = HashSet::new();
        for def in &user_modes {
            if self.registry.modes.user_mode_category(def.letter).is_some()
                || !staged_user_letters.insert(def.letter)
            {
                return Err(ModuleLoadError::new(
                    name,
                    format!(
                        "Tries to implement user mode +{} when that mode is already implemented",
                        def.letter
                    ),
                ));
            }
            if def.category == ModeCategory::Status {
                return Err(ModuleLoadError::new(
                    name,
                    format!("User mode +{} may not be a status mode", def.letter),
                ));
            }
        }

        // Commit.
        let common = !channel_modes.is_empty()
            || !user_modes.is_empty()
            || !server_commands.is_empty()
            || module.required_on_all_servers();
        for def in channel_modes {
            if def.category == ModeCategory::Status {
                self.registry.modes.insert_status(
                    def.letter,
                    StatusEntry {
                        rank: def.rank.expect("checked in staging"),
                        symbol: def.symbol.expect("checked in staging"),
                        handler: def.handler,
                        module: name.to_string(),
                    },
                );
            } else {
                self.registry.modes.channel_modes.insert(
                    def.letter,
                    ChannelModeEntry {
                        category: def.category,
                        handler: def.handler,
                        module: name.to_string(),
                    },
                );
            }
            for (action, priority) in def.affected_actions {
                let list = self
                    .registry
                    .modes
                    .mode_action_bindings
                    .entry(action)
                    .or_default();
                let position = list
                    .iter()
                    .position(|(existing, _)| *existing < priority)
                    .unwrap_or(list.len());
                list.insert(position, (priority, def.letter));
            }
        }
        for def in user_modes {
            self.registry.modes.user_modes.insert(
                def.letter,
                UserModeEntry {
                    category: def.category,
                    handler: def.handler,
                    module: name.to_string(),
                },
            );
        }
        for def in actions {
            self.registry.insert_action(
                &def.action,
                ActionEntry {
                    module: name.to_string(),
                    priority: def.priority,
                    func: def.func,
                    scope: def.scope,
                },
            );
        }
        for def in user_commands {
            self.registry.commands.insert_user(
                def.command,
                UserCommandEntry {
                    priority: def.priority,
                    module: name.to_string(),
                    handler: def.handler,
                },
            );
        }
        for def in server_commands {
            self.registry.commands.insert_server(
                def.command,
                ServerCommandEntry {
                    priority: def.priority,
                    module: name.to_string(),
                    handler: def.handler,
                },
            );
        }

        self.registry.modules.insert(
            name.to_string(),
            ModuleRecord {
                module: Rc::clone(&module),
            },
        );
        if common {
            self.registry.common_modules.insert(name.to_string());
        }
        module.on_load(self);

        let mut args = ActionArgs::Module {
            name: name.to_string(),
        };
        self.run_action_standard("moduleload", &mut args, None);
        debug!(module = name, common, "module loaded");
        Ok(())
    }

    /// Remove a module's registrations. `full` additionally invokes the
    /// module's teardown for side effects.
    pub fn unload_module(&mut self, name: &str, full: bool) {
        let Some(record) = self.registry.modules.remove(name) else {
            return;
        };
        self.registry.common_modules.remove(name);

        let letters: Vec<char> = self
            .registry
            .modes
            .channel_modes
            .iter()
            .filter(|(_, entry)| entry.module == name)
            .map(|(letter, _)| *letter)
            .collect();
        for letter in &letters {
            self.registry.modes.channel_modes.remove(letter);
        }
        let statuses: Vec<char> = self
            .registry
            .modes
            .channel_statuses
            .iter()
            .filter(|(_, entry)| entry.module == name)
            .map(|(letter, _)| *letter)
            .collect();
        for letter in &statuses {
            self.registry.modes.remove_status(*letter);
        }
        for list in self.registry.modes.mode_action_bindings.values_mut() {
            list.retain(|(_, letter)| !letters.contains(letter) && !statuses.contains(letter));
        }
        self.registry
            .modes
            .mode_action_bindings
            .retain(|_, list| !list.is_empty());
        let user_letters: Vec<char> = self
            .registry
            .modes
            .user_modes
            .iter()
            .filter(|(_, entry)| entry.module == name)
            .map(|(letter, _)| *letter)
            .collect();
        for letter in user_letters {
            self.registry.modes.user_modes.remove(&letter);
        }
        self.registry.remove_module_actions(name);
        self.registry.commands.remove_module(name);

        record.module.on_unload(self);
        if full {
            record.module.on_full_unload(self);
        }
        info!(module = name, full, "module unloaded");
    }

    /// Reload: unload without teardown, then load again.
    pub fn reload_module(&mut self, name: &str) -> Result<(), ModuleLoadError> {
        let Some(record) = self.registry.modules.get(name) else {
            return Err(ModuleLoadError::new(name, "module is not loaded"));
        };
        let module = Rc::clone(&record.module);
        self.unload_module(name, false);
        self.load_module(module)
    }

    /// Load the core set plus the configured optional modules.
    pub fn load_configured_modules(&mut self) -> Result<(), ModuleLoadError> {
        for module in core_modules() {
            self.load_module(module)?;
        }
        for name in self.config.modules.clone() {
            match optional_module(&name) {
                Some(module) => self.load_module(module)?,
                None => {
                    return Err(ModuleLoadError::new(name, "unknown module"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::testutil::test_ircd;

    /// Records the priority of each of its action handlers as they run.
    struct Recorder {
        log: Rc<RefCell<Vec<i32>>>,
    }

    impl Module for Recorder {
        fn name(&self) -> &'static str {
            "Recorder"
        }

        fn actions(&self) -> Vec<ActionDef> {
            [5, 10, 1, 10]
                .into_iter()
                .map(|priority| {
                    let log = Rc::clone(&self.log);
                    ActionDef {
                        action: "recordertest".to_string(),
                        priority,
                        func: Rc::new(move |_ircd, _args| {
                            log.borrow_mut().push(priority);
                            None
                        }),
                        scope: None,
                    }
                })
                .collect()
        }
    }

    #[test]
    fn handlers_run_in_stable_priority_order() {
        let mut ircd = test_ircd();
        let log = Rc::new(RefCell::new(Vec::new()));
        ircd.load_module(Rc::new(Recorder {
            log: Rc::clone(&log),
        }))
        .expect("recorder loads");

        let mut args = ActionArgs::Module {
            name: "x".to_string(),
        };
        ircd.run_action_standard("recordertest", &mut args, None);
        // Descending, equal priorities in registration order.
        assert_eq!(*log.borrow(), vec![10, 10, 5, 1]);
    }

    fn registry_snapshot(ircd: &Ircd) -> Vec<(String, Vec<(String, i32)>)> {
        let mut actions: Vec<(String, Vec<(String, i32)>)> = ircd
            .registry
            .actions
            .iter()
            .map(|(name, entries)| {
                (
                    name.clone(),
                    entries
                        .iter()
                        .map(|e| (e.module.clone(), e.priority))
                        .collect(),
                )
            })
            .collect();
        actions.sort();
        actions
    }

    #[test]
    fn unload_then_load_restores_registries() {
        let mut ircd = test_ircd();
        let module = optional_module("ConnectionLimit").expect("known module");
        ircd.load_module(Rc::clone(&module)).expect("loads");
        let snapshot = registry_snapshot(&ircd);

        ircd.unload_module("ConnectionLimit", false);
        assert_ne!(registry_snapshot(&ircd), snapshot);
        assert!(!ircd.registry.modules.contains_key("ConnectionLimit"));

        ircd.load_module(module).expect("loads again");
        assert_eq!(registry_snapshot(&ircd), snapshot);
    }

    struct CollidingMode;

    impl Module for CollidingMode {
        fn name(&self) -> &'static str {
            "CollidingMode"
        }

        fn channel_modes(&self) -> Vec<ChannelModeDef> {
            struct Noop;
            impl ModeHandler for Noop {}
            // 'b' is already taken by the ban mode.
            vec![ChannelModeDef {
                letter: 'b',
                category: ModeCategory::NoParam,
                handler: Rc::new(Noop),
                rank: None,
                symbol: None,
                affected_actions: Vec::new(),
            }]
        }

        fn actions(&self) -> Vec<ActionDef> {
            vec![ActionDef {
                action: "collidertest".to_string(),
                priority: 1,
                func: Rc::new(|_ircd, _args| None),
                scope: None,
            }]
        }
    }

    #[test]
    fn mode_letter_collision_fails_load_atomically() {
        let mut ircd = test_ircd();
        let err = ircd
            .load_module(Rc::new(CollidingMode))
            .expect_err("collision must fail");
        assert_eq!(err.name, "CollidingMode");
        // Nothing from the failed module may be registered.
        assert!(!ircd.registry.actions.contains_key("collidertest"));
        assert!(!ircd.registry.modules.contains_key("CollidingMode"));
    }

    struct CollidingSymbol;

    impl Module for CollidingSymbol {
        fn name(&self) -> &'static str {
            "CollidingSymbol"
        }

        fn channel_modes(&self) -> Vec<ChannelModeDef> {
            struct Noop;
            impl ModeHandler for Noop {}
            // Fresh letter, but '@' belongs to +o.
            vec![ChannelModeDef {
                letter: 'a',
                category: ModeCategory::Status,
                handler: Rc::new(Noop),
                rank: Some(150),
                symbol: Some('@'),
                affected_actions: Vec::new(),
            }]
        }
    }

    #[test]
    fn status_symbol_collision_fails_load() {
        let mut ircd = test_ircd();
        assert!(ircd.load_module(Rc::new(CollidingSymbol)).is_err());
        assert!(!ircd.registry.modes.channel_statuses.contains_key(&'a'));
    }

    #[test]
    fn status_requires_rank_and_symbol() {
        struct Bare;
        impl Module for Bare {
            fn name(&self) -> &'static str {
                "Bare"
            }
            fn channel_modes(&self) -> Vec<ChannelModeDef> {
                struct Noop;
                impl ModeHandler for Noop {}
                vec![ChannelModeDef {
                    letter: 'a',
                    category: ModeCategory::Status,
                    handler: Rc::new(Noop),
                    rank: None,
                    symbol: None,
                    affected_actions: Vec::new(),
                }]
            }
        }
        let mut ircd = test_ircd();
        assert!(ircd.load_module(Rc::new(Bare)).is_err());
    }

    #[test]
    fn unknown_configured_module_fails() {
        let mut ircd = test_ircd();
        ircd.config.modules = vec!["NoSuchModule".to_string()];
        assert!(ircd.load_configured_modules().is_err());
    }
}

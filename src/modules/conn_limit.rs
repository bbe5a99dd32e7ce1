//! Global per-IP connection cap.
//!
//! Counts registered users per IP across the whole network (local and
//! remote) and disconnects local connects that push an address over
//! `connlimit_globmax`. Whitelisted addresses are never counted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ConfigValidationError;
use crate::hooks::ActionArgs;
use crate::modules::{ActionDef, Module};
use crate::state::Ircd;

#[derive(Default)]
struct ConnLimitState {
    peer_connections: RefCell<HashMap<String, u32>>,
}

impl ConnLimitState {
    /// Returns false when the address is whitelisted (and uncounted).
    fn add(&self, ircd: &Ircd, ip: &str) -> bool {
        if ircd.config.connlimit_whitelist.iter().any(|w| w == ip) {
            return false;
        }
        *self
            .peer_connections
            .borrow_mut()
            .entry(ip.to_string())
            .or_insert(0) += 1;
        true
    }

    fn remove(&self, ip: &str) {
        let mut counts = self.peer_connections.borrow_mut();
        if let Some(count) = counts.get_mut(ip) {
            *count -= 1;
            if *count < 1 {
                counts.remove(ip);
            }
        }
    }

    fn count(&self, ip: &str) -> u32 {
        self.peer_connections.borrow().get(ip).copied().unwrap_or(0)
    }
}

pub struct ConnectionLimit {
    state: Rc<ConnLimitState>,
}

impl ConnectionLimit {
    pub fn new() -> ConnectionLimit {
        ConnectionLimit {
            state: Rc::new(ConnLimitState::default()),
        }
    }
}

impl Default for ConnectionLimit {
    fn default() -> Self {
        Self::new()
    }
}

fn user_ip(ircd: &Ircd, user: Uuid) -> Option<String> {
    ircd.users.get(&user).map(|u| u.ip.to_string())
}

impl Module for ConnectionLimit {
    fn name(&self) -> &'static str {
        "ConnectionLimit"
    }

    fn verify_config(&self, config: &Config) -> Result<(), ConfigValidationError> {
        for ip in &config.connlimit_whitelist {
            ip.parse::<IpAddr>().map_err(|_| {
                ConfigValidationError::new(
                    "connlimit_whitelist",
                    "every entry must be a valid ip",
                )
            })?;
        }
        Ok(())
    }

    fn on_load(&self, ircd: &mut Ircd) {
        for user in ircd.users.values() {
            if !user.local_only {
                self.state.add(ircd, &user.ip.to_string());
            }
        }
    }

    fn actions(&self) -> Vec<ActionDef> {
        let local = Rc::clone(&self.state);
        let remote = Rc::clone(&self.state);
        let gone_local = Rc::clone(&self.state);
        let gone_remote = Rc::clone(&self.state);
        let ip_change = Rc::clone(&self.state);
        vec![
            ActionDef {
                action: "userconnect".to_string(),
                priority: 100,
                func: Rc::new(move |ircd, args| {
                    let ActionArgs::User { user } = args else {
                        return None;
                    };
                    let user = *user;
                    let Some(ip) = user_ip(ircd, user) else {
                        return None;
                    };
                    if local.add(ircd, &ip)
                        && local.count(&ip) > ircd.config.connlimit_globmax
                    {
                        info!(%ip, "connection limit reached");
                        ircd.quit_user(
                            user,
                            &format!("No more connections allowed from your IP ({ip})"),
                            None,
                        );
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "remoteregister".to_string(),
                priority: 100,
                func: Rc::new(move |ircd, args| {
                    let ActionArgs::User { user } = args else {
                        return None;
                    };
                    if let Some(ip) = user_ip(ircd, *user) {
                        remote.add(ircd, &ip);
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "quit".to_string(),
                priority: 100,
                func: Rc::new(move |ircd, args| {
                    let ActionArgs::Quit { user, .. } = args else {
                        return None;
                    };
                    if let Some(ip) = user_ip(ircd, *user) {
                        gone_local.remove(&ip);
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "remotequit".to_string(),
                priority: 100,
                func: Rc::new(move |ircd, args| {
                    let ActionArgs::Quit { user, .. } = args else {
                        return None;
                    };
                    if let Some(ip) = user_ip(ircd, *user) {
                        gone_remote.remove(&ip);
                    }
                    None
                }),
                scope: None,
            },
            ActionDef {
                action: "changeipaddress".to_string(),
                priority: 100,
                func: Rc::new(move |ircd, args| {
                    let ActionArgs::IpChange { user, old_ip } = args else {
                        return None;
                    };
                    // Decrement the old address, count the new one.
                    let old_ip = old_ip.to_string();
                    let user = *user;
                    ip_change.remove(&old_ip);
                    if let Some(ip) = user_ip(ircd, user) {
                        ip_change.add(ircd, &ip);
                    }
                    None
                }),
                scope: None,
            },
        ]
    }
}

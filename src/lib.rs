//! modircd, a modular IRC daemon core.
//!
//! Commands, modes and behavioral hooks are contributed by modules through
//! prioritized registries; the entity graph lives on a single cooperative
//! task and is mutated without locks. [`run`] drives the whole daemon and
//! is used by both the binary and the integration tests.

pub mod chanlog;
pub mod commands;
pub mod config;
mod dispatch;
pub mod error;
pub mod hooks;
pub mod modes;
pub mod modules;
pub mod network;
mod router;
pub mod state;
pub mod storage;

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::info;

use crate::config::Config;
use crate::network::connection::Event;
use crate::state::Ircd;
use crate::storage::Storage;

/// Run the daemon until shutdown.
///
/// With `shutdown` set, that channel is the only stop signal (used by
/// tests); otherwise SIGINT/SIGTERM stop the daemon and SIGHUP rehashes.
pub async fn run(
    config: Config,
    config_path: String,
    shutdown: Option<oneshot::Receiver<()>>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let storage = Storage::open(Path::new(&config.storage_path));
    let mut ircd = Ircd::new(config, config_path, storage, tx.clone());
    ircd.load_configured_modules()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let wanted = ircd.config.bind_client.len() + ircd.config.bind_server.len();
    let bound = network::bind_all(&ircd.config, &tx).await;
    if wanted > 0 && bound.is_empty() {
        anyhow::bail!("no ports could be bound");
    }
    for (key, handle) in bound {
        ircd.bound_ports.insert(key, handle);
    }

    {
        let tick_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tick_tx.send(Event::Tick).is_err() {
                    return;
                }
            }
        });
    }

    match shutdown {
        Some(shutdown) => {
            let shutdown_tx = tx.clone();
            tokio::spawn(async move {
                let _ = shutdown.await;
                let _ = shutdown_tx.send(Event::Shutdown);
            });
        }
        None => {
            #[cfg(unix)]
            {
                let signal_tx = tx.clone();
                tokio::spawn(async move {
                    use tokio::signal::unix::{signal, SignalKind};
                    let mut sigint =
                        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
                    let mut sigterm =
                        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                    let mut sighup =
                        signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
                    loop {
                        tokio::select! {
                            _ = sigint.recv() => {
                                let _ = signal_tx.send(Event::Shutdown);
                            }
                            _ = sigterm.recv() => {
                                let _ = signal_tx.send(Event::Shutdown);
                            }
                            _ = sighup.recv() => {
                                let _ = signal_tx.send(Event::Rehash);
                            }
                        }
                    }
                });
            }
        }
    }

    info!(server = %ircd.server_name(), version = ircd.version, "modircd started");
    while let Some(event) = rx.recv().await {
        ircd.handle_event(event).await;
        if ircd.shutting_down && ircd.connections.is_empty() {
            break;
        }
    }
    // Give the write tasks a moment to flush closing lines.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("modircd stopped");
    Ok(())
}

#[cfg(test)]
pub mod testutil {
    //! Shared fixtures for unit tests: a daemon with the core modules
    //! loaded and no sockets.

    use std::collections::HashMap;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::config::Config;
    use crate::state::{now_ts, Ircd, User};
    use crate::storage::Storage;

    pub fn test_config() -> Config {
        toml::from_str(
            r#"
            name = "test.example.com"
            server_id = "001"
            "#,
        )
        .expect("static config parses")
    }

    pub fn test_ircd() -> Ircd {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut ircd = Ircd::new(test_config(), String::new(), Storage::ephemeral(), tx);
        ircd.load_configured_modules().expect("core modules load");
        ircd
    }

    pub fn add_user(ircd: &mut Ircd, nick: &str) -> Uuid {
        add_user_with_host(ircd, nick, "10.0.0.1")
    }

    pub fn add_user_with_host(ircd: &mut Ircd, nick: &str, host: &str) -> Uuid {
        let uuid = Uuid::new_v4();
        let now = now_ts();
        let user = User {
            uuid,
            nick: nick.to_string(),
            ident: nick.to_string(),
            gecos: nick.to_string(),
            ip: host.parse().unwrap_or_else(|_| "10.0.0.1".parse().expect("literal")),
            host: host.to_string(),
            real_host: host.to_string(),
            channels: Vec::new(),
            modes: HashMap::new(),
            metadata: HashMap::new(),
            cache: HashMap::new(),
            idle_since: now,
            signon_at: now,
            local_only: false,
            server: ircd.server_id().to_string(),
            conn: None,
        };
        ircd.users.insert(uuid, user);
        ircd.user_nicks.insert(nick, uuid);
        uuid
    }
}

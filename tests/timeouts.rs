//! Liveness: ping timeouts and the connection limit module.

mod common;

use std::time::Duration;

use common::{TestClient, TestServer};

#[tokio::test]
async fn silent_client_is_ping_timed_out() {
    let server = TestServer::spawn_with(
        16831,
        r#"
        ping_interval = 1
        timeout_delay = 2
        "#,
    )
    .await;
    let mut watcher = TestClient::connect(server.port).await;
    let mut silent = TestClient::connect(server.port).await;
    watcher.register("watcher").await;
    silent.register("silent").await;
    watcher.join("#c").await;
    silent.join("#c").await;

    // `silent` never answers pings; the watcher (whose PINGs are answered
    // by the harness) sees the QUIT broadcast on the shared channel.
    let quit = watcher
        .expect("quit broadcast", |line| {
            line.starts_with(":silent!") && line.contains("QUIT")
        })
        .await;
    assert!(quit.contains("Ping timeout"));
}

#[tokio::test]
async fn unregistered_connection_times_out() {
    let server = TestServer::spawn_with(
        16832,
        r#"
        ping_interval = 1
        timeout_delay = 2
        "#,
    )
    .await;
    let mut idle = TestClient::connect(server.port).await;
    // Never registers, never answers; the server closes the socket.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connection was not closed"
        );
        match idle.recv().await {
            Some(line) if line.contains("ERROR") => break,
            Some(_) => continue,
            None => break,
        }
    }
}

#[tokio::test]
async fn connection_limit_module_caps_per_ip_users() {
    let server = TestServer::spawn_with(
        16833,
        r#"
        modules = ["ConnectionLimit"]
        connlimit_globmax = 1
        "#,
    )
    .await;
    let mut first = TestClient::connect(server.port).await;
    first.register("first").await;

    let mut second = TestClient::connect(server.port).await;
    second.send("NICK second").await;
    second.send("USER second 0 * :second").await;
    // The limiter disconnects during registration.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut closed = false;
    while tokio::time::Instant::now() < deadline {
        match second.recv().await {
            Some(line) if line.contains("ERROR") => {
                assert!(line.contains("No more connections allowed"));
                closed = true;
                break;
            }
            Some(_) => continue,
            None => {
                closed = true;
                break;
            }
        }
    }
    assert!(closed, "second connection should have been refused");
}

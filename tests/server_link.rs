//! Server-to-server linking: handshake, state burst, and relay of
//! remote users into local channels.

mod common;

use common::{TestClient, TestServer};

const REMOTE_UID: &str = "11111111-2222-3333-4444-555555555555";

#[tokio::test]
async fn inbound_link_bursts_and_relays() {
    let server = TestServer::spawn_with(
        16841,
        r#"
        bind_server = ["tcp:16842"]

        [[links]]
        name = "hub.example.com"
        password = "linkpass"
        "#,
    )
    .await;
    let mut alice = TestClient::connect(server.port).await;
    alice.register("alice").await;
    alice.join("#shared").await;

    // A peer server authenticates on the server port.
    let mut peer = TestClient::connect(16842).await;
    peer.send("PASS linkpass").await;
    peer.send("SERVER hub.example.com 00H").await;
    peer.expect("our SERVER line", |line| line.starts_with("SERVER "))
        .await;

    // The burst carries the existing user and their membership.
    peer.expect("uid burst", |line| {
        line.contains("UID") && line.contains("alice")
    })
    .await;
    peer.expect("join burst", |line| line.contains("JOIN #shared"))
        .await;

    // Introduce a remote user and walk it into the channel.
    peer.send(&format!(
        ":00H UID {REMOTE_UID} remoteuser ruser hub.host 10.9.8.7 :Remote User"
    ))
    .await;
    peer.send(&format!(":{REMOTE_UID} JOIN #shared")).await;
    let seen = alice
        .expect("remote join", |line| {
            line.contains("JOIN") && line.contains("remoteuser")
        })
        .await;
    assert!(seen.starts_with(":remoteuser!ruser@"));

    // Messages from the far side reach local members.
    peer.send(&format!(":{REMOTE_UID} PRIVMSG #shared :hello from afar"))
        .await;
    let relayed = alice
        .expect("relayed privmsg", |line| line.contains("PRIVMSG #shared"))
        .await;
    assert!(relayed.starts_with(":remoteuser!"));
    assert!(relayed.ends_with(":hello from afar"));

    // And its QUIT is announced like any other.
    peer.send(&format!(":{REMOTE_UID} QUIT :hub going down")).await;
    alice
        .expect("remote quit", |line| {
            line.starts_with(":remoteuser!") && line.contains("QUIT")
        })
        .await;
}

#[tokio::test]
async fn bad_link_credentials_close_the_socket() {
    let _server = TestServer::spawn_with(
        16843,
        r#"
        bind_server = ["tcp:16844"]

        [[links]]
        name = "hub.example.com"
        password = "linkpass"
        "#,
    )
    .await;
    let mut intruder = TestClient::connect(16844).await;
    intruder.send("PASS wrongpass").await;
    intruder.send("SERVER hub.example.com 00H").await;
    loop {
        match intruder.recv().await {
            Some(line) if line.contains("ERROR") => {
                assert!(line.contains("Access denied"));
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
}

//! Channel flows: join, messaging, topic, kick permissions.

mod common;

use common::{TestClient, TestServer};

#[tokio::test]
async fn join_and_privmsg_flow() {
    let server = TestServer::spawn(16811).await;
    let mut alice = TestClient::connect(server.port).await;
    let mut bob = TestClient::connect(server.port).await;
    alice.register("alice").await;
    bob.register("bob").await;

    alice.join("#test").await;
    bob.join("#test").await;
    // Alice sees bob arriving.
    alice
        .expect("bob's join", |line| {
            line.starts_with(":bob!") && line.contains("JOIN")
        })
        .await;

    alice.send("PRIVMSG #test :hello from alice").await;
    let seen = bob
        .expect("privmsg delivery", |line| line.contains("PRIVMSG #test"))
        .await;
    assert!(seen.starts_with(":alice!"));
    assert!(seen.ends_with(":hello from alice"));
}

#[tokio::test]
async fn part_is_announced_and_membership_dropped() {
    let server = TestServer::spawn(16812).await;
    let mut alice = TestClient::connect(server.port).await;
    let mut bob = TestClient::connect(server.port).await;
    alice.register("alice").await;
    bob.register("bob").await;
    alice.join("#test").await;
    bob.join("#test").await;

    bob.send("PART #test :gotta go").await;
    let seen = alice
        .expect("part announcement", |line| line.contains("PART"))
        .await;
    assert!(seen.starts_with(":bob!"));
    assert!(seen.ends_with(":gotta go"));

    // Bob is no longer a member: messaging from outside still works
    // (no ban set), but his PART was the last we saw of him in NAMES.
    alice.send("NAMES #test").await;
    let names = alice
        .expect("names reply", |line| line.contains(" 353 "))
        .await;
    assert!(!names.contains("bob"));
}

#[tokio::test]
async fn topic_set_and_query() {
    let server = TestServer::spawn(16813).await;
    let mut alice = TestClient::connect(server.port).await;
    let mut bob = TestClient::connect(server.port).await;
    alice.register("alice").await;
    bob.register("bob").await;
    alice.join("#test").await;
    bob.join("#test").await;

    alice.send("TOPIC #test :all about testing").await;
    bob.expect("topic announcement", |line| {
        line.contains("TOPIC #test") && line.ends_with(":all about testing")
    })
    .await;

    bob.send("TOPIC #test").await;
    bob.expect("332 reply", |line| line.contains(" 332 ")).await;
    bob.expect("333 reply", |line| line.contains(" 333 ")).await;
}

#[tokio::test]
async fn kick_requires_sufficient_rank() {
    let server = TestServer::spawn(16814).await;
    let mut op = TestClient::connect(server.port).await;
    let mut voice = TestClient::connect(server.port).await;
    op.register("op").await;
    voice.register("voice").await;

    // op creates the channel (becoming operator), voice joins and gets +v.
    op.join("#c").await;
    voice.join("#c").await;
    op.send("MODE #c +v voice").await;
    voice
        .expect("voice grant", |line| line.contains("MODE #c +v"))
        .await;

    // A voiced user outranked by the operator may not kick them.
    voice.send("KICK #c op :revolt").await;
    let denied = voice
        .expect("482 reply", |line| line.contains(" 482 "))
        .await;
    assert!(denied.contains("#c"));

    // The operator kicks the voiced user; everyone sees it.
    op.send("KICK #c voice :settled").await;
    let seen = voice
        .expect("kick announcement", |line| line.contains("KICK #c"))
        .await;
    assert!(seen.starts_with(":op!"));
    assert!(seen.contains("voice"));
    assert!(seen.ends_with(":settled"));
}

#[tokio::test]
async fn mode_query_reports_channel_modes() {
    let server = TestServer::spawn(16815).await;
    let mut alice = TestClient::connect(server.port).await;
    alice.register("alice").await;
    alice.join("#test").await;

    alice.send("MODE #test").await;
    alice.expect("324 reply", |line| line.contains(" 324 ")).await;
    alice.expect("329 reply", |line| line.contains(" 329 ")).await;
}

#[tokio::test]
async fn unknown_command_answers_421() {
    let server = TestServer::spawn(16816).await;
    let mut alice = TestClient::connect(server.port).await;
    alice.register("alice").await;
    alice.send("FLIBBERWOCK now").await;
    let reply = alice.expect("421 reply", |line| line.contains(" 421 ")).await;
    assert!(reply.contains("FLIBBERWOCK"));
}

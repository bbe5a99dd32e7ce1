//! Registration flows: the welcome burst, nick collisions, the
//! unregistered allow-list.

mod common;

use common::{TestClient, TestServer};

#[tokio::test]
async fn registration_sends_welcome_burst() {
    let server = TestServer::spawn(16801).await;
    let mut alice = TestClient::connect(server.port).await;

    let burst = alice.register("alice").await;
    for numeric in ["001", "002", "003", "004", "005"] {
        assert!(
            burst.iter().any(|line| line.contains(&format!(" {numeric} "))),
            "missing {numeric} in {burst:?}"
        );
    }
    let welcome = burst
        .iter()
        .find(|line| line.contains(" 001 "))
        .expect("001 present");
    assert!(welcome.contains("alice"), "welcome names the user: {welcome}");
    assert!(welcome.contains("alice!alice@"), "welcome carries the hostmask");
}

#[tokio::test]
async fn nick_collision_answers_433() {
    let server = TestServer::spawn(16802).await;
    let mut alice = TestClient::connect(server.port).await;
    alice.register("alice").await;

    let mut intruder = TestClient::connect(server.port).await;
    intruder.send("NICK alice").await;
    let reply = intruder
        .expect("433 reply", |line| line.contains(" 433 "))
        .await;
    assert!(reply.contains("alice"));
    assert!(reply.contains("Nickname is already in use"));
}

#[tokio::test]
async fn commands_before_registration_answer_451() {
    let server = TestServer::spawn(16803).await;
    let mut client = TestClient::connect(server.port).await;
    client.send("JOIN #nope").await;
    let reply = client.expect("451 reply", |line| line.contains(" 451 ")).await;
    assert!(reply.contains("You have not registered"));
}

#[tokio::test]
async fn erroneous_nick_answers_432() {
    let server = TestServer::spawn(16804).await;
    let mut client = TestClient::connect(server.port).await;
    client.send("NICK 1badnick").await;
    client.expect("432 reply", |line| line.contains(" 432 ")).await;
}

#[tokio::test]
async fn unregistered_ping_gets_pong() {
    let server = TestServer::spawn(16805).await;
    let mut client = TestClient::connect(server.port).await;
    client.send("PING token123").await;
    let reply = client
        .expect("PONG reply", |line| line.contains("PONG"))
        .await;
    assert!(reply.contains("token123"));
}

#[tokio::test]
async fn nick_change_is_announced() {
    let server = TestServer::spawn(16806).await;
    let mut alice = TestClient::connect(server.port).await;
    let mut bob = TestClient::connect(server.port).await;
    alice.register("alice").await;
    bob.register("bob").await;
    alice.join("#chat").await;
    bob.join("#chat").await;

    alice.send("NICK alicia").await;
    let seen = bob
        .expect("NICK announcement", |line| line.contains("NICK"))
        .await;
    assert!(seen.starts_with(":alice!"), "old hostmask as prefix: {seen}");
    assert!(seen.contains("alicia"));
}

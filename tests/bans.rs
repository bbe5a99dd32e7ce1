//! Ban behavior on the wire: join denial, auto-status extbans, the ban
//! list display, and message stripping for banned outsiders.

mod common;

use common::{TestClient, TestServer};

#[tokio::test]
async fn banned_user_cannot_join() {
    let server = TestServer::spawn(16821).await;
    let mut op = TestClient::connect(server.port).await;
    let mut alice = TestClient::connect(server.port).await;
    let mut bob = TestClient::connect(server.port).await;
    op.register("op").await;
    alice.register("alice").await;
    bob.register("bob").await;

    op.join("#c").await;
    op.send("MODE #c +b alice!*@*").await;
    op.expect("ban confirmation", |line| line.contains("MODE #c +b"))
        .await;

    alice.send("JOIN #c").await;
    let denied = alice
        .expect("474 reply", |line| line.contains(" 474 "))
        .await;
    assert!(denied.contains("#c"));
    assert!(denied.contains("Cannot join channel"));

    // Someone else is unaffected.
    bob.join("#c").await;
}

#[tokio::test]
async fn ban_list_query_shows_entries() {
    let server = TestServer::spawn(16822).await;
    let mut op = TestClient::connect(server.port).await;
    op.register("op").await;
    op.join("#c").await;
    op.send("MODE #c +b spammer").await;
    op.expect("ban confirmation", |line| line.contains("+b")).await;

    op.send("MODE #c b").await;
    // The bare mask was completed to a full hostmask.
    let entry = op.expect("367 reply", |line| line.contains(" 367 ")).await;
    assert!(entry.contains("spammer!*@*"));
    op.expect("368 reply", |line| line.contains(" 368 ")).await;
}

#[tokio::test]
async fn action_extban_grants_voice_on_join() {
    let server = TestServer::spawn(16823).await;
    let mut op = TestClient::connect(server.port).await;
    let mut carol = TestClient::connect(server.port).await;
    op.register("op").await;
    carol.register("carol").await;

    op.join("#c").await;
    // Every 127.0.0.1 client matches; the entry voices instead of banning.
    op.send("MODE #c +b v;*!*@127.0.0.1").await;
    op.expect("ban confirmation", |line| line.contains("+b")).await;

    carol.send("JOIN #c").await;
    carol
        .expect("own join", |line| line.starts_with(":carol!") && line.contains("JOIN"))
        .await;
    // The channel itself hands out +v.
    let grant = op
        .expect("auto-voice", |line| line.contains("MODE #c +v carol"))
        .await;
    assert!(grant.starts_with(":#c "), "channel as source: {grant}");
}

#[tokio::test]
async fn banned_outsider_cannot_message_channel() {
    let server = TestServer::spawn(16824).await;
    let mut op = TestClient::connect(server.port).await;
    let mut alice = TestClient::connect(server.port).await;
    op.register("op").await;
    alice.register("alice").await;

    op.join("#c").await;
    op.send("MODE #c +b alice!*@*").await;
    op.expect("ban confirmation", |line| line.contains("+b")).await;

    alice.send("PRIVMSG #c :let me in").await;
    let denied = alice
        .expect("474 reply", |line| line.contains(" 474 "))
        .await;
    assert!(denied.contains("Cannot send message to channel"));
}

#[tokio::test]
async fn unset_ban_is_case_insensitive_on_the_wire() {
    let server = TestServer::spawn(16825).await;
    let mut op = TestClient::connect(server.port).await;
    op.register("op").await;
    op.join("#c").await;

    op.send("MODE #c +b AAA!*@*").await;
    op.expect("set confirmation", |line| line.contains("+b AAA!*@*"))
        .await;
    op.send("MODE #c -b aaa!*@*").await;
    let removed = op
        .expect("unset confirmation", |line| line.contains("-b"))
        .await;
    assert!(removed.contains("AAA!*@*"), "stored casing echoes: {removed}");

    op.send("MODE #c b").await;
    op.expect("368 with empty list", |line| line.contains(" 368 ")).await;
}

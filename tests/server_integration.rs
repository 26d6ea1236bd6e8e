use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley::client::{Client, ClientError};
use parley::config::ServerConfig;
use parley::events::Event;
use parley::gid::Gid;
use parley::network::{Frame, FrameKind};
use parley::requests::{Access, Registry, Reply};
use parley::server::{handle_new_connection, ServerState, CONNECT_ERROR_TAG, FRAMING_ERROR_TAG};
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::{json, Value};

const PASSWORD: &str = "hunter2hunter2";
const EVENT_WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &std::path::Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.data_dir = dir.display().to_string();
    config.bcrypt_cost = 4;
    config.checkpoint_secs = 0;
    config
}

async fn start_test_server() -> TestServer {
    start_configured(|_| {}, Registry::standard()).await
}

async fn start_configured(tweak: impl FnOnce(&mut ServerConfig), registry: Registry) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let state = Arc::new(ServerState::with_registry(config, registry).await.unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_state = Arc::clone(&state);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = listener.accept().await.unwrap();
            let s = Arc::clone(&accept_state);
            tokio::spawn(async move {
                handle_new_connection(s, stream, peer).await;
            });
        }
    });

    TestServer { addr, state, _dir: dir }
}

fn gid(v: &Value) -> Gid {
    serde_json::from_value(v.clone()).unwrap()
}

#[derive(Debug, Deserialize)]
struct Registered {
    user_id: Gid,
    username: String,
    discriminator: u16,
}

/// Registers `name` and returns (user id, discriminator).
async fn register(client: &Client, name: &str) -> (Gid, u16) {
    let reply: Registered = client
        .call_as("auth.register", &json!({ "username": name, "password": PASSWORD }))
        .await
        .unwrap();
    assert_eq!(reply.username, name);
    (reply.user_id, reply.discriminator)
}

async fn login(client: &Client, name: &str, discriminator: u16) -> Value {
    client
        .call("auth.login", &json!({ "username": name, "discriminator": discriminator, "password": PASSWORD }))
        .await
        .unwrap()
}

/// A fresh connection logged in as a fresh user.
async fn signed_in(addr: SocketAddr, name: &str) -> (Client, Gid, String) {
    let client = Client::connect(addr).await.unwrap();
    let (id, discriminator) = register(&client, name).await;
    let reply = login(&client, name, discriminator).await;
    (client, id, reply["token"].as_str().unwrap().to_string())
}

async fn direct_thread(client: &Client, other: Gid) -> Gid {
    let thread = client.call("thread.create", &json!({ "participants": [other], "title": "dm" })).await.unwrap();
    gid(&thread["id"])
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn remote_code(err: &ClientError) -> (&str, bool) {
    let body = err.remote().expect("expected a remote error");
    (body.code.as_str(), body.retryable)
}

#[tokio::test]
async fn test_ping_anonymous() {
    let server = start_test_server().await;
    let client = Client::connect(server.addr).await.unwrap();
    let reply = client.call("ping", &json!({})).await.unwrap();
    assert!(reply["pong"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_unsupported_tag_keeps_connection_usable() {
    let server = start_test_server().await;
    let client = Client::connect(server.addr).await.unwrap();

    let err = client.call("no.such.tag", &json!({})).await.unwrap_err();
    assert_eq!(remote_code(&err), ("unsupported", false));

    assert!(client.call("ping", &json!({})).await.is_ok());
}

#[tokio::test]
async fn test_each_request_dispatched_exactly_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::standard();
    let seen = Arc::clone(&counter);
    registry.register("test.count", Access::Anonymous, move |_ctx, _body: IgnoredAny| {
        let seen = Arc::clone(&seen);
        async move {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            Reply::json(&json!({ "n": n }))
        }
    });
    let server = start_configured(|_| {}, registry).await;
    let client = Client::connect(server.addr).await.unwrap();

    for i in 1..=25u64 {
        let reply = client.call("test.count", &json!(null)).await.unwrap();
        assert_eq!(reply["n"].as_u64(), Some(i));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 25);
}

#[tokio::test]
async fn test_user_routes_require_login() {
    let server = start_test_server().await;
    let client = Client::connect(server.addr).await.unwrap();
    let err = client.call("friend.list", &json!({})).await.unwrap_err();
    assert_eq!(remote_code(&err), ("unauthenticated", false));
}

#[tokio::test]
async fn test_malformed_body_is_reported() {
    let server = start_test_server().await;
    let client = Client::connect(server.addr).await.unwrap();
    let err = client.call("auth.register", &json!({ "username": 5 })).await.unwrap_err();
    assert_eq!(remote_code(&err), ("malformed", false));
    assert!(client.call("ping", &json!({})).await.is_ok());
}

#[tokio::test]
async fn test_password_and_token_login() {
    let server = start_test_server().await;
    let (_first, id, token) = signed_in(server.addr, "ann").await;

    let second = Client::connect(server.addr).await.unwrap();
    let reply = second.call("auth.token", &json!({ "token": token })).await.unwrap();
    assert_eq!(gid(&reply["user_id"]), id);
    assert!(second.call("friend.list", &json!({})).await.is_ok());
    assert_eq!(server.state.hub.sessions_of(id), 2);
}

#[tokio::test]
async fn test_login_failures_carry_retry_hint() {
    let server = start_test_server().await;
    let client = Client::connect(server.addr).await.unwrap();
    let (id, discriminator) = register(&client, "bob").await;

    let err = client
        .call("auth.login", &json!({ "username": "bob", "discriminator": discriminator, "password": "wrong-password" }))
        .await
        .unwrap_err();
    assert_eq!(remote_code(&err), ("invalid_credentials", true));

    let unknown = format!("{}.{}", id, "a".repeat(64));
    let err = client.call("auth.token", &json!({ "token": unknown })).await.unwrap_err();
    assert_eq!(remote_code(&err), ("invalid_credentials", false));

    let err = client.call("auth.token", &json!({ "token": "not-a-token" })).await.unwrap_err();
    assert_eq!(remote_code(&err), ("malformed", false));
}

#[tokio::test]
async fn test_repeated_failures_lock_account() {
    let server = start_configured(|c| c.max_failed_logins = 2, Registry::standard()).await;
    let client = Client::connect(server.addr).await.unwrap();
    let (_, discriminator) = register(&client, "cat").await;

    for _ in 0..2 {
        let bad = json!({ "username": "cat", "discriminator": discriminator, "password": "nope-nope-nope" });
        client.call("auth.login", &bad).await.unwrap_err();
    }
    let good = json!({ "username": "cat", "discriminator": discriminator, "password": PASSWORD });
    let err = client.call("auth.login", &good).await.unwrap_err();
    assert_eq!(remote_code(&err), ("account_locked", false));
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let server = start_test_server().await;
    let (client, _, token) = signed_in(server.addr, "dan").await;

    let reply = client.call("auth.logout", &json!({})).await.unwrap();
    assert_eq!(reply["revoked"], json!(true));
    let err = client.call("friend.list", &json!({})).await.unwrap_err();
    assert_eq!(remote_code(&err), ("unauthenticated", false));

    let other = Client::connect(server.addr).await.unwrap();
    let err = other.call("auth.token", &json!({ "token": token })).await.unwrap_err();
    assert_eq!(remote_code(&err), ("invalid_credentials", false));
}

#[tokio::test]
async fn test_revoke_only_own_tokens() {
    let server = start_test_server().await;
    let (ann, _, ann_token) = signed_in(server.addr, "ann").await;
    let (bob, _, _) = signed_in(server.addr, "bob").await;
    let ann_token_id = ann_token.split('.').next().unwrap().to_string();

    let err = bob.call("auth.revoke", &json!({ "token_id": ann_token_id })).await.unwrap_err();
    assert_eq!(remote_code(&err), ("not_found", false));

    let reply = ann.call("auth.revoke", &json!({ "token_id": ann_token_id })).await.unwrap();
    assert_eq!(reply["revoked"], json!(true));
}

#[tokio::test]
async fn test_fan_out_to_every_connection_of_a_user() {
    let server = start_test_server().await;
    let (a1, a, a_token) = signed_in(server.addr, "ann").await;
    let a2 = Client::connect(server.addr).await.unwrap();
    a2.call("auth.token", &json!({ "token": a_token })).await.unwrap();
    let (b, b_id, _) = signed_in(server.addr, "bob").await;

    let thread = direct_thread(&a1, b_id).await;
    b.call("message.send", &json!({ "thread_id": thread, "body": "hello" })).await.unwrap();

    for conn in [&a1, &a2] {
        match conn.next_event(EVENT_WAIT).await.unwrap().event {
            Event::MessageCreated { message } => assert_eq!(message.body, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    // once one connection is gone only the other hears about new messages
    a2.close().await.unwrap();
    drop(a2);
    wait_until(|| server.state.hub.sessions_of(a) == 1).await;

    b.call("message.send", &json!({ "thread_id": thread, "body": "again" })).await.unwrap();
    match a1.next_event(EVENT_WAIT).await.unwrap().event {
        Event::MessageCreated { message } => assert_eq!(message.body, "again"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_friend_request_accept_remove() {
    let server = start_test_server().await;
    let (ann, a, _) = signed_in(server.addr, "ann").await;
    let (bob, b, _) = signed_in(server.addr, "bob").await;

    let reply = ann.call("friend.request", &json!({ "user_id": b })).await.unwrap();
    assert_eq!(reply["status"], "pending");
    match bob.next_event(EVENT_WAIT).await.unwrap().event {
        Event::FriendRequested { from } => assert_eq!(from.id, a),
        other => panic!("unexpected event {:?}", other),
    }

    let err = ann.call("friend.request", &json!({ "user_id": b })).await.unwrap_err();
    assert_eq!(remote_code(&err).0, "conflict");

    bob.call("friend.accept", &json!({ "user_id": a })).await.unwrap();
    match ann.next_event(EVENT_WAIT).await.unwrap().event {
        Event::FriendAdded { user } => assert_eq!(user.id, b),
        other => panic!("unexpected event {:?}", other),
    }
    let list = ann.call("friend.list", &json!({})).await.unwrap();
    assert_eq!(list["friends"].as_array().unwrap().len(), 1);
    assert!(list["outgoing"].as_array().unwrap().is_empty());

    ann.call("friend.remove", &json!({ "user_id": b })).await.unwrap();
    // bob already saw friend.added for ann; next is the removal
    let mut saw_removal = false;
    while let Ok(env) = bob.next_event(EVENT_WAIT).await {
        if let Event::FriendRemoved { user_id } = env.event {
            assert_eq!(user_id, a);
            saw_removal = true;
            break;
        }
    }
    assert!(saw_removal);
    assert!(server.state.world.users.get(&b).unwrap().friends.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossed_friend_requests_become_friends() {
    let server = start_test_server().await;
    for pair in 0..10 {
        let (ann, a, _) = signed_in(server.addr, &format!("ann{}", pair)).await;
        let (bob, b, _) = signed_in(server.addr, &format!("bob{}", pair)).await;

        let req_b = json!({ "user_id": b });
        let req_a = json!({ "user_id": a });
        let (from_ann, from_bob) = tokio::join!(
            ann.call("friend.request", &req_b),
            bob.call("friend.request", &req_a),
        );
        assert!(from_ann.is_ok() && from_bob.is_ok());

        for (me, other) in [(a, b), (b, a)] {
            let user = server.state.world.users.get(&me).unwrap().clone();
            assert!(user.friends.contains(&other), "pair {} not friends", pair);
            assert!(user.incoming.is_empty() && user.outgoing.is_empty(), "pair {} left pending", pair);
        }
    }
}

#[tokio::test]
async fn test_profile_update_reaches_friends() {
    let server = start_test_server().await;
    let (ann, a, _) = signed_in(server.addr, "ann").await;
    let (bob, b, _) = signed_in(server.addr, "bob").await;
    // mutual requests become a friendship
    ann.call("friend.request", &json!({ "user_id": b })).await.unwrap();
    let reply = bob.call("friend.request", &json!({ "user_id": a })).await.unwrap();
    assert_eq!(reply["status"], "friends");

    ann.call("user.update", &json!({ "status": "out to lunch" })).await.unwrap();
    let mut got = None;
    while let Ok(env) = bob.next_event(EVENT_WAIT).await {
        if let Event::ProfileUpdated { user } = env.event {
            got = Some(user);
            break;
        }
    }
    assert_eq!(got.unwrap().status, "out to lunch");

    let profile = bob.call("user.get", &json!({ "user_id": a })).await.unwrap();
    assert_eq!(profile["status"], "out to lunch");
}

#[tokio::test]
async fn test_message_history_edit_delete() {
    let server = start_test_server().await;
    let (ann, _, _) = signed_in(server.addr, "ann").await;
    let (bob, b, _) = signed_in(server.addr, "bob").await;
    let thread = direct_thread(&ann, b).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let m = ann.call("message.send", &json!({ "thread_id": thread, "body": format!("m{}", i) })).await.unwrap();
        ids.push(m["id"].clone());
    }

    let page = bob.call("message.history", &json!({ "thread_id": thread, "limit": 2 })).await.unwrap();
    let bodies: Vec<&str> = page["messages"].as_array().unwrap().iter().map(|m| m["body"].as_str().unwrap()).collect();
    assert_eq!(bodies, vec!["m2", "m1"]);

    let err = bob.call("message.edit", &json!({ "message_id": ids[0], "body": "hijack" })).await.unwrap_err();
    assert_eq!(remote_code(&err).0, "forbidden");

    let edited = ann.call("message.edit", &json!({ "message_id": ids[2], "body": "m2!" })).await.unwrap();
    assert!(edited["edited_at"].is_u64());
    ann.call("message.delete", &json!({ "message_id": ids[1] })).await.unwrap();

    let page = bob.call("message.history", &json!({ "thread_id": thread })).await.unwrap();
    let bodies: Vec<&str> = page["messages"].as_array().unwrap().iter().map(|m| m["body"].as_str().unwrap()).collect();
    assert_eq!(bodies, vec!["m2!", "m0"]);

    // outsiders cannot read the thread
    let (eve, _, _) = signed_in(server.addr, "eve").await;
    let err = eve.call("message.history", &json!({ "thread_id": thread })).await.unwrap_err();
    assert_eq!(remote_code(&err).0, "forbidden");
}

#[tokio::test]
async fn test_community_membership_events() {
    let server = start_test_server().await;
    let (ann, _, _) = signed_in(server.addr, "ann").await;
    let (bob, b, _) = signed_in(server.addr, "bob").await;

    let community = ann.call("community.create", &json!({ "name": "rust" })).await.unwrap();
    let cid = community["id"].clone();
    bob.call("community.join", &json!({ "community_id": cid })).await.unwrap();

    match ann.next_event(EVENT_WAIT).await.unwrap().event {
        Event::MemberJoined { user, .. } => assert_eq!(user.id, b),
        other => panic!("unexpected event {:?}", other),
    }

    let thread = ann.call("thread.create", &json!({ "community_id": cid, "title": "general" })).await.unwrap();
    bob.call("message.send", &json!({ "thread_id": thread["id"], "body": "hi all" })).await.unwrap();
    match ann.next_event(EVENT_WAIT).await.unwrap().event {
        Event::MessageCreated { message } => assert_eq!(message.body, "hi all"),
        other => panic!("unexpected event {:?}", other),
    }

    let err = ann.call("community.leave", &json!({ "community_id": cid })).await.unwrap_err();
    assert_eq!(remote_code(&err).0, "forbidden");
    bob.call("community.leave", &json!({ "community_id": cid })).await.unwrap();
    let fetched = ann.call("community.get", &json!({ "community_id": cid })).await.unwrap();
    assert_eq!(fetched["members"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_thread_write_leaves_community_clean() {
    let server = start_test_server().await;
    let (ann, _, _) = signed_in(server.addr, "ann").await;
    let community = ann.call("community.create", &json!({ "name": "rust" })).await.unwrap();
    let cid = community["id"].clone();

    // a plain file where the threads namespace belongs
    std::fs::write(server._dir.path().join("threads"), b"in the way").unwrap();
    let err = ann.call("thread.create", &json!({ "community_id": cid, "title": "general" })).await.unwrap_err();
    assert_eq!(remote_code(&err), ("internal", true));

    let fetched = ann.call("community.get", &json!({ "community_id": cid })).await.unwrap();
    assert!(fetched["threads"].as_array().unwrap().is_empty());
    assert!(server.state.world.threads.is_empty());
}

#[tokio::test]
async fn test_framing_errors_do_not_desync() {
    let server = start_configured(|c| c.max_frame_len = 1024, Registry::standard()).await;
    let client = Client::connect(server.addr).await.unwrap();

    let mut bad_kind = Frame::request("ping", &json!({})).unwrap().encode().unwrap().to_vec();
    bad_kind[0] = 9;
    let reply = client.call_raw(&bad_kind).await.unwrap();
    assert_eq!(reply.kind, FrameKind::Error);
    assert_eq!(reply.tag, FRAMING_ERROR_TAG);

    let oversized = Frame::request("ping", &"x".repeat(4000)).unwrap().encode().unwrap();
    let reply = client.call_raw(&oversized).await.unwrap();
    assert_eq!(reply.kind, FrameKind::Error);
    let body: Value = reply.json().unwrap();
    assert_eq!(body["code"], "malformed");

    let not_json = Frame { kind: FrameKind::Request, tag: "ping".into(), body: bytes::Bytes::from_static(b"{oops") };
    let reply = client.call_raw(&not_json.encode().unwrap()).await.unwrap();
    assert_eq!(reply.kind, FrameKind::Error);

    assert!(client.call("ping", &json!({})).await.is_ok());
}

#[tokio::test]
async fn test_motd_sent_after_login() {
    let server = start_configured(|c| c.motd = "welcome".into(), Registry::standard()).await;
    let (client, _, _) = signed_in(server.addr, "ann").await;
    match client.next_event(EVENT_WAIT).await.unwrap().event {
        Event::Notification { text } => assert_eq!(text, "welcome"),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(client.next_event(QUIET).await, Err(ClientError::Timeout)));
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let server = start_configured(|c| c.idle_timeout_secs = 1, Registry::standard()).await;
    let client = Client::connect(server.addr).await.unwrap();
    client.call("ping", &json!({})).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.state.sessions.count().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "idle session was not closed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(client.call("ping", &json!({})).await.is_err());
}

#[tokio::test]
async fn test_session_limit() {
    let server = start_configured(|c| c.max_sessions = 1, Registry::standard()).await;
    let first = Client::connect(server.addr).await.unwrap();
    first.call("ping", &json!({})).await.unwrap();

    // the refusal arrives unasked; nothing is sent so the close stays clean
    let second = Client::connect(server.addr).await.unwrap().with_timeout(Duration::from_secs(2));
    let refusal = second.call_raw(&[]).await.unwrap();
    assert_eq!(refusal.kind, FrameKind::Error);
    assert_eq!(refusal.tag, CONNECT_ERROR_TAG);
    let body: Value = refusal.json().unwrap();
    assert_eq!(body["code"], "unavailable");
    assert_eq!(body["retryable"], json!(true));
    assert!(first.call("ping", &json!({})).await.is_ok());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (thread, user) = {
        let state = Arc::new(ServerState::new(test_config(dir.path())).await.unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(ServerState::serve(Arc::clone(&state), listener));

        let (ann, a, _) = signed_in(addr, "ann").await;
        let (_bob, b, _) = signed_in(addr, "bob").await;
        let thread = direct_thread(&ann, b).await;
        ann.call("message.send", &json!({ "thread_id": thread, "body": "persist me" })).await.unwrap();

        state.shutdown();
        tokio::time::timeout(Duration::from_secs(10), server).await.unwrap().unwrap().unwrap();
        (thread, a)
    };

    let reopened = ServerState::new(test_config(dir.path())).await.unwrap();
    assert_eq!(reopened.world.users.len(), 2);
    assert!(reopened.world.users.contains_key(&user));
    let history = reopened.world.history(thread, None, 10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].body, "persist me");
}

//! End-to-end tests over real sockets: one server task, real TCP
//! clients, timeout-guarded waits so a hung exchange fails instead of
//! wedging the suite.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use inklet_collab::protocol::{Cursor, MessageKind, Request, Response};
use inklet_collab::server::{CollabServer, ServerConfig, ShutdownHandle};
use inklet_collab::{ClientEvent, CollabClient};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (String, ShutdownHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        bind_addr: "127.0.0.1".into(),
        port: 0,
        workers: 2,
        data_dir: dir.path().to_path_buf(),
        log_file: None,
        write_timeout_ms: 2_000,
    };
    let server = CollabServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.run());
    (addr, shutdown, dir)
}

async fn next_event(rx: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn next_reply(rx: &mut UnboundedReceiver<ClientEvent>) -> Response {
    match next_event(rx).await {
        ClientEvent::Reply(response) => response,
        other => panic!("expected a reply, got {other:?}"),
    }
}

async fn next_edit(rx: &mut UnboundedReceiver<ClientEvent>) -> Request {
    match next_event(rx).await {
        ClientEvent::Edit(request) => request,
        other => panic!("expected an edit echo, got {other:?}"),
    }
}

/// Connect, register, and log in one user; returns the client with its
/// event receiver.
async fn logged_in(addr: &str, name: &str) -> (CollabClient, UnboundedReceiver<ClientEvent>) {
    let mut client = CollabClient::connect(addr).await.unwrap();
    let mut rx = client.take_event_rx().unwrap();

    client.register(name, "password").unwrap();
    let reply = next_reply(&mut rx).await;
    assert!(!reply.is_error(), "register failed: {:?}", reply.fields);

    client.login(name, "password").unwrap();
    let reply = next_reply(&mut rx).await;
    assert!(!reply.is_error(), "login failed: {:?}", reply.fields);
    assert_eq!(reply.kind, MessageKind::Login);
    assert!(client.user_id().is_some());

    (client, rx)
}

#[tokio::test]
async fn register_and_login_round_trip() {
    let (addr, _shutdown, _dir) = start_server().await;
    let mut client = CollabClient::connect(&addr).await.unwrap();
    let mut rx = client.take_event_rx().unwrap();

    client.register("alice", "pw").unwrap();
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply.kind, MessageKind::Register);
    assert_eq!(reply.fields, vec!["User successfully created".to_string()]);

    client.login("alice", "pw").unwrap();
    let reply = next_reply(&mut rx).await;
    assert_eq!(reply.kind, MessageKind::Login);
    assert!(!reply.fields[0].is_empty());
    assert_eq!(client.user_id().as_deref(), Some(reply.fields[0].as_str()));
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let (addr, _shutdown, _dir) = start_server().await;
    let mut client = CollabClient::connect(&addr).await.unwrap();
    let mut rx = client.take_event_rx().unwrap();

    client.register("alice", "pw").unwrap();
    assert!(!next_reply(&mut rx).await.is_error());

    client.register("alice", "other").unwrap();
    let reply = next_reply(&mut rx).await;
    assert!(reply.is_error());
    assert_eq!(reply.fields, vec!["Create user error".to_string()]);
}

#[tokio::test]
async fn session_requests_need_a_login_first() {
    let (addr, _shutdown, _dir) = start_server().await;
    let client = CollabClient::connect(&addr).await.unwrap();
    assert!(client.create("notes.txt").is_err());
}

#[tokio::test]
async fn edits_broadcast_to_every_participant() {
    let (addr, _shutdown, _dir) = start_server().await;
    let (alice, mut alice_rx) = logged_in(&addr, "alice").await;
    let (bob, mut bob_rx) = logged_in(&addr, "bob").await;

    alice.create("shared.txt").unwrap();
    let reply = next_reply(&mut alice_rx).await;
    assert_eq!(reply.kind, MessageKind::Create);
    let code = reply.fields[0].clone();
    assert_eq!(code.len(), 6);

    bob.join(&code).unwrap();
    let reply = next_reply(&mut bob_rx).await;
    assert_eq!(reply.kind, MessageKind::Join);
    assert_eq!(reply.fields[0], "");

    alice.write(Cursor::new(0, 0), "hi").unwrap();
    for rx in [&mut alice_rx, &mut bob_rx] {
        let echo = next_edit(rx).await;
        match echo {
            Request::Write { cursor, text, .. } => {
                assert_eq!(cursor, Cursor::new(0, 0));
                assert_eq!(text, "hi");
            }
            other => panic!("expected a write echo, got {other:?}"),
        }
    }

    // A later joiner sees the text the session has accumulated.
    let (carol, mut carol_rx) = logged_in(&addr, "carol").await;
    carol.join(&code).unwrap();
    let reply = next_reply(&mut carol_rx).await;
    assert_eq!(reply.kind, MessageKind::Join);
    assert_eq!(reply.fields[0], "hi");
}

#[tokio::test]
async fn erase_echoes_like_write() {
    let (addr, _shutdown, _dir) = start_server().await;
    let (alice, mut alice_rx) = logged_in(&addr, "alice").await;

    alice.create("t.txt").unwrap();
    let code = next_reply(&mut alice_rx).await.fields[0].clone();

    alice.write(Cursor::new(0, 0), "abcd").unwrap();
    next_edit(&mut alice_rx).await;

    alice.erase(Cursor::new(0, 4), 2).unwrap();
    match next_edit(&mut alice_rx).await {
        Request::Erase { cursor, count, .. } => {
            assert_eq!(cursor, Cursor::new(0, 4));
            assert_eq!(count, 2);
        }
        other => panic!("expected an erase echo, got {other:?}"),
    }

    let (bob, mut bob_rx) = logged_in(&addr, "bob").await;
    bob.join(&code).unwrap();
    assert_eq!(next_reply(&mut bob_rx).await.fields[0], "ab");
}

#[tokio::test]
async fn out_of_range_cursor_is_a_unicast_error() {
    let (addr, _shutdown, _dir) = start_server().await;
    let (alice, mut alice_rx) = logged_in(&addr, "alice").await;

    alice.create("t.txt").unwrap();
    next_reply(&mut alice_rx).await;

    alice.write(Cursor::new(9, 0), "x").unwrap();
    let reply = next_reply(&mut alice_rx).await;
    assert!(reply.is_error());
    assert_eq!(
        reply.fields,
        vec!["Cannot place cursor on write msg!".to_string()]
    );
}

#[tokio::test]
async fn load_of_missing_document_is_an_error() {
    let (addr, _shutdown, _dir) = start_server().await;
    let (alice, mut alice_rx) = logged_in(&addr, "alice").await;

    alice.load("absent.txt").unwrap();
    let reply = next_reply(&mut alice_rx).await;
    assert!(reply.is_error());
    assert_eq!(reply.fields, vec!["Load document error".to_string()]);
}

#[tokio::test]
async fn concurrent_writers_lose_no_update() {
    let (addr, _shutdown, _dir) = start_server().await;
    let (alice, mut alice_rx) = logged_in(&addr, "alice").await;
    let (bob, mut bob_rx) = logged_in(&addr, "bob").await;

    alice.create("race.txt").unwrap();
    let code = next_reply(&mut alice_rx).await.fields[0].clone();
    bob.join(&code).unwrap();
    next_reply(&mut bob_rx).await;

    // Both write at the origin at once; the server serializes them.
    alice.write(Cursor::new(0, 0), "a").unwrap();
    bob.write(Cursor::new(0, 0), "b").unwrap();

    for rx in [&mut alice_rx, &mut bob_rx] {
        next_edit(rx).await;
        next_edit(rx).await;
    }

    let (carol, mut carol_rx) = logged_in(&addr, "carol").await;
    carol.join(&code).unwrap();
    let text = next_reply(&mut carol_rx).await.fields[0].clone();
    assert_eq!(text.len(), 2, "both writes survive, got {text:?}");
    assert!(text == "ab" || text == "ba");
}

#[tokio::test]
async fn malformed_bytes_get_an_error_and_the_connection_survives() {
    let (addr, _shutdown, _dir) = start_server().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    // An unknown kind byte with a plausible header.
    stream.write_all(&[200, 1, 0]).await.unwrap();
    let reply = read_response(&mut stream).await;
    assert!(reply.is_error());
    assert_eq!(reply.fields, vec!["Malformed message".to_string()]);

    // The same connection still serves valid requests.
    let request = Request::Register {
        username: "dora".into(),
        password: "pw".into(),
    };
    stream.write_all(&request.encode().unwrap()).await.unwrap();
    let reply = read_response(&mut stream).await;
    assert_eq!(reply.kind, MessageKind::Register);
    assert!(!reply.is_error());
}

async fn read_response(stream: &mut TcpStream) -> Response {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Ok((response, used)) = Response::decode_prefix(&buf) {
            buf.drain(..used);
            return response;
        }
        let n = tokio::time::timeout(WAIT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for a response")
            .expect("read failed");
        assert!(n > 0, "server closed the connection");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn disconnect_reclaims_the_access_code() {
    let (addr, _shutdown, _dir) = start_server().await;
    let code = {
        let (alice, mut alice_rx) = logged_in(&addr, "alice").await;
        alice.create("brief.txt").unwrap();
        next_reply(&mut alice_rx).await.fields[0].clone()
    };
    // Alice's client (and connection) dropped; give the server a moment
    // to observe the close.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (bob, mut bob_rx) = logged_in(&addr, "bob").await;
    bob.join(&code).unwrap();
    let reply = next_reply(&mut bob_rx).await;
    assert!(reply.is_error());
    assert_eq!(reply.fields, vec!["Invalid access code!".to_string()]);
}

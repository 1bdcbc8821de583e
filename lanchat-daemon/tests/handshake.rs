//! Control listener and handshake over real loopback sockets.

mod common;

use std::time::Duration;

use common::*;
use lanchat_core::{Event, PeerId};
use lanchat_daemon::{ConnectTarget, Node};
use serde_json::json;
use tokio::net::TcpStream;

#[tokio::test]
async fn raw_connect_gets_ack_and_directory_entry() {
    let mut b = start("Bob").await;
    let mut stream = TcpStream::connect(b.control_addr()).await.unwrap();
    write_raw(
        &mut stream,
        r#"{"type":"connect","user_id":"aaaa1111","name":"Alice","ip":"10.0.0.5","file_port":12346}"#,
    )
    .await;

    let ack = read_value(&mut stream).await.expect("connect_ack");
    assert_eq!(
        ack,
        json!({
            "type": "connect_ack",
            "user_id": b.id().as_str(),
            "name": "Bob",
            "ip": "127.0.0.1",
            "file_port": b.file_addr().port(),
        })
    );

    let alice = PeerId::from("aaaa1111");
    b.wait_for(|e| matches!(e, Event::PeerConnected { peer, name } if *peer == alice && name == "Alice"))
        .await;
    let entry = b.node.peer(&alice).await.unwrap();
    assert_eq!(entry.ip, "10.0.0.5");
    assert_eq!(entry.name, "Alice");
    assert_eq!(entry.file_port, 12346);
    assert!(entry.is_online);
    assert!(b.node.is_connected(&alice).await);

    // Saved on handshake.
    let contacts: serde_json::Value = serde_json::from_slice(
        &std::fs::read(b.data.path().join("contacts.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(contacts["aaaa1111"]["name"], "Alice");
}

#[tokio::test]
async fn first_envelope_must_be_connect() {
    let b = start("Bob").await;
    let mut stream = TcpStream::connect(b.control_addr()).await.unwrap();
    write_raw(
        &mut stream,
        r#"{"type":"message","from_id":"aaaa1111","from_name":"Alice","message":"hi","timestamp":"2024-05-01T12:00:00Z"}"#,
    )
    .await;
    let reply = tokio::time::timeout(
        Duration::from_secs(7),
        lanchat_daemon::framing::read_frame(&mut stream),
    )
    .await
    .expect("connection should be dropped");
    assert!(matches!(reply, Ok(None) | Err(_)));
    assert!(!b.node.is_connected(&PeerId::from("aaaa1111")).await);
    assert!(b.node.peers().await.is_empty());
}

#[tokio::test]
async fn garbage_handshake_is_dropped() {
    let b = start("Bob").await;
    let mut stream = TcpStream::connect(b.control_addr()).await.unwrap();
    write_raw(&mut stream, "{\"type\":\"connect\",\"user_id\":").await;
    let reply = tokio::time::timeout(
        Duration::from_secs(7),
        lanchat_daemon::framing::read_frame(&mut stream),
    )
    .await
    .expect("connection should be dropped");
    assert!(matches!(reply, Ok(None) | Err(_)));
}

#[tokio::test]
async fn both_directories_list_each_other_online() {
    let (a, b) = connected_pair().await;

    let b_in_a = a.node.peer(&b.id()).await.unwrap();
    assert_eq!(b_in_a.name, "Bob");
    assert_eq!(b_in_a.ip, "127.0.0.1");
    assert_eq!(b_in_a.file_port, b.file_addr().port());
    assert!(b_in_a.is_online);

    let a_in_b = b.node.peer(&a.id()).await.unwrap();
    assert_eq!(a_in_b.name, "Alice");
    assert_eq!(a_in_b.port, a.control_addr().port());
    assert!(a_in_b.is_online);

    assert_eq!(a.node.peers().await.len(), 1);
    assert_eq!(b.node.peers().await.len(), 1);
}

#[tokio::test]
async fn reconnect_replaces_and_closes_old_connection() {
    let mut b = start("Bob").await;
    let mut first = raw_connect(&mut b).await;
    let _second = raw_connect(&mut b).await;

    // The superseded socket is closed by the node.
    let closed = tokio::time::timeout(WAIT, lanchat_daemon::framing::read_frame(&mut first))
        .await
        .expect("old connection should close");
    assert!(matches!(closed, Ok(None) | Err(_)));

    // Its teardown must not evict the live connection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let alice = PeerId::from(RAW_ID);
    assert!(b.node.is_connected(&alice).await);
    assert!(b.node.peer(&alice).await.unwrap().is_online);
}

#[tokio::test]
async fn peer_closing_marks_it_offline() {
    let mut b = start("Bob").await;
    let stream = raw_connect(&mut b).await;
    drop(stream);
    let alice = PeerId::from(RAW_ID);
    b.wait_for(|e| matches!(e, Event::PeerDisconnected { peer } if *peer == alice))
        .await;
    assert!(!b.node.is_connected(&alice).await);
    assert!(!b.node.peer(&alice).await.unwrap().is_online);
}

#[tokio::test]
async fn connect_to_nothing_fails() {
    let a = start("Alice").await;
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    assert!(a.node.connect(addr).await.is_err());
    assert!(a.node.connect_to_id(a.node.peer_id()).await.is_err());
    assert!(a.node.connect_to_id(&PeerId::from("ffffffff")).await.is_err());
}

#[tokio::test]
async fn identity_and_contacts_survive_restart() {
    let (a, b) = connected_pair().await;
    let a_id = a.id();
    let b_id = b.id();
    let TestNode {
        node,
        data,
        downloads,
        ..
    } = b;
    node.shutdown().await;

    let (node, _events) = Node::start(config(None, data.path(), downloads.path()))
        .await
        .unwrap();
    assert_eq!(node.peer_id(), &b_id);
    assert_eq!(node.profile().name, "Bob");
    let peers = node.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, a_id);
    assert!(!peers[0].is_online);

    // Reconnect by id using the stored address and port.
    assert_eq!(node.connect_to_id(&a_id).await.unwrap(), a_id);
    node.shutdown().await;
    a.node.shutdown().await;
}

#[tokio::test]
async fn first_run_needs_a_name() {
    let data = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    assert!(matches!(
        Node::start(config(None, data.path(), downloads.path())).await,
        Err(lanchat_daemon::NodeError::MissingName)
    ));
}

#[tokio::test]
async fn background_connect_reports_through_events() {
    let mut a = start("Alice").await;
    let b = start("Bob").await;
    let dead = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let failing = a.node.connect_in_background(ConnectTarget::Addr(dead));
    let wanted = dead.to_string();
    a.wait_for(|e| matches!(e, Event::Notice(text) if text.contains(&wanted)))
        .await;
    assert!(failing.await.unwrap().is_err());

    let unknown = a
        .node
        .connect_in_background(ConnectTarget::Known(PeerId::from("ffffffff")));
    a.wait_for(|e| matches!(e, Event::Notice(text) if text.contains("ffffffff")))
        .await;
    assert!(unknown.await.unwrap().is_err());

    let b_id = b.id();
    let ok = a.node.connect_in_background(ConnectTarget::Addr(b.control_addr()));
    a.wait_for(|e| matches!(e, Event::PeerConnected { peer, .. } if *peer == b_id))
        .await;
    assert_eq!(ok.await.unwrap().unwrap(), b_id);
}

#[tokio::test]
async fn inbound_handshake_keeps_dialled_control_port() {
    let (a, b) = connected_pair().await;
    let b_port = b.control_addr().port();

    // Dialling Bob teaches Alice his real control port.
    a.node.connect(b.control_addr()).await.unwrap();
    assert_eq!(a.node.peer(&b.id()).await.unwrap().port, b_port);

    // Bob dialling in again must not reset it to the default.
    b.node.connect(a.control_addr()).await.unwrap();
    assert_eq!(a.node.peer(&b.id()).await.unwrap().port, b_port);
    assert_eq!(a.node.connect_to_id(&b.id()).await.unwrap(), b.id());
}

//! Shared helpers: nodes on ephemeral loopback ports with throwaway directories, event waits,
//! and a hand-driven "raw" peer that speaks the wire protocol directly.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanchat_core::{Event, PeerId};
use lanchat_daemon::{framing, Config, Node};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(10);
pub const RAW_ID: &str = "aaaa1111";

pub struct TestNode {
    pub node: Node,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub data: TempDir,
    pub downloads: TempDir,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.node.peer_id().clone()
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.node.control_addr().expect("control listener")
    }

    pub fn file_addr(&self) -> SocketAddr {
        self.node.file_addr().expect("file listener")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.downloads.path().join("LanChat")
    }

    /// Next event matching `pred`; others are skipped.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&Event) -> bool) -> Event {
        let found = tokio::time::timeout(WAIT, async {
            while let Some(event) = self.events.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }

    /// Every event arriving within `window`.
    pub async fn drain(&mut self, window: Duration) -> Vec<Event> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            out.push(event);
        }
        out
    }
}

pub fn config(name: Option<&str>, data: &Path, downloads: &Path) -> Config {
    Config {
        display_name: name.map(str::to_string),
        control_port: 0,
        file_port: 0,
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        data_dir: data.to_path_buf(),
        download_dir: downloads.join("LanChat"),
    }
}

pub async fn start(name: &str) -> TestNode {
    let data = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (node, events) = Node::start(config(Some(name), data.path(), downloads.path()))
        .await
        .unwrap();
    TestNode {
        node,
        events,
        data,
        downloads,
    }
}

/// Two nodes, `b` connected to `a`, both having seen the handshake.
pub async fn connected_pair() -> (TestNode, TestNode) {
    let mut a = start("Alice").await;
    let mut b = start("Bob").await;
    let a_id = b.node.connect(a.control_addr()).await.unwrap();
    assert_eq!(a_id, a.id());
    let b_id = b.id();
    a.wait_for(|e| matches!(e, Event::PeerConnected { peer, .. } if *peer == b_id))
        .await;
    b.wait_for(|e| matches!(e, Event::PeerConnected { peer, .. } if *peer == a_id))
        .await;
    (a, b)
}

pub async fn write_raw(stream: &mut TcpStream, json: &str) {
    stream
        .write_all(&(json.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(json.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
}

pub async fn write_value(stream: &mut TcpStream, value: &Value) {
    framing::write_json(stream, value).await.unwrap();
}

/// Next frame as JSON, None on EOF.
pub async fn read_value(stream: &mut TcpStream) -> Option<Value> {
    let frame = tokio::time::timeout(WAIT, framing::read_frame(stream))
        .await
        .expect("timed out waiting for a frame")
        .ok()??;
    Some(serde_json::from_slice(&frame).unwrap())
}

pub fn raw_hello(kind: &str, file_port: u16) -> Value {
    json!({
        "type": kind,
        "user_id": RAW_ID,
        "name": "Alice",
        "ip": "127.0.0.1",
        "file_port": file_port,
    })
}

/// Dial `node` as the raw peer and complete the handshake.
pub async fn raw_connect(node: &mut TestNode) -> TcpStream {
    let mut stream = TcpStream::connect(node.control_addr()).await.unwrap();
    write_value(&mut stream, &raw_hello("connect", 12346)).await;
    let ack = read_value(&mut stream).await.expect("connect_ack");
    assert_eq!(ack["type"], "connect_ack");
    node.wait_for(|e| matches!(e, Event::PeerConnected { peer, .. } if peer.as_str() == RAW_ID))
        .await;
    stream
}

/// Raw peer that `node` dials: returns the control stream and the raw file listener.
pub async fn raw_listener_peer(node: &mut TestNode) -> (TcpStream, TcpListener) {
    let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let files = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let file_port = files.local_addr().unwrap().port();
    let addr = control.local_addr().unwrap();
    let raw = tokio::spawn(async move {
        let (mut stream, _) = control.accept().await.unwrap();
        let connect = read_value(&mut stream).await.expect("connect");
        assert_eq!(connect["type"], "connect");
        write_value(&mut stream, &raw_hello("connect_ack", file_port)).await;
        stream
    });
    let peer = node.node.connect(addr).await.unwrap();
    assert_eq!(peer.as_str(), RAW_ID);
    (raw.await.unwrap(), files)
}

pub fn file_request(id: u64, name: &str, size: u64) -> Value {
    json!({
        "type": "file_request",
        "from_id": RAW_ID,
        "from_name": "Alice",
        "filename": name,
        "filesize": size,
        "transfer_id": id,
    })
}

pub fn file_metadata(id: u64, name: &str, size: u64) -> Value {
    json!({
        "type": "file_metadata",
        "filename": name,
        "filesize": size,
        "transfer_id": id,
        "sender_id": RAW_ID,
        "sender_name": "Alice",
    })
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

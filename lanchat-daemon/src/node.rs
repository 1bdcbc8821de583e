//! Node: owns the shared state, starts the pollers and exposes the front-end API.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lanchat_core::{
    Action, ChatCore, DirectoryEntry, Event, LocalProfile, PeerDirectory, PeerId, TransferId,
    TransferKey, TransferRecord,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control;
use crate::error::NodeError;
use crate::gateway::Gateway;
use crate::poller::{self, PollEvent};
use crate::registry::ConnectionRegistry;
use crate::store::{Settings, Store};
use crate::transfer;

/// Grace period for the pollers to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// State shared by pollers, connection tasks and transfer workers. The core and the registry
/// each have their own lock; never hold both at once.
pub(crate) struct Shared {
    pub core: Mutex<ChatCore>,
    pub registry: ConnectionRegistry,
    pub gateway: Gateway,
    pub store: Store,
    /// None when the download directory could not be created.
    pub download_dir: Option<PathBuf>,
    /// Sending workers wait on these until `file_accept` / `file_reject` arrives.
    pub upload_gates: Mutex<HashMap<TransferKey, oneshot::Sender<bool>>>,
    pub inbox: mpsc::UnboundedSender<PollEvent>,
    pub shutdown: CancellationToken,
}

impl Shared {
    /// Carry out what the core asked for. Call with the core lock released.
    pub async fn dispatch(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Notify(event) => self.gateway.emit(event),
                Action::Send(peer, envelope) => match self.registry.get(&peer).await {
                    Some(conn) => {
                        if let Err(e) = conn.send(&envelope) {
                            warn!(peer = %peer, kind = envelope.kind(), "send failed: {}", e);
                        }
                    }
                    None => debug!(peer = %peer, kind = envelope.kind(), "not connected, envelope dropped"),
                },
                Action::Persist => self.persist_directory().await,
                Action::ResolveUpload(key, accepted) => {
                    if let Some(gate) = self.upload_gates.lock().await.remove(&key) {
                        let _ = gate.send(accepted);
                    }
                }
            }
        }
    }

    pub async fn persist_directory(&self) {
        let entries = self.core.lock().await.directory().snapshot();
        if let Err(e) = self.store.save_directory(&entries) {
            warn!("saving contacts: {}", e);
        }
    }

    /// Directory entries with the online flag corrected against the registry.
    async fn reconcile(&self, mut entries: Vec<DirectoryEntry>) -> Vec<DirectoryEntry> {
        for e in entries.iter_mut() {
            e.is_online = self.registry.contains(&e.id).await;
        }
        entries
    }
}

/// A running LanChat instance.
pub struct Node {
    shared: Arc<Shared>,
    profile: LocalProfile,
    control_addr: Option<SocketAddr>,
    file_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Load identity and contacts, bind both listeners and start the pollers. Returns the node
    /// and the event stream for the front end.
    ///
    /// A listener that cannot bind, or a download directory that cannot be created, is
    /// reported as a notice and disables that subsystem only.
    pub async fn start(config: Config) -> Result<(Node, mpsc::UnboundedReceiver<Event>), NodeError> {
        let (gateway, events) = Gateway::channel();
        let store = Store::open(&config.data_dir)?;
        let stored = store.load_settings()?;

        let name = match (&config.display_name, &stored) {
            (Some(n), _) if !n.trim().is_empty() => n.trim().to_string(),
            (_, Some(s)) => s.username.clone(),
            _ => return Err(NodeError::MissingName),
        };
        let id = match &stored {
            Some(s) => s.user_id.clone(),
            None => PeerId::generate(&name, &host_name(), Utc::now()),
        };

        let control_listener = match TcpListener::bind((config.bind_addr, config.control_port)).await {
            Ok(l) => Some(l),
            Err(e) => {
                warn!(port = config.control_port, "control listener disabled: {}", e);
                gateway.notice(format!(
                    "Control port {} unavailable ({}); incoming connections disabled",
                    config.control_port, e
                ));
                None
            }
        };

        let download_dir = match tokio::fs::create_dir_all(&config.download_dir).await {
            Ok(()) => Some(config.download_dir.clone()),
            Err(e) => {
                warn!(dir = %config.download_dir.display(), "receiving disabled: {}", e);
                gateway.notice(format!(
                    "Cannot use download directory {} ({}); receiving files disabled",
                    config.download_dir.display(),
                    e
                ));
                None
            }
        };
        let file_listener = match &download_dir {
            Some(_) => match TcpListener::bind((config.bind_addr, config.file_port)).await {
                Ok(l) => Some(l),
                Err(e) => {
                    warn!(port = config.file_port, "file listener disabled: {}", e);
                    gateway.notice(format!(
                        "File port {} unavailable ({}); receiving files disabled",
                        config.file_port, e
                    ));
                    None
                }
            },
            None => None,
        };

        let control_addr = control_listener.as_ref().and_then(|l| l.local_addr().ok());
        let file_addr = file_listener.as_ref().and_then(|l| l.local_addr().ok());
        let ip = match config.advertise_ip {
            Some(ip) => ip,
            None => detect_local_ip().await,
        };
        let profile = LocalProfile {
            id: id.clone(),
            name: name.clone(),
            ip: ip.to_string(),
            control_port: control_addr.map(|a| a.port()).unwrap_or(config.control_port),
            file_port: file_addr.map(|a| a.port()).unwrap_or(config.file_port),
        };
        store.save_settings(&Settings {
            username: name,
            user_id: id.clone(),
            user_ip: Some(profile.ip.clone()),
            port: profile.control_port,
            file_port: profile.file_port,
        })?;

        let directory = match store.load_directory() {
            Ok(entries) => PeerDirectory::from_entries(id.clone(), entries),
            Err(e) => {
                warn!("contacts not loaded: {}", e);
                gateway.notice(format!("Could not load contacts: {}", e));
                PeerDirectory::new(id.clone())
            }
        };

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            core: Mutex::new(ChatCore::new(profile.clone(), directory)),
            registry: ConnectionRegistry::new(),
            gateway,
            store,
            download_dir,
            upload_gates: Mutex::new(HashMap::new()),
            inbox,
            shutdown: CancellationToken::new(),
        });

        let mut tasks = vec![tokio::spawn(poller::run_control(
            shared.clone(),
            control_listener,
            inbox_rx,
        ))];
        if let Some(listener) = file_listener {
            tasks.push(tokio::spawn(poller::run_files(shared.clone(), listener)));
        }
        info!(
            peer = %profile.id,
            name = %profile.name,
            ip = %profile.ip,
            control = ?control_addr,
            files = ?file_addr,
            "node started"
        );

        Ok((
            Node {
                shared,
                profile,
                control_addr,
                file_addr,
                tasks,
            },
            events,
        ))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.profile.id
    }

    pub fn profile(&self) -> &LocalProfile {
        &self.profile
    }

    /// Bound control listener, if inbound control is enabled.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Bound file listener, if receiving is enabled.
    pub fn file_addr(&self) -> Option<SocketAddr> {
        self.file_addr
    }

    /// Open a control connection and handshake with whoever listens at `addr`.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, NodeError> {
        dial(&self.shared, ConnectTarget::Addr(addr)).await
    }

    /// Connect to a directory entry at its recorded address and control port.
    pub async fn connect_to_id(&self, peer: &PeerId) -> Result<PeerId, NodeError> {
        dial(&self.shared, ConnectTarget::Known(peer.clone())).await
    }

    /// Connect on a worker task so the caller is never held up by connect and handshake
    /// timeouts. Success shows up as `PeerConnected`, failure as a `Notice`.
    pub fn connect_in_background(
        &self,
        target: ConnectTarget,
    ) -> JoinHandle<Result<PeerId, NodeError>> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = dial(&shared, target.clone()).await;
            if let Err(e) = &result {
                warn!(%target, "connect failed: {}", e);
                shared.gateway.notice(format!("Could not connect to {}: {}", target, e));
            }
            result
        })
    }

    pub async fn send_message(&self, peer: &PeerId, text: &str) -> Result<(), NodeError> {
        let conn = self
            .shared
            .registry
            .get(peer)
            .await
            .ok_or_else(|| NodeError::NotConnected(peer.clone()))?;
        let envelope = self.shared.core.lock().await.compose_message(text, Utc::now());
        conn.send(&envelope)?;
        debug!(peer = %peer, "message sent");
        Ok(())
    }

    /// Send `text` to every connected peer. Returns how many got it.
    pub async fn broadcast(&self, text: &str) -> usize {
        let envelope = self.shared.core.lock().await.compose_message(text, Utc::now());
        let mut sent = 0;
        for (peer, conn) in self.shared.registry.all().await {
            match conn.send(&envelope) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer, "broadcast failed: {}", e),
            }
        }
        sent
    }

    /// Offer `path` to `peer`. The upload starts once the peer accepts; progress and the outcome
    /// arrive as events.
    pub async fn send_file(&self, peer: &PeerId, path: &Path) -> Result<TransferId, NodeError> {
        self.ensure_running()?;
        transfer::offer(&self.shared, peer, path).await
    }

    /// Answer a `FileRequest` event.
    pub async fn respond_file_request(
        &self,
        peer: &PeerId,
        transfer_id: TransferId,
        accept: bool,
    ) -> Result<(), NodeError> {
        if accept && self.shared.download_dir.is_none() {
            return Err(NodeError::ReceivingDisabled);
        }
        let actions = self
            .shared
            .core
            .lock()
            .await
            .decide_file_request(peer, transfer_id, accept, Instant::now())?;
        info!(peer = %peer, transfer_id, accept, "file request answered");
        self.shared.dispatch(actions).await;
        Ok(())
    }

    /// Open a conversation with `peer` (or none). Messages from the focused peer arrive as
    /// `Message`, all others as `NewMessageNotice`.
    pub async fn set_focus(&self, peer: Option<PeerId>) {
        self.shared.core.lock().await.set_focus(peer);
    }

    pub async fn focused(&self) -> Option<PeerId> {
        self.shared.core.lock().await.focused().cloned()
    }

    /// Known peers (self excluded), online first.
    pub async fn peers(&self) -> Vec<DirectoryEntry> {
        let entries: Vec<DirectoryEntry> = self
            .shared
            .core
            .lock()
            .await
            .directory()
            .contacts()
            .into_iter()
            .cloned()
            .collect();
        let mut entries = self.shared.reconcile(entries).await;
        entries.sort_by(|a, b| {
            b.is_online
                .cmp(&a.is_online)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        entries
    }

    pub async fn peer(&self, peer: &PeerId) -> Option<DirectoryEntry> {
        let entry = self.shared.core.lock().await.directory().lookup(peer).cloned()?;
        if entry.id == self.profile.id {
            return Some(entry);
        }
        self.shared.reconcile(vec![entry]).await.pop()
    }

    pub async fn search(&self, term: &str) -> Vec<DirectoryEntry> {
        let entries: Vec<DirectoryEntry> = self
            .shared
            .core
            .lock()
            .await
            .directory()
            .search(term)
            .into_iter()
            .cloned()
            .collect();
        self.shared.reconcile(entries).await
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.shared.registry.contains(peer).await
    }

    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.shared
            .core
            .lock()
            .await
            .transfers()
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn transfer(&self, key: &TransferKey) -> Option<TransferRecord> {
        self.shared.core.lock().await.transfers().get(key).cloned()
    }

    /// Close every control connection. Peers are marked offline as their readers wind down.
    pub async fn disconnect_all(&self) {
        for (_, conn) in self.shared.registry.all().await {
            conn.close();
        }
    }

    /// Stop pollers, connections and transfers, then save contacts.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shared.shutdown.cancel();
        self.shared.registry.close_all().await;
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("poller did not stop in time");
            }
        }
        self.shared.persist_directory().await;
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(NodeError::ShuttingDown);
        }
        Ok(())
    }
}

/// Where an outbound connection should go.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectTarget {
    Addr(SocketAddr),
    /// A directory entry, dialled at its recorded address and control port.
    Known(PeerId),
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Addr(addr) => write!(f, "{}", addr),
            ConnectTarget::Known(peer) => write!(f, "{}", peer),
        }
    }
}

async fn dial(shared: &Arc<Shared>, target: ConnectTarget) -> Result<PeerId, NodeError> {
    if shared.shutdown.is_cancelled() {
        return Err(NodeError::ShuttingDown);
    }
    let addr = match target {
        ConnectTarget::Addr(addr) => addr,
        ConnectTarget::Known(peer) => {
            let entry = {
                let core = shared.core.lock().await;
                if &peer == core.peer_id() {
                    return Err(NodeError::SelfConnect);
                }
                core.directory()
                    .lookup(&peer)
                    .cloned()
                    .ok_or_else(|| NodeError::UnknownPeer(peer.clone()))?
            };
            let ip: IpAddr = entry.ip.parse().map_err(|_| NodeError::BadAddress {
                peer: peer.clone(),
                addr: entry.ip.clone(),
            })?;
            SocketAddr::new(ip, entry.port)
        }
    };
    control::connect(shared, addr).await
}

/// Address of the interface that routes outward. No packet is sent.
async fn detect_local_ip() -> IpAddr {
    let probe = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await?;
        socket.local_addr().map(|a| a.ip())
    };
    match probe.await {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!("local address detection failed: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

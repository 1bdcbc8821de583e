//! Event pollers: one long-lived task per listening role. The control poller accepts control
//! connections and routes everything the connection readers report; the file poller accepts
//! data connections and hands each to a receive worker.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lanchat_core::{Envelope, PeerId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control;
use crate::node::Shared;
use crate::transfer;

/// Housekeeping period (undecided file requests are expired on this tick).
pub const TICK: Duration = Duration::from_millis(100);

/// Reported by connection reader tasks.
#[derive(Debug)]
pub(crate) enum PollEvent {
    /// A decoded envelope from the connection `conn` registered for `peer`.
    Frame {
        peer: PeerId,
        conn: u64,
        envelope: Envelope,
    },
    /// The connection hit EOF or an error, or was closed locally.
    Closed { peer: PeerId, conn: u64 },
}

/// Wait for the next connection, or forever when the listener is disabled.
async fn accept_next(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn run_control(
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    mut inbox: mpsc::UnboundedReceiver<PollEvent>,
) {
    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = accept_next(listener.as_ref()) => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "control connection accepted");
                    tokio::spawn(control::accept(shared.clone(), stream, addr));
                }
                Err(e) => {
                    warn!("control accept failed: {}", e);
                    tokio::time::sleep(TICK).await;
                }
            },
            Some(event) = inbox.recv() => handle_event(&shared, event).await,
            _ = tick.tick() => {
                let actions = shared.core.lock().await.expire_requests(Instant::now());
                if !actions.is_empty() {
                    debug!("request housekeeping: {} action(s)", actions.len());
                    shared.dispatch(actions).await;
                }
            }
        }
    }
    debug!("control poller stopped");
}

async fn handle_event(shared: &Arc<Shared>, event: PollEvent) {
    match event {
        PollEvent::Frame {
            peer,
            conn,
            envelope,
        } => {
            debug!(peer = %peer, conn, kind = envelope.kind(), "envelope");
            let actions = shared
                .core
                .lock()
                .await
                .on_envelope(&peer, envelope, Utc::now(), Instant::now());
            shared.dispatch(actions).await;
        }
        PollEvent::Closed { peer, conn } => {
            if !shared.registry.remove(&peer, conn).await {
                debug!(peer = %peer, conn, "superseded connection closed");
                return;
            }
            info!(peer = %peer, "peer disconnected");
            let actions = shared.core.lock().await.on_disconnect(&peer);
            shared.dispatch(actions).await;
        }
    }
}

pub(crate) async fn run_files(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "data connection accepted");
                    tokio::spawn(transfer::receive(shared.clone(), stream, addr));
                }
                Err(e) => {
                    warn!("file accept failed: {}", e);
                    tokio::time::sleep(TICK).await;
                }
            },
        }
    }
    debug!("file poller stopped");
}

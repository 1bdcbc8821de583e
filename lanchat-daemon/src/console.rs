//! Line-oriented front end: command parsing and event rendering.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use lanchat_core::{
    DirectoryEntry, Direction, Event, PeerId, TransferId, TransferRecord, TransferStatus,
    DEFAULT_CONTROL_PORT,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(SocketAddr),
    ConnectId(PeerId),
    /// `None` closes the open conversation.
    Focus(Option<PeerId>),
    /// Text for the focused peer.
    Msg(String),
    /// Text for every connected peer.
    All(String),
    Send(PathBuf),
    Accept(PeerId, TransferId),
    Reject(PeerId, TransferId),
    Peers,
    Search(String),
    Transfers,
    WhoAmI,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("unknown command /{0} (try /help)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("bad address {0:?}")]
    Address(String),
}

/// Parse one input line. Blank lines give `Ok(None)`; text without a leading `/` is a message
/// for the focused peer.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Msg(line.to_string())));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    let words: Vec<&str> = args.split_whitespace().collect();
    let cmd = match name {
        "connect" => match words.as_slice() {
            [ip] => Command::Connect(socket_addr(ip, None)?),
            [ip, port] => Command::Connect(socket_addr(ip, Some(port))?),
            _ => return Err(ParseError::Usage("/connect <ip> [port]")),
        },
        "connect-id" => match words.as_slice() {
            [id] => Command::ConnectId(PeerId::from(*id)),
            _ => return Err(ParseError::Usage("/connect-id <peer id>")),
        },
        "focus" => match words.as_slice() {
            [] => Command::Focus(None),
            [id] => Command::Focus(Some(PeerId::from(*id))),
            _ => return Err(ParseError::Usage("/focus [peer id]")),
        },
        "msg" if !args.is_empty() => Command::Msg(args.to_string()),
        "msg" => return Err(ParseError::Usage("/msg <text>")),
        "all" if !args.is_empty() => Command::All(args.to_string()),
        "all" => return Err(ParseError::Usage("/all <text>")),
        "send" if !args.is_empty() => Command::Send(PathBuf::from(args)),
        "send" => return Err(ParseError::Usage("/send <path>")),
        "accept" | "reject" => {
            let usage = if name == "accept" {
                "/accept <peer id> <transfer id>"
            } else {
                "/reject <peer id> <transfer id>"
            };
            let (peer, id) = match words.as_slice() {
                [peer, id] => (
                    PeerId::from(*peer),
                    id.parse::<TransferId>().map_err(|_| ParseError::Usage(usage))?,
                ),
                _ => return Err(ParseError::Usage(usage)),
            };
            if name == "accept" {
                Command::Accept(peer, id)
            } else {
                Command::Reject(peer, id)
            }
        }
        "peers" => Command::Peers,
        "search" if !args.is_empty() => Command::Search(args.to_string()),
        "search" => return Err(ParseError::Usage("/search <term>")),
        "transfers" => Command::Transfers,
        "whoami" => Command::WhoAmI,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

fn socket_addr(ip: &str, port: Option<&&str>) -> Result<SocketAddr, ParseError> {
    let ip: IpAddr = ip.parse().map_err(|_| ParseError::Address(ip.to_string()))?;
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| ParseError::Address(p.to_string()))?,
        None => DEFAULT_CONTROL_PORT,
    };
    Ok(SocketAddr::new(ip, port))
}

pub const HELP: &str = "\
/connect <ip> [port]        connect to a peer
/connect-id <id>            reconnect to a known peer
/focus [id]                 open (or close) a conversation
/msg <text>  or just text   message the focused peer
/all <text>                 message every connected peer
/send <path>                offer a file to the focused peer
/accept <id> <transfer>     accept an incoming file
/reject <id> <transfer>     decline an incoming file
/peers  /search <term>      list known peers
/transfers                  list transfers
/whoami  /quit";

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// One line for an event, or None for events not worth printing (intermediate progress).
pub fn render(event: &Event) -> Option<String> {
    let line = match event {
        Event::PeerConnected { peer, name } => format!("* {} ({}) is online", name, peer),
        Event::PeerDisconnected { peer } => format!("* {} went offline", peer),
        Event::Message {
            from_name, text, ..
        } => format!("<{}> {}", from_name, text),
        Event::NewMessageNotice {
            from, from_name, text,
        } => format!("* new message from {} ({}): {}", from_name, from, text),
        Event::FileRequest {
            from,
            from_name,
            filename,
            size,
            transfer_id,
        } => format!(
            "* {} wants to send {} ({}). /accept {} {} or /reject {} {}",
            from_name,
            filename,
            human_size(*size),
            from,
            transfer_id,
            from,
            transfer_id
        ),
        Event::TransferProgress {
            transferred,
            total,
            percent,
            direction,
            transfer_id,
            ..
        } => {
            // Quarters and the final chunk only.
            let quarter = total / 4;
            let at_quarter = quarter > 0 && transferred % quarter == 0;
            if !at_quarter && transferred != total {
                return None;
            }
            let verb = match direction {
                Direction::Sending => "sent",
                Direction::Receiving => "received",
            };
            format!("  [{}] {:.0}% {}", transfer_id, percent, verb)
        }
        Event::TransferFinished {
            peer,
            transfer_id,
            filename,
            status,
            reason,
            ..
        } => match (status, reason) {
            (TransferStatus::Failed, Some(r)) => {
                format!("* transfer {} of {} with {} failed: {}", transfer_id, filename, peer, r)
            }
            _ => format!("* transfer {} of {} with {}: {}", transfer_id, filename, peer, status),
        },
        Event::FileReceived {
            from_name, path, ..
        } => format!("* received file from {}: {}", from_name, path.display()),
        Event::Notice(text) => format!("* {}", text),
    };
    Some(line)
}

pub fn render_peer(entry: &DirectoryEntry) -> String {
    format!(
        "{} {:<20} {:<8} {}:{}",
        if entry.is_online { "●" } else { "○" },
        entry.name,
        entry.id,
        entry.ip,
        entry.port
    )
}

pub fn render_transfer(rec: &TransferRecord) -> String {
    let arrow = match rec.direction {
        Direction::Sending => "→",
        Direction::Receiving => "←",
    };
    format!(
        "[{}] {} {} {} {} {:.0}% {}",
        rec.id,
        arrow,
        rec.peer,
        rec.filename,
        human_size(rec.size),
        rec.percent(),
        rec.status
    )
}

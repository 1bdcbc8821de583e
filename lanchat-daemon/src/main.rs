// LanChat terminal front end: runs a node and drives it from stdin.

use anyhow::Context;
use clap::Parser;
use lanchat_daemon::console::{self, Command};
use lanchat_daemon::{Cli, Config, ConnectTarget, Node};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = cli.resolve().context("loading config")?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let (node, mut events) = Node::start(cfg).await.context("starting node")?;
    let me = node.profile();
    println!(
        "LanChat {} as {} ({}) on {}:{}, files on port {}. /help for commands.",
        env!("CARGO_PKG_VERSION"),
        me.name,
        me.id,
        me.ip,
        me.control_port,
        me.file_port
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            r = &mut shutdown => {
                r?;
                break;
            }
            Some(event) = events.recv() => {
                if let Some(line) = console::render(&event) {
                    println!("{}", line);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match console::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = execute(&node, cmd).await {
                            println!("! {:#}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }
        }
    }
    node.shutdown().await;
    Ok(())
}

async fn execute(node: &Node, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Connect(addr) => {
            println!("connecting to {}...", addr);
            node.connect_in_background(ConnectTarget::Addr(addr));
        }
        Command::ConnectId(id) => {
            println!("connecting to {}...", id);
            node.connect_in_background(ConnectTarget::Known(id));
        }
        Command::Focus(peer) => {
            if let Some(p) = &peer {
                let entry = node
                    .peer(p)
                    .await
                    .with_context(|| format!("unknown peer {}", p))?;
                println!("talking to {} ({})", entry.name, entry.id);
            }
            node.set_focus(peer).await;
        }
        Command::Msg(text) => {
            let peer = node
                .focused()
                .await
                .context("no conversation open; /focus <id> first")?;
            node.send_message(&peer, &text).await?;
        }
        Command::All(text) => {
            let n = node.broadcast(&text).await;
            println!("sent to {} peer(s)", n);
        }
        Command::Send(path) => {
            let peer = node
                .focused()
                .await
                .context("no conversation open; /focus <id> first")?;
            let id = node.send_file(&peer, &path).await?;
            println!("offered {} as transfer {}", path.display(), id);
        }
        Command::Accept(peer, id) => node.respond_file_request(&peer, id, true).await?,
        Command::Reject(peer, id) => node.respond_file_request(&peer, id, false).await?,
        Command::Peers => {
            let peers = node.peers().await;
            let online = peers.iter().filter(|p| p.is_online).count();
            println!("{} online, {} offline", online, peers.len() - online);
            for p in &peers {
                println!("{}", console::render_peer(p));
            }
        }
        Command::Search(term) => {
            for p in node.search(&term).await {
                println!("{}", console::render_peer(&p));
            }
        }
        Command::Transfers => {
            for t in node.transfers().await {
                println!("{}", console::render_transfer(&t));
            }
        }
        Command::WhoAmI => {
            let me = node.profile();
            println!("{} ({}) at {}:{}", me.name, me.id, me.ip, me.control_port);
        }
        Command::Help => println!("{}", console::HELP),
        Command::Quit => {}
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

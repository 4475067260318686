use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info};

// Added for tracing file logging
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use peerchat::core::{EventHandler, HandlerResult};
use peerchat::utils::{format_size, random_id};
use peerchat::{
    ChannelEventPublisher, ChatSession, LoggingEventHandler, PeerIdentity, SessionConfig,
    SessionEvent, TransferId, dispatch_events,
};

#[derive(Parser)]
#[command(author, version, about = "Peer-to-peer chat and file sharing", long_about = None)]
struct Cli {
    /// Name announced to peers (random if omitted)
    #[arg(short, long)]
    identity: Option<String>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory whose files are offered to peers
    #[arg(long)]
    shared: Option<PathBuf>,

    /// Directory where received files are stored
    #[arg(long)]
    downloads: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer to dial at startup, as host:port (repeatable)
    #[arg(long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,

    /// Accept every file offer without asking
    #[arg(long)]
    auto_accept: bool,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "FILE")]
    save_config: Option<PathBuf>,
}

// Function to initialize tracing and file logging
// Returns a WorkerGuard that must be kept alive for logs to be written
fn init_logging(log_file_prefix: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", log_file_prefix);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false); // Don't use ANSI codes in files

    // The terminal is shared with the chat prompt, so only problems go there.
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    // Use RUST_LOG env var, default to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn build_config(cli: &Cli) -> anyhow::Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig {
            identity: format!("peer-{}", random_id(6).to_lowercase()),
            ..SessionConfig::default()
        },
    };
    if let Some(identity) = &cli.identity {
        config.identity = identity.clone();
    }
    if let Some(host) = &cli.host {
        config.listen_host = host.clone();
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(shared) = &cli.shared {
        config.shared_dir = shared.clone();
    }
    if let Some(downloads) = &cli.downloads {
        config.downloads_dir = downloads.clone();
    }
    if cli.auto_accept {
        config.transfer.auto_accept = true;
    }
    config.validate()?;
    Ok(config)
}

fn parse_target(target: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected HOST:PORT, got {:?}", target))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", target))?;
    Ok((host.to_string(), port))
}

/// Prints events for the person at the terminal and draws transfer progress.
struct ConsoleEventHandler {
    bars: Mutex<HashMap<TransferId, ProgressBar>>,
}

impl ConsoleEventHandler {
    fn new() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
        }
    }

    async fn finish_bar(&self, transfer_id: &TransferId, message: String) {
        if let Some(bar) = self.bars.lock().await.remove(transfer_id) {
            bar.finish_and_clear();
        }
        println!("{}", message);
    }
}

#[async_trait]
impl EventHandler for ConsoleEventHandler {
    async fn handle_event(&self, event: SessionEvent) -> HandlerResult<()> {
        match event {
            SessionEvent::PeerJoined { peer, addr, .. } => {
                println!("* {} joined ({})", peer, addr)
            }
            SessionEvent::PeerLeft { peer } => println!("* {} left", peer),
            SessionEvent::ConnectionFailed { addr, reason } => {
                println!("! connection with {} failed: {}", addr, reason)
            }
            SessionEvent::MessageReceived(message) => {
                println!("<{}> {}", message.sender, message.text)
            }
            SessionEvent::FileOffered {
                peer,
                transfer_id,
                filename,
                total_size,
            } => println!(
                "* {} offers {} ({}): /accept {} or /reject {}",
                peer,
                filename,
                format_size(total_size),
                transfer_id,
                transfer_id
            ),
            SessionEvent::TransferProgress {
                transfer_id,
                progress,
                ..
            } => {
                let mut bars = self.bars.lock().await;
                let bar = bars.entry(transfer_id).or_insert_with(|| {
                    let bar = ProgressBar::new(progress.total_bytes);
                    bar.set_style(
                        ProgressStyle::with_template(
                            "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    bar
                });
                bar.set_position(progress.bytes_transferred);
            }
            SessionEvent::FileReceived {
                peer,
                transfer_id,
                path,
            } => {
                self.finish_bar(
                    &transfer_id,
                    format!("* received {} from {}", path.display(), peer),
                )
                .await
            }
            SessionEvent::FileSent { peer, transfer_id } => {
                self.finish_bar(&transfer_id, format!("* {} sent to {}", transfer_id, peer))
                    .await
            }
            SessionEvent::TransferFailed {
                peer,
                transfer_id,
                reason,
            } => {
                self.finish_bar(
                    &transfer_id,
                    format!("! transfer {} with {} failed: {}", transfer_id, peer, reason),
                )
                .await
            }
            SessionEvent::TransferCancelled { peer, transfer_id } => {
                self.finish_bar(
                    &transfer_id,
                    format!("* transfer {} with {} cancelled", transfer_id, peer),
                )
                .await
            }
            SessionEvent::SharedFilesListed { peer, files } => {
                println!("* {} shares {} file(s)", peer, files.len());
                for file in files {
                    println!("  {} ({})", file.name, format_size(file.size));
                }
            }
        }
        Ok(())
    }
}

const HELP: &str = "\
commands:
  /msg <peer> <text>     send a private message
  /send <peer> <file>    offer a file (bare names come from the shared directory)
  /accept <id>           accept a file offer
  /reject <id>           reject a file offer
  /cancel <id>           cancel a transfer
  /peers                 list connected peers
  /files [peer]          list our shared files, or ask a peer for theirs
  /transfers             list active transfers
  /connect <host:port>   dial a peer
  /quit                  leave
  anything else is sent to every peer";

/// Returns `false` once the user asked to quit.
async fn handle_line(session: &ChatSession, line: &str) -> anyhow::Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    if !line.starts_with('/') {
        let count = session.broadcast(line).await?;
        if count == 0 {
            println!("! nobody is connected");
        }
        return Ok(true);
    }

    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let first = parts.next();
    let rest = parts.next();

    match (command, first, rest) {
        ("/quit", _, _) => return Ok(false),
        ("/msg", Some(peer), Some(text)) => {
            session.send_message(&PeerIdentity::from(peer), text).await?
        }
        ("/send", Some(peer), Some(file)) => {
            let id = session.send_file(&PeerIdentity::from(peer), file).await?;
            println!("* offered {} as {}", file, id);
        }
        ("/accept", Some(id), None) => {
            session
                .accept_file(&TransferId::from_string(id.to_string()))
                .await?
        }
        ("/reject", Some(id), None) => {
            session
                .reject_file(&TransferId::from_string(id.to_string()))
                .await?
        }
        ("/cancel", Some(id), None) => {
            session
                .cancel_transfer(&TransferId::from_string(id.to_string()))
                .await?
        }
        ("/peers", None, None) => {
            let peers = session.peers().await;
            if peers.is_empty() {
                println!("No peers connected.");
            }
            for peer in peers {
                println!("  {} at {} ({:?})", peer.identity, peer.remote_addr, peer.direction);
            }
        }
        ("/files", None, None) => {
            for file in session.shared_files().await? {
                println!("  {} ({})", file.name, format_size(file.size));
            }
        }
        ("/files", Some(peer), None) => {
            session
                .request_shared_files(&PeerIdentity::from(peer))
                .await?
        }
        ("/transfers", None, None) => {
            for transfer in session.transfers().await {
                println!(
                    "  {} {:?} {} with {}: {:?} {:.1}%",
                    transfer.transfer_id,
                    transfer.direction,
                    transfer.filename,
                    transfer.peer,
                    transfer.state,
                    transfer.progress().percentage
                );
            }
        }
        ("/connect", Some(target), None) => {
            let (host, port) = parse_target(target)?;
            let peer = session.connect_to(&host, port).await?;
            println!("* connected to {}", peer);
        }
        _ => println!("{}", HELP),
    }
    Ok(true)
}

async fn run_prompt(session: Arc<ChatSession>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match handle_line(&session, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("! {}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if let Some(path) = &cli.save_config {
        config.save_to_file(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    // This guard needs to stay in scope, otherwise logs stop writing.
    let _guard = init_logging("peerchat")?;

    std::fs::create_dir_all(&config.shared_dir)
        .with_context(|| format!("creating {}", config.shared_dir.display()))?;
    std::fs::create_dir_all(&config.downloads_dir)
        .with_context(|| format!("creating {}", config.downloads_dir.display()))?;

    let (publisher, event_rx) = ChannelEventPublisher::new();
    let session = Arc::new(ChatSession::start(config, Arc::new(publisher)).await?);
    println!(
        "{} listening on {} (type /help for commands)",
        session.identity(),
        session.local_addr()
    );

    let handlers: Vec<Arc<dyn EventHandler>> = vec![
        Arc::new(LoggingEventHandler),
        Arc::new(ConsoleEventHandler::new()),
    ];
    let dispatcher = tokio::spawn(dispatch_events(event_rx, handlers));

    for target in &cli.connect {
        let outcome = match parse_target(target) {
            Ok((host, port)) => session.connect_to(&host, port).await.map_err(Into::into),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(peer) => println!("* connected to {}", peer),
            Err(e) => error!("Could not connect to {}: {}", target, e),
        }
    }

    let result = run_prompt(session.clone()).await;
    session.shutdown().await;
    dispatcher.abort();
    result
}

// Conversa server: serves files, logs client chat, lets the operator push messages.

mod config;
mod console;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use conversa_core::router::ChatRouter;
use conversa_core::server::{run_server, ServerContext, ServerEvent};
use conversa_core::PeerRegistry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use console::{Console, SHUTDOWN_NOTICE};

/// Time given to sessions to flush the shutdown notice.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "conversa-server", version, about = "Serve files and chat with connected clients")]
struct Args {
    /// Config file (default: ~/.config/conversa/server.toml, then /etc/conversa/server.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve files from
    #[arg(long)]
    files_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut cfg = config::load(args.config.as_deref());
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(dir) = args.files_dir {
        cfg.files_dir = dir;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(serve(cfg));
    // Console reads stdin on a blocking thread that never returns by itself.
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    if !cfg.files_dir.is_dir() {
        bail!("files directory {} does not exist", cfg.files_dir.display());
    }
    let listener = TcpListener::bind((cfg.bind.as_str(), cfg.port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", cfg.bind, cfg.port))?;
    info!(addr = %listener.local_addr()?, files = %cfg.files_dir.display(), "listening");

    let registry = PeerRegistry::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = ServerContext {
        files_root: cfg.files_dir.clone(),
        registry: registry.clone(),
        events: events_tx,
    };
    tokio::spawn(run_server(listener, ctx));
    tokio::spawn(print_events(events_rx));

    let console = Console::new(ChatRouter::new(registry));
    println!("type a message to broadcast; LIST, @<n|ip:port> <text>, SAIR");
    tokio::select! {
        r = console_loop(&console) => r?,
        r = shutdown_signal() => r?,
    }

    let reached = console.router().broadcast(SHUTDOWN_NOTICE).await;
    info!(clients = reached, "shutting down");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Returns when the operator asks to quit. A closed stdin leaves the server running.
async fn console_loop(console: &Console) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = console.handle(&line).await;
        for out in &reply.lines {
            println!("{}", out);
        }
        if reply.shutdown {
            return Ok(());
        }
    }
    info!("console input closed; stop with Ctrl+C");
    std::future::pending::<()>().await;
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        println!("{}", console::describe(&event));
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

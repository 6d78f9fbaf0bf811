// Conversa client: interactive prompt for chat and file downloads, with live server pushes.

mod commands;
mod config;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use conversa_core::client::{ClientError, ClientEvent, ClientOptions, ClientSession};
use conversa_core::{files, TcpChannel};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use commands::UserCommand;

#[derive(Parser, Debug)]
#[command(name = "conversa-client", version, about = "Chat with a Conversa server and download its files")]
struct Args {
    /// Config file (default: ~/.config/conversa/client.toml, then /etc/conversa/client.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Where downloaded files are written
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut cfg = config::load(args.config.as_deref());
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(dir) = args.downloads_dir {
        cfg.downloads_dir = dir;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg));
    // Prompt reads stdin on a blocking thread that never returns by itself.
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    files::ensure_dir(&cfg.downloads_dir)
        .await
        .with_context(|| format!("cannot create {}", cfg.downloads_dir.display()))?;
    let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("cannot connect to {}:{}", cfg.host, cfg.port))?;
    println!("connected to {}:{}", cfg.host, cfg.port);
    println!("{}", commands::HELP);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let options = ClientOptions {
        download_dir: cfg.downloads_dir.clone(),
        handoff_timeout: cfg.handoff_timeout(),
    };
    let mut session = ClientSession::start(TcpChannel::from_tcp(stream), options, events_tx);
    let hangup = Arc::new(Notify::new());
    tokio::spawn(print_events(events_rx, hangup.clone()));

    prompt_loop(&mut session, &hangup).await
}

async fn prompt_loop<R, W>(session: &mut ClientSession<R, W>, hangup: &Notify) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = hangup.notified() => return Ok(()),
        };
        let Some(line) = line else {
            // End of input: leave politely.
            return quit(session).await;
        };
        let cmd = match commands::parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        let result = match cmd {
            UserCommand::Nothing => Ok(()),
            UserCommand::Help => {
                println!("{}", commands::HELP);
                Ok(())
            }
            UserCommand::Quit => return quit(session).await,
            UserCommand::File(name) => session
                .request_file(&name)
                .await
                .map(|reply| println!("{}", commands::describe_file(&name, &reply))),
            UserCommand::Chat(text) => session.send_chat(&text).await,
            UserCommand::Raw(line) => session
                .send_raw(&line)
                .await
                .map(|msg| println!("server: {}", commands::describe_response(&msg))),
        };
        if let Err(e) = result {
            println!("error: {}", e);
            if e.is_fatal() {
                return Ok(());
            }
        }
    }
}

async fn quit<R, W>(session: &mut ClientSession<R, W>) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match session.quit().await {
        Ok(()) => println!("bye"),
        Err(ClientError::Closed) => println!("connection already closed"),
        Err(e) => warn!("quit: {}", e),
    }
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ClientEvent>, hangup: Arc<Notify>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Push(text) => println!("\n[server] {}", text),
            ClientEvent::Unsolicited(line) => debug!(line = %line, "ignored unsolicited line"),
            ClientEvent::Disconnected => {
                println!("\nserver closed the connection");
                hangup.notify_one();
            }
        }
    }
}

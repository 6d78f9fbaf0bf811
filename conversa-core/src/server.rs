//! Server side: accept loop and one ServerSession per connection.
//!
//! A session waits on two sources at once: the next control line from its
//! client and the push mailbox fed by the ChatRouter. Pushes are written
//! between exchanges, never inside a raw payload window.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ConnectionChannel, TcpChannel};
use crate::files;
use crate::protocol::ControlMessage;
use crate::registry::{PeerRecord, PeerRegistry, PushReceiver};
use crate::transfer::{self, TransferError};
use crate::wire;

/// Reason token sent as `ERRO_<reason>` when a file exists but cannot be read.
pub const REASON_READ_FAILED: &str = "LEITURA_ARQUIVO";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the operator console hears about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { addr: String },
    Disconnected { addr: String },
    Chat { from: String, text: String },
    FileServed { to: String, name: String, size: u64 },
    FileMissing { to: String, name: String },
}

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Shared by every session of one server.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub files_root: PathBuf,
    pub registry: PeerRegistry,
    pub events: EventSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCommand,
    Dispatching,
    Closed,
}

enum Flow {
    Continue,
    Close,
}

enum Step {
    Push(Option<String>),
    Line(Result<Option<String>, ChannelError>),
}

pub struct ServerSession<R, W> {
    channel: ConnectionChannel<R, W>,
    pushes: PushReceiver,
    files_root: PathBuf,
    events: EventSender,
    state: SessionState,
}

impl<R, W> ServerSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(channel: ConnectionChannel<R, W>, pushes: PushReceiver, ctx: &ServerContext) -> Self {
        Self {
            channel,
            pushes,
            files_root: ctx.files_root.clone(),
            events: ctx.events.clone(),
            state: SessionState::AwaitingCommand,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the client quits or the connection fails.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut pushes_open = true;
        let result = loop {
            self.state = SessionState::AwaitingCommand;
            let step = tokio::select! {
                push = self.pushes.recv(), if pushes_open => Step::Push(push),
                line = self.channel.read_line() => Step::Line(line),
            };
            match step {
                Step::Push(Some(text)) => {
                    if let Err(e) = self
                        .channel
                        .write_message(&ControlMessage::ChatPush(text))
                        .await
                    {
                        break Err(e.into());
                    }
                }
                Step::Push(None) => pushes_open = false,
                Step::Line(Ok(None)) => {
                    debug!(peer = %self.channel.label(), "closed without SAIR");
                    break Ok(());
                }
                Step::Line(Err(ChannelError::InvalidUtf8(text))) => {
                    debug!(peer = %self.channel.label(), line = %text, "undecodable command");
                    if let Err(e) = self
                        .channel
                        .write_message(&ControlMessage::UnknownCommand)
                        .await
                    {
                        break Err(e.into());
                    }
                }
                Step::Line(Err(e)) => break Err(e.into()),
                Step::Line(Ok(Some(line))) => {
                    self.state = SessionState::Dispatching;
                    match self.dispatch(&line).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
            }
        };
        self.state = SessionState::Closed;
        result
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow, SessionError> {
        let peer = self.channel.label().to_string();
        match wire::decode(line) {
            ControlMessage::Quit => {
                self.channel.write_message(&ControlMessage::Ok).await?;
                self.channel.shutdown().await?;
                info!(%peer, "client quit");
                return Ok(Flow::Close);
            }
            ControlMessage::FileRequest(name) => self.serve_file(&peer, &name).await?,
            ControlMessage::ChatSend(text) => {
                info!(%peer, "chat: {}", text);
                let _ = self.events.send(ServerEvent::Chat { from: peer, text });
            }
            other => {
                debug!(%peer, ?other, "unknown command");
                self.channel
                    .write_message(&ControlMessage::UnknownCommand)
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn serve_file(&mut self, peer: &str, requested: &str) -> Result<(), SessionError> {
        let Some(path) = files::resolve_existing(&self.files_root, requested).await else {
            info!(%peer, file = requested, "file not found");
            let _ = self.events.send(ServerEvent::FileMissing {
                to: peer.to_string(),
                name: requested.to_string(),
            });
            self.channel
                .write_message(&ControlMessage::FileNotFound)
                .await?;
            return Ok(());
        };
        match transfer::send_file(&mut self.channel, &path).await {
            Ok(meta) => {
                info!(%peer, file = %meta.name, size = meta.size, "file served");
                let _ = self.events.send(ServerEvent::FileServed {
                    to: peer.to_string(),
                    name: meta.name,
                    size: meta.size,
                });
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                warn!(%peer, file = %path.display(), "cannot serve file: {}", e);
                self.channel
                    .write_message(&ControlMessage::Error(REASON_READ_FAILED.to_string()))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Session failure; only that session is torn down.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Accept connections forever, one task per client.
pub async fn run_server(listener: TcpListener, ctx: ServerContext) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Register the peer, run its session, deregister on every exit path.
pub async fn handle_connection(stream: TcpStream, ctx: ServerContext) {
    let channel = TcpChannel::from_tcp(stream);
    let addr = channel.label().to_string();
    let (record, pushes) = PeerRecord::with_mailbox(addr.clone());
    let id = record.id;
    ctx.registry.register(record).await;
    info!(peer = %addr, %id, "client connected");
    let _ = ctx.events.send(ServerEvent::Connected { addr: addr.clone() });

    let session = ServerSession::new(channel, pushes, &ctx);
    if let Err(e) = session.run().await {
        warn!(peer = %addr, "session ended with error: {}", e);
    }

    ctx.registry.unregister(id).await;
    info!(peer = %addr, "client disconnected");
    let _ = ctx.events.send(ServerEvent::Disconnected { addr });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{duplex_pair, write_bytes, DuplexChannel};
    use crate::integrity;
    use crate::protocol::MAX_LINE_LEN;
    use crate::transfer::read_header;

    /// Remote label the server-side duplex channel reports.
    const PEER: &str = "10.0.0.1:5000";

    struct Harness {
        client: DuplexChannel,
        record: PeerRecord,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        task: tokio::task::JoinHandle<Result<(), SessionError>>,
        _root: tempfile::TempDir,
    }

    fn start(files: &[(&str, &[u8])]) -> Harness {
        let root = tempfile::tempdir().unwrap();
        for (name, data) in files {
            std::fs::write(root.path().join(name), data).unwrap();
        }
        let (server_ch, client) = duplex_pair();
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = ServerContext {
            files_root: root.path().to_path_buf(),
            registry: PeerRegistry::new(),
            events: events_tx,
        };
        let (record, pushes) = PeerRecord::with_mailbox(server_ch.label());
        let session = ServerSession::new(server_ch, pushes, &ctx);
        assert_eq!(session.state(), SessionState::AwaitingCommand);
        Harness {
            client,
            record,
            events,
            task: tokio::spawn(session.run()),
            _root: root,
        }
    }

    #[tokio::test]
    async fn quit_answers_ok_and_closes() {
        let mut h = start(&[]);
        h.client.write_line("SAIR").await.unwrap();
        assert_eq!(h.client.read_line().await.unwrap().as_deref(), Some("OK"));
        assert!(h.client.read_line().await.unwrap().is_none());
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_command_keeps_session_open() {
        let mut h = start(&[("a.txt", b"abc")]);
        h.client.write_line("LISTAR tudo").await.unwrap();
        assert_eq!(
            h.client.read_line().await.unwrap().as_deref(),
            Some("ERRO_COMANDO_DESCONHECIDO")
        );
        h.client.write_line("ARQUIVO a.txt").await.unwrap();
        assert_eq!(h.client.read_line().await.unwrap().as_deref(), Some("OK"));
        let meta = read_header(&mut h.client).await.unwrap();
        assert_eq!(meta.size, 3);
        assert_eq!(meta.digest, integrity::digest_bytes(b"abc"));
        h.client.enter_raw(meta.size).unwrap();
        assert_eq!(h.client.read_exact(3).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn missing_file_has_no_payload() {
        let mut h = start(&[]);
        h.client.write_line("ARQUIVO ../secret.txt").await.unwrap();
        h.client.write_line("SAIR").await.unwrap();
        assert_eq!(
            h.client.read_line().await.unwrap().as_deref(),
            Some("ERRO_ARQUIVO_NAO_ENCONTRADO")
        );
        assert_eq!(h.client.read_line().await.unwrap().as_deref(), Some("OK"));
        assert_eq!(
            h.events.recv().await.unwrap(),
            ServerEvent::FileMissing {
                to: PEER.into(),
                name: "../secret.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn chat_is_logged_without_reply() {
        let mut h = start(&[]);
        h.client.write_line("CHAT bom dia").await.unwrap();
        h.client.write_line("SAIR").await.unwrap();
        assert_eq!(
            h.events.recv().await.unwrap(),
            ServerEvent::Chat {
                from: PEER.into(),
                text: "bom dia".into()
            }
        );
        // The first reply is the SAIR acknowledgement: chat got none.
        assert_eq!(h.client.read_line().await.unwrap().as_deref(), Some("OK"));
    }

    #[tokio::test]
    async fn push_is_written_while_idle() {
        let mut h = start(&[]);
        assert!(h.record.push("servidor aqui"));
        assert_eq!(
            h.client.read_line().await.unwrap().as_deref(),
            Some("CHAT_SERVIDOR servidor aqui")
        );
    }

    #[tokio::test]
    async fn push_never_lands_inside_payload() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        let mut h = start(&[("big.bin", &payload)]);
        h.client.write_line("ARQUIVO big.bin").await.unwrap();
        for i in 0..20 {
            assert!(h.record.push(&format!("msg {}", i)));
        }

        let mut pushes = 0;
        let meta = loop {
            let line = h.client.read_line().await.unwrap().unwrap();
            if line.starts_with("CHAT_SERVIDOR ") {
                pushes += 1;
                continue;
            }
            assert_eq!(line, "OK");
            break read_header(&mut h.client).await.unwrap();
        };
        h.client.enter_raw(meta.size).unwrap();
        let got = h.client.read_exact(meta.size as usize).await.unwrap();
        assert_eq!(got, payload);
        while pushes < 20 {
            let line = h.client.read_line().await.unwrap().unwrap();
            assert!(line.starts_with("CHAT_SERVIDOR msg "));
            pushes += 1;
        }
    }

    #[tokio::test]
    async fn client_hangup_ends_session_cleanly() {
        let h = start(&[]);
        drop(h.client);
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn undecodable_line_is_answered_and_session_continues() {
        let mut h = start(&[]);
        write_bytes(&mut h.client, b"CHAT caf\xe9\n").await;
        h.client.write_line("SAIR").await.unwrap();
        assert_eq!(
            h.client.read_line().await.unwrap().as_deref(),
            Some("ERRO_COMANDO_DESCONHECIDO")
        );
        assert_eq!(h.client.read_line().await.unwrap().as_deref(), Some("OK"));
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn overlong_line_ends_only_that_session() {
        let mut h = start(&[]);
        let junk = vec![b'A'; MAX_LINE_LEN + 1];
        let writer = tokio::spawn(async move {
            write_bytes(&mut h.client, &junk).await;
            h.client
        });
        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Channel(ChannelError::LineTooLong(_)))
        ));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn steady_pushes_do_not_starve_commands() {
        let mut h = start(&[]);
        let record = h.record.clone();
        let pusher = tokio::spawn(async move {
            while record.push("flood") {
                tokio::task::yield_now().await;
            }
        });
        h.client.write_line("ARQUIVO nada.txt").await.unwrap();
        let answered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let line = h.client.read_line().await.unwrap().unwrap();
                if line != "CHAT_SERVIDOR flood" {
                    return line;
                }
            }
        })
        .await
        .expect("command starved by pushes");
        assert_eq!(answered, "ERRO_ARQUIVO_NAO_ENCONTRADO");
        pusher.abort();
    }
}

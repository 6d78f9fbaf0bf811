//! Client side: a foreground request loop and a background watcher.
//!
//! Between requests a watcher task owns the channel and surfaces server pushes
//! as they arrive. To issue a request the foreground asks the watcher to hand
//! the channel over (a `PendingHandoff`); the channel value itself travels back
//! through a oneshot, so only one task can ever read it. After the exchange a
//! fresh watcher takes the channel again.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{ChannelError, ConnectionChannel};
use crate::protocol::{ControlMessage, FileMetadata};
use crate::transfer::{self, ReceiveOutcome, TransferError};
use crate::wire;

/// Default bound on a handoff round trip.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(3);

const HANDOFF_QUEUE: usize = 4;

/// What the user should see, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Server push (`CHAT_SERVIDOR`).
    Push(String),
    /// A non-push line that arrived while no request was pending; dropped.
    Unsolicited(String),
    /// Server closed the connection while idle.
    Disconnected,
}

pub type ClientEventSender = mpsc::UnboundedSender<ClientEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Watcher owns the channel.
    Watching,
    /// A request/response exchange owns the channel.
    Foregrounding,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub download_dir: PathBuf,
    pub handoff_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

/// Request to a watcher: stop reading and send the channel back.
pub struct PendingHandoff<R, W> {
    reply: oneshot::Sender<ConnectionChannel<R, W>>,
}

struct Watcher<R, W> {
    requests: mpsc::Sender<PendingHandoff<R, W>>,
    task: JoinHandle<()>,
}

enum WatchStep<R, W> {
    Handoff(Option<PendingHandoff<R, W>>),
    Line(Result<Option<String>, ChannelError>),
}

impl<R, W> Watcher<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn spawn(
        channel: ConnectionChannel<R, W>,
        events: ClientEventSender,
        pending: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (requests, rx) = mpsc::channel(HANDOFF_QUEUE);
        let task = tokio::spawn(watch(channel, rx, events, pending));
        Self { requests, task }
    }
}

async fn watch<R, W>(
    mut channel: ConnectionChannel<R, W>,
    mut requests: mpsc::Receiver<PendingHandoff<R, W>>,
    events: ClientEventSender,
    pending: mpsc::UnboundedSender<String>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let step = tokio::select! {
            biased;
            req = requests.recv() => WatchStep::Handoff(req),
            line = channel.read_line() => WatchStep::Line(line),
        };
        match step {
            WatchStep::Handoff(Some(handoff)) => match handoff.reply.send(channel) {
                Ok(()) => return,
                Err(back) => {
                    warn!("handoff requester gave up; watcher keeps the channel");
                    channel = back;
                }
            },
            // Session dropped: nobody will ever ask for the channel again.
            WatchStep::Handoff(None) => return,
            WatchStep::Line(Ok(Some(line))) => match wire::decode(&line) {
                ControlMessage::ChatPush(text) => {
                    let _ = events.send(ClientEvent::Push(text));
                }
                _ => {
                    let _ = pending.send(line);
                }
            },
            WatchStep::Line(Err(ChannelError::InvalidUtf8(text))) => {
                let _ = events.send(ClientEvent::Unsolicited(text));
            }
            WatchStep::Line(Ok(None)) => {
                let _ = events.send(ClientEvent::Disconnected);
                return;
            }
            WatchStep::Line(Err(e)) => {
                warn!("watcher read failed: {}", e);
                let _ = events.send(ClientEvent::Disconnected);
                return;
            }
        }
    }
}

/// Answer to a file request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileReply {
    Received {
        metadata: FileMetadata,
        outcome: ReceiveOutcome,
    },
    NotFound,
    /// Any other response, e.g. `ERRO_<reason>`.
    Refused(ControlMessage),
}

pub struct ClientSession<R, W> {
    watcher: Option<Watcher<R, W>>,
    state: ClientState,
    events: ClientEventSender,
    pending_tx: mpsc::UnboundedSender<String>,
    pending_rx: mpsc::UnboundedReceiver<String>,
    options: ClientOptions,
}

impl<R, W> ClientSession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Take over a connected channel and start watching it.
    pub fn start(
        channel: ConnectionChannel<R, W>,
        options: ClientOptions,
        events: ClientEventSender,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let watcher = Watcher::spawn(channel, events.clone(), pending_tx.clone());
        Self {
            watcher: Some(watcher),
            state: ClientState::Watching,
            events,
            pending_tx,
            pending_rx,
            options,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// `ARQUIVO <name>`; on success the payload lands in the download dir.
    pub async fn request_file(&mut self, name: &str) -> Result<FileReply, ClientError> {
        let mut channel = self.acquire().await?;
        let result = self.file_exchange(&mut channel, name).await;
        self.finish(channel, result).await
    }

    /// `CHAT <text>`; the server never answers.
    pub async fn send_chat(&mut self, text: &str) -> Result<(), ClientError> {
        let mut channel = self.acquire().await?;
        let result = channel
            .write_message(&ControlMessage::ChatSend(text.to_string()))
            .await
            .map_err(ClientError::from);
        self.finish(channel, result).await
    }

    /// Send a line the client does not interpret and return the server's answer.
    pub async fn send_raw(&mut self, line: &str) -> Result<ControlMessage, ClientError> {
        if wire::decode(line).is_request() {
            return Err(ClientError::NotRaw(line.to_string()));
        }
        let mut channel = self.acquire().await?;
        let result = match channel.write_line(line).await {
            Ok(()) => self.read_response(&mut channel).await,
            Err(e) => Err(e.into()),
        };
        self.finish(channel, result).await
    }

    /// `SAIR`: wait for `OK`, close the connection, no new watcher.
    pub async fn quit(&mut self) -> Result<(), ClientError> {
        let mut channel = self.acquire().await?;
        self.state = ClientState::Closed;
        let reply = match channel.write_message(&ControlMessage::Quit).await {
            Ok(()) => self.read_response(&mut channel).await,
            Err(e) => Err(e.into()),
        };
        let _ = channel.shutdown().await;
        match reply? {
            ControlMessage::Ok => Ok(()),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    async fn file_exchange(
        &mut self,
        channel: &mut ConnectionChannel<R, W>,
        name: &str,
    ) -> Result<FileReply, ClientError> {
        channel
            .write_message(&ControlMessage::FileRequest(name.to_string()))
            .await?;
        match self.read_response(channel).await? {
            ControlMessage::Ok => {
                let metadata = transfer::read_header(channel).await?;
                let outcome =
                    transfer::receive_file(channel, &self.options.download_dir, &metadata).await?;
                Ok(FileReply::Received { metadata, outcome })
            }
            ControlMessage::FileNotFound => Ok(FileReply::NotFound),
            other => Ok(FileReply::Refused(other)),
        }
    }

    /// Next genuine response line. Pushes met on the way are shown, not returned.
    async fn read_response(
        &self,
        channel: &mut ConnectionChannel<R, W>,
    ) -> Result<ControlMessage, ClientError> {
        loop {
            let line = match channel.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(ClientError::Closed),
                Err(ChannelError::InvalidUtf8(text)) => {
                    warn!(line = %text, "skipping undecodable line");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match wire::decode(&line) {
                ControlMessage::ChatPush(text) => {
                    let _ = self.events.send(ClientEvent::Push(text));
                }
                msg => return Ok(msg),
            }
        }
    }

    /// Ask the current watcher for the channel, bounded by the handoff timeout.
    /// On timeout the request is abandoned and the channel stays watched.
    async fn acquire(&mut self) -> Result<ConnectionChannel<R, W>, ClientError> {
        if self.state == ClientState::Closed {
            return Err(ClientError::Closed);
        }
        let Some(watcher) = self.watcher.as_ref() else {
            return Err(ClientError::Closed);
        };
        let (reply, mut granted) = oneshot::channel();
        let requests = watcher.requests.clone();
        let handoff = async {
            requests
                .send(PendingHandoff { reply })
                .await
                .map_err(|_| ClientError::Closed)?;
            (&mut granted).await.map_err(|_| ClientError::Closed)
        };
        let outcome = tokio::time::timeout(self.options.handoff_timeout, handoff).await;
        match outcome {
            Ok(Ok(channel)) => {
                self.take_over();
                Ok(channel)
            }
            Ok(Err(e)) => {
                self.watcher = None;
                self.state = ClientState::Closed;
                Err(e)
            }
            Err(_) => {
                warn!(timeout = ?self.options.handoff_timeout, "handoff timed out");
                // The watcher may have answered just as the deadline passed.
                granted.close();
                if let Ok(channel) = granted.try_recv() {
                    self.take_over();
                    self.rewatch(channel);
                }
                Err(ClientError::HandoffTimeout(self.options.handoff_timeout))
            }
        }
    }

    fn take_over(&mut self) {
        if let Some(old) = self.watcher.take() {
            debug!(finished = old.task.is_finished(), "watcher released channel");
        }
        self.state = ClientState::Foregrounding;
        self.drain_pending();
    }

    fn rewatch(&mut self, channel: ConnectionChannel<R, W>) {
        self.watcher = Some(Watcher::spawn(
            channel,
            self.events.clone(),
            self.pending_tx.clone(),
        ));
        self.state = ClientState::Watching;
    }

    /// Hand the channel to a fresh watcher, or drop it if the exchange broke it.
    async fn finish<T>(
        &mut self,
        mut channel: ConnectionChannel<R, W>,
        result: Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        match &result {
            Err(e) if e.is_fatal() => {
                let _ = channel.shutdown().await;
                self.state = ClientState::Closed;
            }
            _ => self.rewatch(channel),
        }
        result
    }

    /// Lines queued by the watcher arrived before our request; they are not its answer.
    fn drain_pending(&mut self) {
        while let Ok(line) = self.pending_rx.try_recv() {
            warn!(line = %line, "dropping unsolicited line");
            let _ = self.events.send(ClientEvent::Unsolicited(line));
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,
    #[error("channel handoff timed out after {0:?}")]
    HandoffTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] ChannelError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("unexpected response: {0:?}")]
    Unexpected(ControlMessage),
    #[error("{0:?} is a protocol request; use the matching command")]
    NotRaw(String),
}

impl ClientError {
    /// True when the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Closed | ClientError::Transport(_) => true,
            ClientError::Transfer(e) => e.is_fatal(),
            ClientError::HandoffTimeout(_)
            | ClientError::Unexpected(_)
            | ClientError::NotRaw(_) => false,
        }
    }
}

//! Operator console: parse a typed line and act on it through the ChatRouter.

use conversa_core::router::{ChatRouter, Delivery, Target};
use conversa_core::server::ServerEvent;

/// Push sent to everyone before the process exits.
pub const SHUTDOWN_NOTICE: &str = "server shutting down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Blank line.
    Nothing,
    List,
    Push(Target, String),
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("usage: @<index|ip:port> <message>")]
    MissingMessage,
    #[error("{0:?} is neither a list index nor an ip:port address")]
    BadTarget(String),
}

/// `LIST`, `SAIR`, `@<target> <text>`, anything else is a broadcast.
pub fn parse(line: &str) -> Result<OperatorCommand, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(OperatorCommand::Nothing);
    }
    if line.eq_ignore_ascii_case("LIST") {
        return Ok(OperatorCommand::List);
    }
    if line.eq_ignore_ascii_case("SAIR") {
        return Ok(OperatorCommand::Quit);
    }
    let Some(rest) = line.strip_prefix('@') else {
        return Ok(OperatorCommand::Push(Target::All, line.to_string()));
    };
    let (target, text) = rest
        .split_once(char::is_whitespace)
        .map(|(t, m)| (t, m.trim()))
        .ok_or(ParseError::MissingMessage)?;
    if text.is_empty() {
        return Err(ParseError::MissingMessage);
    }
    let target = if let Ok(index) = target.parse::<usize>() {
        Target::Index(index)
    } else if target.contains(':') {
        Target::Address(target.to_string())
    } else {
        return Err(ParseError::BadTarget(target.to_string()));
    };
    Ok(OperatorCommand::Push(target, text.to_string()))
}

/// What the console loop should do next, plus lines for the operator.
#[derive(Debug, Default)]
pub struct Reply {
    pub lines: Vec<String>,
    pub shutdown: bool,
}

pub struct Console {
    router: ChatRouter,
}

impl Console {
    pub fn new(router: ChatRouter) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &ChatRouter {
        &self.router
    }

    pub async fn handle(&self, line: &str) -> Reply {
        let mut reply = Reply::default();
        let cmd = match parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                reply.lines.push(e.to_string());
                return reply;
            }
        };
        match cmd {
            OperatorCommand::Nothing => {}
            OperatorCommand::List => {
                let peers = self.router.list().await;
                if peers.is_empty() {
                    reply.lines.push("no clients connected".to_string());
                }
                for (i, peer) in peers.iter().enumerate() {
                    reply.lines.push(format!("{}. {}", i + 1, peer.addr));
                }
            }
            OperatorCommand::Push(Target::All, text) => {
                let n = self.router.broadcast(&text).await;
                reply.lines.push(format!("sent to {} client(s)", n));
            }
            OperatorCommand::Push(target, text) => match self.router.send(&target, &text).await {
                Ok(deliveries) => {
                    for d in deliveries {
                        reply.lines.push(match d {
                            Delivery::Delivered { addr } => format!("sent to {}", addr),
                            Delivery::PeerGone { addr } => format!("{} already left", addr),
                        });
                    }
                }
                Err(e) => reply.lines.push(e.to_string()),
            },
            OperatorCommand::Quit => reply.shutdown = true,
        }
        reply
    }
}

/// One console line per server event.
pub fn describe(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Connected { addr } => format!("+ {} connected", addr),
        ServerEvent::Disconnected { addr } => format!("- {} disconnected", addr),
        ServerEvent::Chat { from, text } => format!("[{}] {}", from, text),
        ServerEvent::FileServed { to, name, size } => {
            format!("sent {} ({} bytes) to {}", name, size, to)
        }
        ServerEvent::FileMissing { to, name } => format!("{} asked for missing {}", to, name),
    }
}

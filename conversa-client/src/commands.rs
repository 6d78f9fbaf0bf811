//! Prompt input: `arquivo <name>`, `chat <text>`, `sair`, `ajuda`.

use conversa_core::client::FileReply;
use conversa_core::transfer::ReceiveOutcome;
use conversa_core::ControlMessage;

pub const HELP: &str = "\
commands:
  arquivo <name>   download a file
  chat <text>      send a message to the server
  sair             disconnect
  ajuda            this help
anything else is sent to the server as typed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Nothing,
    File(String),
    Chat(String),
    Quit,
    Help,
    /// Sent to the server unchanged.
    Raw(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("usage: arquivo <name>")]
    MissingFileName,
}

pub fn parse(line: &str) -> Result<UserCommand, UsageError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(UserCommand::Nothing);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (line, ""),
    };
    let cmd = match verb.to_ascii_lowercase().as_str() {
        "arquivo" if rest.is_empty() => return Err(UsageError::MissingFileName),
        "arquivo" => UserCommand::File(rest.to_string()),
        "chat" => UserCommand::Chat(rest.to_string()),
        "sair" if rest.is_empty() => UserCommand::Quit,
        "ajuda" | "help" if rest.is_empty() => UserCommand::Help,
        _ => UserCommand::Raw(line.to_string()),
    };
    Ok(cmd)
}

/// Human summary of a file request.
pub fn describe_file(name: &str, reply: &FileReply) -> String {
    match reply {
        FileReply::Received { metadata, outcome } => match outcome {
            ReceiveOutcome::Verified { path } => format!(
                "received {} ({} bytes), checksum ok -> {}",
                metadata.name,
                metadata.size,
                path.display()
            ),
            ReceiveOutcome::Corrupted {
                path,
                expected,
                actual,
            } => format!(
                "WARNING: {} is corrupted (expected {}, got {}); kept at {}",
                metadata.name,
                expected,
                actual,
                path.display()
            ),
        },
        FileReply::NotFound => format!("server has no file named {}", name),
        FileReply::Refused(msg) => format!("server refused {}: {}", name, describe_response(msg)),
    }
}

pub fn describe_response(msg: &ControlMessage) -> String {
    match msg {
        ControlMessage::Ok => "OK".to_string(),
        ControlMessage::UnknownCommand => "unknown command".to_string(),
        ControlMessage::FileNotFound => "file not found".to_string(),
        ControlMessage::Error(reason) => format!("error {}", reason),
        other => conversa_core::encode(other),
    }
}

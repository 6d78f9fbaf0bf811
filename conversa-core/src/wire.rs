//! Framing: newline-terminated UTF-8 control lines; `FileOk` is a 4-line header.

use crate::protocol::{
    ControlMessage, FileMetadata, ERROR_PREFIX, RESP_FILE_NOT_FOUND, RESP_OK,
    RESP_UNKNOWN_COMMAND, VERB_CHAT, VERB_FILE, VERB_PUSH, VERB_QUIT,
};

/// Length of a hex SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Encode a message into the exact bytes sent on the wire, trailing newline included.
pub fn encode(msg: &ControlMessage) -> String {
    match msg {
        ControlMessage::Quit => format!("{}\n", VERB_QUIT),
        ControlMessage::FileRequest(name) => format!("{} {}\n", VERB_FILE, single_line(name)),
        ControlMessage::ChatSend(text) => format!("{} {}\n", VERB_CHAT, single_line(text)),
        ControlMessage::ChatPush(text) => format!("{} {}\n", VERB_PUSH, single_line(text)),
        ControlMessage::Ok => format!("{}\n", RESP_OK),
        ControlMessage::FileOk(meta) => format!(
            "{}\n{}\n{}\n{}\n",
            RESP_OK,
            single_line(&meta.name),
            meta.size,
            meta.digest
        ),
        ControlMessage::FileNotFound => format!("{}\n", RESP_FILE_NOT_FOUND),
        ControlMessage::UnknownCommand => format!("{}\n", RESP_UNKNOWN_COMMAND),
        ControlMessage::Error(reason) => format!("{}{}\n", ERROR_PREFIX, single_line(reason)),
    }
}

/// Decode one control line. Unknown verbs (and known verbs missing a required
/// argument) decode to `UnknownCommand`.
pub fn decode(line: &str) -> ControlMessage {
    let line = strip_newline(line);
    let (verb, rest) = match line.split_once(' ') {
        Some((v, r)) => (v, Some(r)),
        None => (line, None),
    };
    match verb {
        VERB_QUIT if rest.map_or(true, |r| r.trim().is_empty()) => ControlMessage::Quit,
        VERB_FILE => match rest.map(str::trim) {
            Some(name) if !name.is_empty() => ControlMessage::FileRequest(name.to_string()),
            _ => ControlMessage::UnknownCommand,
        },
        VERB_CHAT => ControlMessage::ChatSend(rest.unwrap_or_default().to_string()),
        VERB_PUSH => ControlMessage::ChatPush(rest.unwrap_or_default().to_string()),
        RESP_OK if rest.is_none() => ControlMessage::Ok,
        RESP_FILE_NOT_FOUND if rest.is_none() => ControlMessage::FileNotFound,
        RESP_UNKNOWN_COMMAND if rest.is_none() => ControlMessage::UnknownCommand,
        _ => match line.strip_prefix(ERROR_PREFIX) {
            Some(reason) if !reason.is_empty() => ControlMessage::Error(reason.to_string()),
            _ => ControlMessage::UnknownCommand,
        },
    }
}

/// Decode the three lines following `OK` in a file response.
pub fn decode_file_header(
    name: &str,
    size: &str,
    digest: &str,
) -> Result<FileMetadata, DecodeError> {
    let name = strip_newline(name);
    if name.is_empty() {
        return Err(DecodeError::EmptyName);
    }
    let size_str = strip_newline(size);
    let size = size_str
        .trim()
        .parse::<u64>()
        .map_err(|_| DecodeError::InvalidSize(size_str.to_string()))?;
    let digest = strip_newline(digest).trim().to_ascii_lowercase();
    if digest.len() != DIGEST_HEX_LEN || hex::decode(&digest).is_err() {
        return Err(DecodeError::InvalidDigest(digest));
    }
    Ok(FileMetadata {
        name: name.to_string(),
        size,
        digest,
    })
}

/// Error decoding a file response header.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("file header has an empty name")]
    EmptyName,
    #[error("invalid size field: {0:?}")]
    InvalidSize(String),
    #[error("invalid digest field: {0:?}")]
    InvalidDigest(String),
}

fn strip_newline(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Embedded newlines would split one message into two on the wire.
fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

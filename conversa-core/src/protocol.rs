//! Conversa wire protocol: message types, verbs and defaults.

/// Default TCP port for the server.
pub const DEFAULT_PORT: u16 = 4000;

/// Chunk size for file payload streaming and hashing.
pub const CHUNK_SIZE: usize = 4096;

/// Longest accepted control line, terminator included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

pub const VERB_QUIT: &str = "SAIR";
pub const VERB_FILE: &str = "ARQUIVO";
pub const VERB_CHAT: &str = "CHAT";
pub const VERB_PUSH: &str = "CHAT_SERVIDOR";
pub const RESP_OK: &str = "OK";
pub const RESP_FILE_NOT_FOUND: &str = "ERRO_ARQUIVO_NAO_ENCONTRADO";
pub const RESP_UNKNOWN_COMMAND: &str = "ERRO_COMANDO_DESCONHECIDO";
/// Prefix of every error response; the remainder of the line is the reason.
pub const ERROR_PREFIX: &str = "ERRO_";

/// All control messages. Encoding is one UTF-8 line per message, except
/// `FileOk` which is a 4-line header (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client asks to disconnect.
    Quit,
    /// Client requests a file by name.
    FileRequest(String),
    /// Client chat line; logged server-side, never answered.
    ChatSend(String),
    /// Server-initiated chat line, deliverable at any time.
    ChatPush(String),
    /// Acknowledges `Quit`.
    Ok,
    /// File header; exactly `metadata.size` raw bytes follow.
    FileOk(FileMetadata),
    FileNotFound,
    UnknownCommand,
    /// Generic error with a reason token (`ERRO_<reason>`).
    Error(String),
}

impl ControlMessage {
    /// True for messages a client may send.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ControlMessage::Quit | ControlMessage::FileRequest(_) | ControlMessage::ChatSend(_)
        )
    }
}

/// Declared description of a file payload. Name is a bare file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the payload.
    pub digest: String,
}

/// Framing state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Reads return newline-terminated control lines.
    #[default]
    Line,
    /// Reads return payload bytes, bounded by the declared length.
    Raw,
}

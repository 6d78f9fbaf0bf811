//! Conversa protocol core.
//! Line-delimited control messages, raw file payloads with SHA-256 checks,
//! and operator chat pushes over one TCP connection per client.

pub mod channel;
pub mod client;
pub mod files;
pub mod integrity;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod transfer;
pub mod wire;

pub use channel::{ChannelError, ConnectionChannel, TcpChannel};
pub use client::{ClientError, ClientEvent, ClientOptions, ClientSession, ClientState, FileReply};
pub use integrity::HashStream;
pub use protocol::{ControlMessage, FileMetadata, Mode, CHUNK_SIZE, DEFAULT_PORT};
pub use registry::{PeerId, PeerRecord, PeerRegistry};
pub use router::{ChatRouter, Delivery, RouteError, Target};
pub use server::{run_server, ServerContext, ServerEvent, ServerSession};
pub use transfer::{ReceiveOutcome, TransferError};
pub use wire::{decode, encode, DecodeError};

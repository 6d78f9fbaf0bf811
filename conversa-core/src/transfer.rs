//! File transfer over a ConnectionChannel: header, raw payload, digest check.
//!
//! The sender streams the file twice: once to learn size and digest (both go
//! in the header), once to emit the payload. The receiver hashes while writing.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::channel::{ChannelError, ConnectionChannel};
use crate::files;
use crate::integrity::{self, HashStream};
use crate::protocol::{ControlMessage, FileMetadata, CHUNK_SIZE};
use crate::wire::{self, DecodeError};

/// Send `path` as a `FileOk` header followed by its raw bytes.
///
/// Errors before the header is written leave the connection usable
/// (see `TransferError::is_fatal`).
pub async fn send_file<R, W>(
    channel: &mut ConnectionChannel<R, W>,
    path: &Path,
) -> Result<FileMetadata, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?
        .to_string();
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(TransferError::Source)?;
    let (size, digest) = integrity::digest_file(path)
        .await
        .map_err(TransferError::Source)?;
    let meta = FileMetadata { name, size, digest };

    channel
        .write_message(&ControlMessage::FileOk(meta.clone()))
        .await?;
    channel.enter_raw(size)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < size {
        let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = match file.read(&mut buf[..want]).await {
            Ok(0) => {
                channel.leave_raw();
                return Err(TransferError::Truncated {
                    declared: size,
                    sent,
                });
            }
            Ok(n) => n,
            Err(e) => {
                channel.leave_raw();
                return Err(TransferError::Interrupted(e));
            }
        };
        channel.write_raw(&buf[..n]).await?;
        sent += n as u64;
    }
    debug!(file = %meta.name, size, "payload sent");
    Ok(meta)
}

/// Read the three header lines that follow `OK` in a file response.
pub async fn read_header<R, W>(
    channel: &mut ConnectionChannel<R, W>,
) -> Result<FileMetadata, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut fields = Vec::with_capacity(3);
    for _ in 0..3 {
        match channel.read_line().await? {
            Some(line) => fields.push(line),
            None => return Err(TransferError::Channel(ChannelError::Closed)),
        }
    }
    Ok(wire::decode_file_header(&fields[0], &fields[1], &fields[2])?)
}

/// Receive exactly `meta.size` bytes into `dest_dir`, checking the digest.
///
/// On any failure the partial file is removed. A digest mismatch is not an
/// error: the file is kept and reported as `Corrupted`.
pub async fn receive_file<R, W>(
    channel: &mut ConnectionChannel<R, W>,
    dest_dir: &Path,
    meta: &FileMetadata,
) -> Result<ReceiveOutcome, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    channel.enter_raw(meta.size)?;
    let Some(name) = files::sanitize_name(&meta.name) else {
        channel.discard_raw().await?;
        return Err(TransferError::InvalidName(meta.name.clone()));
    };
    let path = dest_dir.join(name);
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            channel.discard_raw().await?;
            return Err(TransferError::Destination(e));
        }
    };

    let mut stream = HashStream::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    while stream.len() < meta.size {
        let n = match channel.read_raw(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                remove_partial(&path).await;
                return Err(e.into());
            }
        };
        if let Err(e) = file.write_all(&buf[..n]).await {
            drop(file);
            remove_partial(&path).await;
            channel.discard_raw().await?;
            return Err(TransferError::Destination(e));
        }
        stream.update(&buf[..n]);
    }
    if let Err(e) = file.flush().await {
        drop(file);
        remove_partial(&path).await;
        return Err(TransferError::Destination(e));
    }
    drop(file);

    let actual = stream.finalize();
    if integrity::digests_match(&actual, &meta.digest) {
        Ok(ReceiveOutcome::Verified { path })
    } else {
        warn!(file = %path.display(), expected = %meta.digest, %actual, "digest mismatch");
        Ok(ReceiveOutcome::Corrupted {
            path,
            expected: meta.digest.clone(),
            actual,
        })
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(file = %path.display(), "could not remove partial file: {}", e);
    }
}

/// Result of a completed payload read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Verified {
        path: PathBuf,
    },
    /// Payload fully written but its digest differs from the declared one.
    Corrupted {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl ReceiveOutcome {
    pub fn path(&self) -> &Path {
        match self {
            ReceiveOutcome::Verified { path } | ReceiveOutcome::Corrupted { path, .. } => path,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, ReceiveOutcome::Verified { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot read source file: {0}")]
    Source(std::io::Error),
    #[error("source file shrank: declared {declared} bytes, only {sent} available")]
    Truncated { declared: u64, sent: u64 },
    #[error("source read failed mid-payload: {0}")]
    Interrupted(std::io::Error),
    #[error("cannot write destination file: {0}")]
    Destination(std::io::Error),
    #[error("unusable file name: {0:?}")]
    InvalidName(String),
    #[error("malformed file header: {0}")]
    Header(#[from] DecodeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl TransferError {
    /// True when the stream can no longer be trusted to be aligned on a line.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransferError::Source(_) | TransferError::Destination(_) => false,
            TransferError::InvalidName(_) => false,
            TransferError::Truncated { .. }
            | TransferError::Interrupted(_)
            | TransferError::Header(_)
            | TransferError::Channel(_) => true,
        }
    }
}

//! Integrity: incremental SHA-256 over a payload, fed chunk by chunk.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::protocol::CHUNK_SIZE;

/// Incremental digest for one transfer. Consumed by `finalize`.
#[derive(Default)]
pub struct HashStream {
    hasher: Sha256,
    len: u64,
}

impl HashStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Hash a whole buffer. Returns lowercase hex.
pub fn digest_bytes(payload: &[u8]) -> String {
    let mut stream = HashStream::new();
    stream.update(payload);
    stream.finalize()
}

/// Compare a computed digest with a declared one, ignoring hex case.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected)
}

/// Stream a file once and return (size, digest).
pub async fn digest_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut stream = HashStream::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.update(&buf[..n]);
    }
    let size = stream.len();
    Ok((size, stream.finalize()))
}

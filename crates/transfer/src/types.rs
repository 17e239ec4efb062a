use std::path::PathBuf;

use base64::{Engine, engine::general_purpose::STANDARD};

/// A chunk of file data read from the source asset.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
}

impl Chunk {
    /// Length of the raw data in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns `true` if the chunk carries no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Base64-encodes the chunk for the wire.
    pub fn encode(&self) -> EncodedChunk {
        EncodedChunk {
            offset: self.offset,
            len: self.len(),
            body: STANDARD.encode(&self.data),
            checksum: self.checksum.clone(),
        }
    }
}

/// A chunk ready to be sent: base64 body plus the raw-byte coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Cumulative byte offset of the first raw byte.
    pub offset: u64,
    /// Number of raw (decoded) bytes.
    pub len: u64,
    /// Base64 of the raw bytes.
    pub body: String,
    /// SHA-256 hex of the raw bytes.
    pub checksum: String,
}

/// Everything the engine needs to move one asset.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub task_id: String,
    pub source: PathBuf,
    pub write_url: String,
    pub content_type: String,
    pub total_size: u64,
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The remote store acknowledged every byte.
    Completed {
        uploaded_bytes: u64,
        retries: u32,
        requests_sent: u32,
    },
    /// The cancellation token fired; `uploaded_bytes` is the last
    /// acknowledged offset that was kept.
    Cancelled { uploaded_bytes: u64, retries: u32 },
}

impl TransferOutcome {
    /// Bytes the remote store holds for this task.
    pub fn uploaded_bytes(&self) -> u64 {
        match self {
            TransferOutcome::Completed { uploaded_bytes, .. }
            | TransferOutcome::Cancelled { uploaded_bytes, .. } => *uploaded_bytes,
        }
    }

    /// Chunk retries spent during this transfer.
    pub fn retries(&self) -> u32 {
        match self {
            TransferOutcome::Completed { retries, .. }
            | TransferOutcome::Cancelled { retries, .. } => *retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_keeps_raw_coordinates() {
        let chunk = Chunk {
            offset: 8,
            data: b"hello".to_vec(),
            checksum: crate::checksum_bytes(b"hello"),
        };
        let encoded = chunk.encode();
        assert_eq!(encoded.offset, 8);
        assert_eq!(encoded.len, 5);
        assert_eq!(encoded.body, "aGVsbG8=");
        assert_eq!(encoded.checksum, chunk.checksum);
    }
}

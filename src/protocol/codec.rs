//! Message codec with size-triggered gzip compression
//!
//! Values are serialized to JSON. Bodies larger than the threshold are
//! gzipped and the resulting [`Frame`] is flagged as compressed. Decoding
//! trusts only that flag; it never sniffs the bytes.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::messages::{kinds, BatchEnvelope, Frame, Inbound, Message};
use crate::types::{Result, SyncError};

/// Bodies above this many bytes are compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Upper bound on inflated output, guards against compression bombs
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Codec settings
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub compression_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

/// An encoded frame plus the size it had before compression
#[derive(Debug, Clone)]
pub struct Encoded {
    pub frame: Frame,
    pub uncompressed_len: usize,
}

impl Encoded {
    /// Bytes saved by compression (zero when the frame is plain)
    pub fn savings(&self) -> u64 {
        if self.frame.compressed {
            self.uncompressed_len.saturating_sub(self.frame.len()) as u64
        } else {
            0
        }
    }
}

/// JSON + gzip codec shared by the connection manager, the batcher and the
/// offline queue
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    config: CodecConfig,
}

impl MessageCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn with_threshold(compression_threshold: usize) -> Self {
        Self::new(CodecConfig {
            compression_threshold,
        })
    }

    pub fn threshold(&self) -> usize {
        self.config.compression_threshold
    }

    /// Serialize a value, compressing it when it exceeds the threshold
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Encoded> {
        let body = serde_json::to_vec(value).map_err(|e| SyncError::Encode(e.to_string()))?;
        let uncompressed_len = body.len();

        let frame = if uncompressed_len > self.config.compression_threshold {
            Frame {
                payload: compress(&body)?,
                compressed: true,
            }
        } else {
            Frame::plain(body)
        };

        Ok(Encoded {
            frame,
            uncompressed_len,
        })
    }

    /// Encode a single message into a frame
    pub fn encode_message(&self, message: &Message) -> Result<Frame> {
        Ok(self.encode(message)?.frame)
    }

    /// Reverse [`encode`](Self::encode). `compressed` must come from the
    /// frame, not from the bytes.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], compressed: bool) -> Result<T> {
        if compressed {
            let body = decompress(bytes)?;
            Ok(serde_json::from_slice(&body)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    pub fn decode_message(&self, frame: &Frame) -> Result<Message> {
        self.decode(&frame.payload, frame.compressed)
    }

    /// Decode an inbound frame, telling batch envelopes apart from single
    /// messages by their `kind`
    pub fn decode_inbound(&self, frame: &Frame) -> Result<Inbound> {
        let value: Value = self.decode(&frame.payload, frame.compressed)?;

        let is_batch = value.get("kind").and_then(Value::as_str) == Some(kinds::BATCH)
            && value.get("messages").is_some();

        if is_batch {
            let envelope: BatchEnvelope = serde_json::from_value(value)?;
            if envelope.count != envelope.messages.len() {
                return Err(SyncError::Decode(format!(
                    "batch count {} does not match {} messages",
                    envelope.count,
                    envelope.messages.len()
                )));
            }
            Ok(Inbound::Batch(envelope.sealed(frame.compressed)))
        } else {
            Ok(Inbound::Single(serde_json::from_value(value)?))
        }
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SyncError::Encode(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Encode(format!("compression failed: {}", e)))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = decoder
            .read(&mut buffer)
            .map_err(|e| SyncError::Decode(format!("decompression failed: {}", e)))?;
        if read == 0 {
            break;
        }
        if decompressed.len() + read > MAX_DECOMPRESSED_SIZE {
            return Err(SyncError::Decode(format!(
                "decompressed payload exceeds {} bytes",
                MAX_DECOMPRESSED_SIZE
            )));
        }
        decompressed.extend_from_slice(&buffer[..read]);
    }

    Ok(decompressed)
}

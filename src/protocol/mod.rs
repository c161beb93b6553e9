//! Wire protocol for the realtime channel
//!
//! This module contains the message types and the codec that turns them
//! into transport frames.

mod codec;
mod messages;

pub use codec::{
    CodecConfig, Encoded, MessageCodec, DEFAULT_COMPRESSION_THRESHOLD, MAX_DECOMPRESSED_SIZE,
};
pub use messages::{kinds, BatchEnvelope, Frame, Inbound, Message, Priority};

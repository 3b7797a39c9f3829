// src/core/protocol/mod.rs

pub mod codec;
pub mod commands;
pub mod compression;

pub use codec::{Frame, FrameCodec, MAX_FRAME_SIZE, MessagePayload};
pub use commands::{
    AckType, ClientCommand, CompressionType, InitialPosition, LookupType, MessageIdData,
    MessageMetadata, PROTOCOL_VERSION, ServerError, SingleMessageMetadata, SubType,
};

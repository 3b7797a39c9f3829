// src/core/protocol/codec.rs

//! The framed binary codec: `[u32 length][payload]` with a 5 MiB cap.
//!
//! The payload starts with a length-prefixed bincode command. SEND and
//! MESSAGE frames append a checksummed metadata+payload region:
//!
//! ```text
//! [u32 total][u32 cmd-len][command]
//! [u32 crc32][u32 meta-len][metadata][payload]   (SEND / MESSAGE only)
//! ```
//!
//! All integers are big-endian. The checksum is CRC-32/ISO-HDLC over the
//! bytes following it; a mismatch surfaces as a checksum error so producers
//! can resend from the failed sequence id.

use crate::core::DriftError;
use crate::core::protocol::commands::{ClientCommand, MessageMetadata, SingleMessageMetadata};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use tokio_util::codec::{Decoder, Encoder};

/// The hard cap on a single frame, command and payload region included.
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

const LEN_FIELD: usize = 4;
const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The metadata+payload region of a SEND or MESSAGE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePayload {
    pub metadata: MessageMetadata,
    pub data: Bytes,
    /// Whether the region's checksum verified on decode. A corrupted SEND
    /// is answered with a checksum error rather than dropping the
    /// connection, so the producer can resend from that sequence id.
    pub checksum_ok: bool,
}

/// A complete protocol frame: one command, optionally with its message
/// region.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: ClientCommand,
    pub payload: Option<MessagePayload>,
}

impl Frame {
    pub fn command(command: ClientCommand) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn with_payload(command: ClientCommand, metadata: MessageMetadata, data: Bytes) -> Self {
        Self {
            command,
            payload: Some(MessagePayload {
                metadata,
                data,
                checksum_ok: true,
            }),
        }
    }
}

/// A `tokio_util::codec` implementation for the frame layout above.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = DriftError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let cmd_bytes = bincode::encode_to_vec(&item.command, bincode::config::standard())?;

        let region = match &item.payload {
            Some(payload) => {
                let meta_bytes =
                    bincode::encode_to_vec(&payload.metadata, bincode::config::standard())?;
                let mut region =
                    BytesMut::with_capacity(LEN_FIELD + meta_bytes.len() + payload.data.len());
                region.put_u32(meta_bytes.len() as u32);
                region.put_slice(&meta_bytes);
                region.put_slice(&payload.data);
                Some(region.freeze())
            }
            None => None,
        };

        let mut total = LEN_FIELD + cmd_bytes.len();
        if let Some(region) = &region {
            // checksum field + region
            total += LEN_FIELD + region.len();
        }
        if total > MAX_FRAME_SIZE {
            return Err(DriftError::FrameTooLarge(total));
        }

        dst.reserve(LEN_FIELD + total);
        dst.put_u32(total as u32);
        dst.put_u32(cmd_bytes.len() as u32);
        dst.put_slice(&cmd_bytes);
        if let Some(region) = region {
            dst.put_u32(FRAME_CRC.checksum(&region));
            dst.put_slice(&region);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DriftError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < LEN_FIELD {
            return Ok(None);
        }
        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total > MAX_FRAME_SIZE {
            return Err(DriftError::FrameTooLarge(total));
        }
        if src.len() < LEN_FIELD + total {
            src.reserve(LEN_FIELD + total - src.len());
            return Ok(None);
        }
        src.advance(LEN_FIELD);
        let mut frame = src.split_to(total).freeze();

        let cmd_len = read_u32(&mut frame)? as usize;
        if cmd_len > frame.len() {
            return Err(DriftError::Protocol(format!(
                "command length {cmd_len} exceeds frame remainder {}",
                frame.len()
            )));
        }
        let cmd_bytes = frame.split_to(cmd_len);
        // Trailing bytes inside the command slice are ignored: newer peers
        // may append fields this version does not know.
        let (command, _): (ClientCommand, usize) =
            bincode::decode_from_slice(&cmd_bytes, bincode::config::standard())?;

        let payload = if command.carries_payload() {
            let checksum = read_u32(&mut frame)?;
            let checksum_ok = FRAME_CRC.checksum(&frame) == checksum;
            let meta_len = read_u32(&mut frame)? as usize;
            if meta_len > frame.len() {
                return Err(DriftError::Protocol(format!(
                    "metadata length {meta_len} exceeds frame remainder {}",
                    frame.len()
                )));
            }
            let meta_bytes = frame.split_to(meta_len);
            let (metadata, _): (MessageMetadata, usize) =
                bincode::decode_from_slice(&meta_bytes, bincode::config::standard())?;
            Some(MessagePayload {
                metadata,
                data: frame,
                checksum_ok,
            })
        } else {
            None
        };

        Ok(Some(Frame { command, payload }))
    }
}

fn read_u32(buf: &mut Bytes) -> Result<u32, DriftError> {
    if buf.len() < LEN_FIELD {
        return Err(DriftError::Protocol(
            "truncated frame: missing length field".to_string(),
        ));
    }
    Ok(buf.get_u32())
}

/// Serializes batch sub-entries into one payload: each entry is
/// `u32 meta-len; meta; u32 payload-len; payload`.
pub fn serialize_batch(
    entries: &[(SingleMessageMetadata, Bytes)],
) -> Result<Bytes, DriftError> {
    let mut out = BytesMut::new();
    for (meta, data) in entries {
        let meta_bytes = bincode::encode_to_vec(meta, bincode::config::standard())?;
        out.put_u32(meta_bytes.len() as u32);
        out.put_slice(&meta_bytes);
        out.put_u32(data.len() as u32);
        out.put_slice(data);
    }
    Ok(out.freeze())
}

/// Expands a batched payload back into its sub-entries.
pub fn parse_batch(
    mut data: Bytes,
    num_messages: u32,
) -> Result<Vec<(SingleMessageMetadata, Bytes)>, DriftError> {
    let mut entries = Vec::with_capacity(num_messages as usize);
    for _ in 0..num_messages {
        let meta_len = read_u32(&mut data)? as usize;
        if meta_len > data.len() {
            return Err(DriftError::Protocol(
                "truncated batch sub-entry metadata".to_string(),
            ));
        }
        let meta_bytes = data.split_to(meta_len);
        let (meta, _): (SingleMessageMetadata, usize) =
            bincode::decode_from_slice(&meta_bytes, bincode::config::standard())?;
        let payload_len = read_u32(&mut data)? as usize;
        if payload_len > data.len() {
            return Err(DriftError::Protocol(
                "truncated batch sub-entry payload".to_string(),
            ));
        }
        let payload = data.split_to(payload_len);
        entries.push((meta, payload));
    }
    Ok(entries)
}

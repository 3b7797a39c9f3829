use bytes::{Bytes, BytesMut};
use driftmq::core::DriftError;
use driftmq::core::protocol::codec::{parse_batch, serialize_batch};
use driftmq::core::protocol::compression::{compress, decompress};
use driftmq::core::protocol::{
    ClientCommand, CompressionType, Frame, FrameCodec, MAX_FRAME_SIZE, MessageIdData,
    MessageMetadata, SingleMessageMetadata,
};
use tokio_util::codec::{Decoder, Encoder};

fn round_trip(frame: Frame) -> Frame {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf).unwrap();
    codec.decode(&mut buf).unwrap().expect("complete frame")
}

fn test_metadata() -> MessageMetadata {
    MessageMetadata {
        producer_name: "standalone-0".to_string(),
        sequence_id: 7,
        publish_time: 1_700_000_000_000,
        partition_key: Some("k1".to_string()),
        properties: vec![("a".to_string(), "b".to_string())],
        compression: CompressionType::None,
        uncompressed_size: 5,
        num_messages_in_batch: 0,
        encryption_keys: Vec::new(),
    }
}

#[test]
fn test_command_round_trip() {
    let commands = vec![
        ClientCommand::Connect {
            auth_method_name: Some("token".to_string()),
            auth_data: Some(b"secret".to_vec()),
            client_version: "driftmq-0.3".to_string(),
            protocol_version: 2,
            proxy_to_broker_address: None,
        },
        ClientCommand::Connected {
            protocol_version: 2,
        },
        ClientCommand::Lookup {
            topic: "persistent://p/c/n/t".to_string(),
            request_id: 1,
            authoritative: false,
        },
        ClientCommand::Subscribe {
            topic: "persistent://p/c/n/t".to_string(),
            subscription: "sub".to_string(),
            sub_type: driftmq::core::protocol::SubType::Shared,
            consumer_id: 4,
            request_id: 9,
            initial_position: driftmq::core::protocol::InitialPosition::Earliest,
            start_message_id: Some(MessageIdData::new(3, 14)),
        },
        ClientCommand::Ack {
            consumer_id: 4,
            ack_type: driftmq::core::protocol::AckType::Cumulative,
            message_ids: vec![MessageIdData::new(1, 2), MessageIdData::new(1, 3)],
            properties: vec![("watermark".to_string(), "42".to_string())],
        },
        ClientCommand::Ping,
    ];
    for command in commands {
        let decoded = round_trip(Frame::command(command.clone()));
        assert_eq!(decoded.command, command);
        assert!(decoded.payload.is_none());
    }
}

#[test]
fn test_send_frame_round_trip_with_payload() {
    let frame = Frame::with_payload(
        ClientCommand::Send {
            producer_id: 1,
            sequence_id: 7,
            num_messages: 1,
        },
        test_metadata(),
        Bytes::from_static(b"hello"),
    );
    let decoded = round_trip(frame.clone());
    assert_eq!(decoded, frame);
    let payload = decoded.payload.unwrap();
    assert!(payload.checksum_ok);
    assert_eq!(payload.data, Bytes::from_static(b"hello"));
}

#[test]
fn test_length_header_matches_payload() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(
            Frame::command(ClientCommand::Ping),
            &mut buf,
        )
        .unwrap();
    let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    assert_eq!(buf.len(), 4 + total);
}

#[test]
fn test_partial_frame_waits_for_more_bytes() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(Frame::command(ClientCommand::Ping), &mut buf)
        .unwrap();
    let full = buf.clone();
    let mut partial = BytesMut::from(&full[..full.len() - 1]);
    assert!(codec.decode(&mut partial).unwrap().is_none());
    partial.extend_from_slice(&full[full.len() - 1..]);
    assert!(codec.decode(&mut partial).unwrap().is_some());
}

#[test]
fn test_oversize_frame_rejected_on_decode() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
    buf.extend_from_slice(&[0u8; 16]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(DriftError::FrameTooLarge(_))
    ));
}

#[test]
fn test_oversize_frame_rejected_on_encode() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    let frame = Frame::with_payload(
        ClientCommand::Send {
            producer_id: 1,
            sequence_id: 1,
            num_messages: 1,
        },
        test_metadata(),
        Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]),
    );
    assert!(matches!(
        codec.encode(frame, &mut buf),
        Err(DriftError::FrameTooLarge(_))
    ));
}

#[test]
fn test_corrupted_payload_flags_checksum() {
    let mut codec = FrameCodec;
    let mut buf = BytesMut::new();
    codec
        .encode(
            Frame::with_payload(
                ClientCommand::Send {
                    producer_id: 1,
                    sequence_id: 1,
                    num_messages: 1,
                },
                test_metadata(),
                Bytes::from_static(b"hello"),
            ),
            &mut buf,
        )
        .unwrap();
    // Flip a bit in the last payload byte.
    let last = buf.len() - 1;
    buf[last] ^= 0xff;
    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert!(!decoded.payload.unwrap().checksum_ok);
}

#[test]
fn test_batch_serialize_parse_round_trip() {
    let entries = vec![
        (
            SingleMessageMetadata {
                partition_key: Some("a".to_string()),
                properties: vec![],
            },
            Bytes::from_static(b"one"),
        ),
        (
            SingleMessageMetadata {
                partition_key: None,
                properties: vec![("x".to_string(), "y".to_string())],
            },
            Bytes::from_static(b"two"),
        ),
    ];
    let serialized = serialize_batch(&entries).unwrap();
    let parsed = parse_batch(serialized, 2).unwrap();
    assert_eq!(parsed, entries);
}

#[test]
fn test_parse_batch_rejects_truncation() {
    let entries = vec![(
        SingleMessageMetadata {
            partition_key: None,
            properties: vec![],
        },
        Bytes::from_static(b"payload"),
    )];
    let serialized = serialize_batch(&entries).unwrap();
    let truncated = serialized.slice(..serialized.len() - 2);
    assert!(parse_batch(truncated, 1).is_err());
}

#[test]
fn test_compression_round_trips() {
    let data = b"a compressible payload, a compressible payload, a compressible payload";
    for compression in [CompressionType::None, CompressionType::Lz4, CompressionType::Zstd] {
        let compressed = compress(compression, data).unwrap();
        let restored = decompress(compression, &compressed, data.len() as u32).unwrap();
        assert_eq!(&restored[..], &data[..]);
    }
}

#[test]
fn test_decompress_validates_advertised_size() {
    let data = b"payload";
    let compressed = compress(CompressionType::Lz4, data).unwrap();
    assert!(matches!(
        decompress(CompressionType::Lz4, &compressed, 3),
        Err(DriftError::InvalidMessage(_))
    ));
}

//! Property-based tests over the bundle hash ring and the frame codec.

use bytes::{Bytes, BytesMut};
use driftmq::core::bundle::{BundlesDescriptor, FULL_RANGE_END};
use driftmq::core::protocol::{
    ClientCommand, CompressionType, Frame, FrameCodec, MessageMetadata,
};
use driftmq::core::topic::TopicName;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    /// The ring is fully covered and bundles are pairwise disjoint: every
    /// hash lands in exactly one bundle, for arbitrary valid descriptors.
    #[test]
    fn prop_bundles_cover_ring(
        mut interior in proptest::collection::btree_set(1u32..FULL_RANGE_END, 0..32),
        probes in proptest::collection::vec(any::<u32>(), 1..64),
    ) {
        interior.insert(0);
        interior.insert(FULL_RANGE_END);
        let descriptor =
            BundlesDescriptor::from_boundaries(interior.into_iter().collect()).unwrap();
        let bundles = descriptor.bundles();
        for hash in probes {
            let containing = bundles.iter().filter(|b| b.contains(hash)).count();
            prop_assert_eq!(containing, 1, "hash {:#x} must be in exactly one bundle", hash);
            prop_assert!(descriptor.find_bundle(hash).contains(hash));
        }
    }

    /// Every topic resolves to the same bundle as its raw hash.
    #[test]
    fn prop_topic_routing_consistent(
        local in "[a-z0-9-]{1,24}",
        count in 1u32..64,
    ) {
        let topic = TopicName::parse(&format!("persistent://p/c/n/{local}")).unwrap();
        let descriptor = BundlesDescriptor::with_default_bundles(count).unwrap();
        let bundle = descriptor.bundle_for(&topic);
        prop_assert!(bundle.contains(driftmq::core::bundle::hash_of(&topic)));
    }

    /// decode(encode(frame)) is the identity for SEND frames with
    /// arbitrary metadata and payload.
    #[test]
    fn prop_send_frame_round_trip(
        producer_name in "[a-z0-9-]{1,16}",
        sequence_id in any::<u64>(),
        publish_time in any::<u64>(),
        key in proptest::option::of("[a-z]{1,8}"),
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let metadata = MessageMetadata {
            producer_name,
            sequence_id,
            publish_time,
            partition_key: key,
            properties: vec![("k".to_string(), "v".to_string())],
            compression: CompressionType::None,
            uncompressed_size: payload.len() as u32,
            num_messages_in_batch: 0,
            encryption_keys: Vec::new(),
        };
        let frame = Frame::with_payload(
            ClientCommand::Send {
                producer_id: 1,
                sequence_id,
                num_messages: 1,
            },
            metadata,
            Bytes::from(payload),
        );
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, frame);
        prop_assert!(buf.is_empty(), "decode must consume the whole frame");
    }
}

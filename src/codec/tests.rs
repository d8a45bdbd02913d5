//! MQTT Codec Tests
//!
//! Tests for encoding and decoding MQTT v3.1.1 packets, based on MQTT
//! specification sections 2 and 3.

#![allow(clippy::field_reassign_with_default)]

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck, Unsubscribe,
    Will,
};

// ============================================================================
// Helper functions for building test packets
// ============================================================================

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

fn roundtrip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// CONNECT Packet Tests (MQTT-3.1)
// ============================================================================

#[test]
fn test_connect_minimal() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: "c1".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })));
}

#[test]
fn test_connect_full() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: "test-client-123".to_string(),
        clean_session: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from("password")),
        will: Some(Will {
            topic: "last/will/topic".to_string(),
            payload: Bytes::from("goodbye"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    })));
}

#[test]
fn test_connect_wire_bytes() {
    // Hand-checked wire encoding of a minimal CONNECT
    let encoded = encode_packet(&Packet::Connect(Box::new(Connect {
        client_id: "ab".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })));
    let expected = [
        0x10, 0x0E, // CONNECT, remaining length 14
        0x00, 0x04, b'M', b'Q', b'T', b'T', // Protocol name
        0x04, // Protocol level 4
        0x02, // Clean session
        0x00, 0x3C, // Keep alive 60
        0x00, 0x02, b'a', b'b', // Client ID
    ];
    assert_eq!(&encoded[..], &expected[..]);
}

#[test]
fn test_connect_invalid_protocol_name() {
    let invalid = [
        0x10, 0x0C, // CONNECT, remaining length
        0x00, 0x04, b'X', b'Q', b'T', b'T', // Invalid "XQTT"
        0x04, // Protocol level 4
        0x02, // Clean session
        0x00, 0x3C, // Keep alive 60
        0x00, 0x00, // Empty client ID
    ];
    let result = decode_packet(&invalid);
    assert!(matches!(result, Err(DecodeError::InvalidProtocolName)));
}

#[test]
fn test_connect_invalid_protocol_level() {
    let invalid = [
        0x10, 0x0C, //
        0x00, 0x04, b'M', b'Q', b'T', b'T', //
        0x03, // Protocol level 3 (v3.1, not supported)
        0x02, //
        0x00, 0x3C, //
        0x00, 0x00, //
    ];
    let result = decode_packet(&invalid);
    assert!(matches!(
        result,
        Err(DecodeError::InvalidProtocolLevel(3))
    ));
}

#[test]
fn test_connect_password_without_username() {
    // [MQTT-3.1.2-22] password flag requires username flag
    let invalid = [
        0x10, 0x0C, //
        0x00, 0x04, b'M', b'Q', b'T', b'T', //
        0x04, //
        0x42, // Clean session + password flag, no username flag
        0x00, 0x3C, //
        0x00, 0x00, //
    ];
    let result = decode_packet(&invalid);
    assert!(matches!(result, Err(DecodeError::InvalidFlags)));
}

// ============================================================================
// CONNACK Packet Tests (MQTT-3.2)
// ============================================================================

#[test]
fn test_connack_accepted() {
    roundtrip(Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    }));
}

#[test]
fn test_connack_return_codes() {
    for (byte, code) in [
        (1, ConnectReturnCode::UnacceptableProtocolVersion),
        (2, ConnectReturnCode::IdentifierRejected),
        (3, ConnectReturnCode::ServerUnavailable),
        (4, ConnectReturnCode::BadUserNameOrPassword),
        (5, ConnectReturnCode::NotAuthorized),
    ] {
        let wire = [0x20, 0x02, 0x00, byte];
        let decoded = decode_packet(&wire).unwrap();
        assert_eq!(
            decoded,
            Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: code,
            })
        );
    }
}

#[test]
fn test_connack_session_present_on_rejection() {
    // [MQTT-3.2.2-4] session present must be 0 when the connect is rejected
    let wire = [0x20, 0x02, 0x01, 0x05];
    assert!(decode_packet(&wire).is_err());
}

#[test]
fn test_connack_invalid_return_code() {
    let wire = [0x20, 0x02, 0x00, 0x09];
    assert!(matches!(
        decode_packet(&wire),
        Err(DecodeError::InvalidReturnCode(9))
    ));
}

// ============================================================================
// PUBLISH Packet Tests (MQTT-3.3)
// ============================================================================

#[test]
fn test_publish_qos0() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "sensors/temp".to_string(),
        packet_id: None,
        payload: Bytes::from("21.5"),
    }));
}

#[test]
fn test_publish_qos1_retained() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "sensors/temp".to_string(),
        packet_id: Some(42),
        payload: Bytes::from("21.5"),
    }));
}

#[test]
fn test_publish_qos2_dup() {
    roundtrip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "x".to_string(),
        packet_id: Some(7),
        payload: Bytes::new(),
    }));
}

#[test]
fn test_publish_empty_payload() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "empty".to_string(),
        packet_id: None,
        payload: Bytes::new(),
    }));
}

#[test]
fn test_publish_dup_on_qos0_rejected() {
    // DUP must be 0 for QoS 0 messages
    let wire = [
        0x38, 0x06, // PUBLISH with DUP set, QoS 0
        0x00, 0x01, b'a', // topic "a"
        b'x', b'y', b'z', // payload
    ];
    assert!(decode_packet(&wire).is_err());
}

#[test]
fn test_publish_wildcard_topic_rejected() {
    let wire = [
        0x30, 0x05, // PUBLISH QoS 0
        0x00, 0x03, b'a', b'/', b'#', // topic "a/#"
    ];
    assert!(decode_packet(&wire).is_err());
}

#[test]
fn test_publish_zero_packet_id_rejected() {
    let wire = [
        0x32, 0x05, // PUBLISH QoS 1
        0x00, 0x01, b'a', // topic "a"
        0x00, 0x00, // packet id 0
    ];
    assert!(decode_packet(&wire).is_err());
}

// ============================================================================
// PUBACK / PUBREC / PUBREL / PUBCOMP Tests (MQTT-3.4 .. 3.7)
// ============================================================================

#[test]
fn test_qos_ack_roundtrips() {
    roundtrip(Packet::PubAck(PubAck::new(1)));
    roundtrip(Packet::PubRec(PubRec::new(100)));
    roundtrip(Packet::PubRel(PubRel::new(65535)));
    roundtrip(Packet::PubComp(PubComp::new(9)));
}

#[test]
fn test_pubrel_fixed_header_flags() {
    // [MQTT-3.6.1-1] PUBREL must carry flags 0010
    let encoded = encode_packet(&Packet::PubRel(PubRel::new(5)));
    assert_eq!(encoded[0], 0x62);

    let bad_flags = [0x60, 0x02, 0x00, 0x05];
    assert!(matches!(
        decode_packet(&bad_flags),
        Err(DecodeError::InvalidFlags)
    ));
}

// ============================================================================
// SUBSCRIBE / SUBACK Tests (MQTT-3.8 / 3.9)
// ============================================================================

#[test]
fn test_subscribe_multiple_filters() {
    roundtrip(Packet::Subscribe(Subscribe {
        packet_id: 10,
        subscriptions: vec![
            Subscription {
                filter: "a/+".to_string(),
                qos: QoS::AtLeastOnce,
            },
            Subscription {
                filter: "a/#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    }));
}

#[test]
fn test_subscribe_fixed_header_flags() {
    // [MQTT-3.8.1-1] SUBSCRIBE must carry flags 0010
    let encoded = encode_packet(&Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "t".to_string(),
            qos: QoS::AtMostOnce,
        }],
    }));
    assert_eq!(encoded[0], 0x82);
}

#[test]
fn test_subscribe_empty_rejected() {
    // [MQTT-3.8.3-3] SUBSCRIBE must contain at least one filter
    let wire = [0x82, 0x02, 0x00, 0x01];
    assert!(decode_packet(&wire).is_err());
}

#[test]
fn test_suback_mixed_return_codes() {
    roundtrip(Packet::SubAck(SubAck {
        packet_id: 10,
        return_codes: vec![
            SubscribeReturnCode::GrantedQoS1,
            SubscribeReturnCode::GrantedQoS2,
            SubscribeReturnCode::Failure,
        ],
    }));
}

#[test]
fn test_suback_invalid_return_code() {
    let wire = [0x90, 0x03, 0x00, 0x0A, 0x03];
    assert!(matches!(
        decode_packet(&wire),
        Err(DecodeError::InvalidReturnCode(3))
    ));
}

// ============================================================================
// UNSUBSCRIBE / UNSUBACK Tests (MQTT-3.10 / 3.11)
// ============================================================================

#[test]
fn test_unsubscribe_roundtrip() {
    roundtrip(Packet::Unsubscribe(Unsubscribe {
        packet_id: 11,
        filters: vec!["a/+".to_string(), "b".to_string()],
    }));
}

#[test]
fn test_unsuback_roundtrip() {
    roundtrip(Packet::UnsubAck(UnsubAck { packet_id: 11 }));
}

// ============================================================================
// PINGREQ / PINGRESP / DISCONNECT Tests (MQTT-3.12 .. 3.14)
// ============================================================================

#[test]
fn test_ping_and_disconnect() {
    roundtrip(Packet::PingReq);
    roundtrip(Packet::PingResp);
    roundtrip(Packet::Disconnect);

    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);
}

// ============================================================================
// Framing Tests
// ============================================================================

#[test]
fn test_decode_partial_packet() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "partial".to_string(),
        packet_id: Some(3),
        payload: Bytes::from("payload"),
    }));

    // Every proper prefix must decode to "incomplete", never an error
    let mut decoder = Decoder::new();
    for cut in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..cut]).unwrap(), None);
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_decode_two_packets_in_buffer() {
    let mut buf = encode_packet(&Packet::PubAck(PubAck::new(1)));
    buf.extend_from_slice(&encode_packet(&Packet::PingResp));

    let mut decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PubAck(PubAck::new(1)));
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PingResp);
}

#[test]
fn test_decode_oversized_packet() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    let encoded = encode_packet(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "big".to_string(),
        packet_id: None,
        payload: Bytes::from(vec![0u8; 64]),
    }));
    assert!(matches!(
        decoder.decode(&encoded),
        Err(DecodeError::PacketTooLarge)
    ));
}

#[test]
fn test_invalid_remaining_length() {
    // Five continuation bytes exceed the four-byte varint limit
    let wire = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
    assert!(matches!(
        decode_packet(&wire),
        Err(DecodeError::InvalidRemainingLength)
    ));
}

// ============================================================================
// Property-based framing check
// ============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn publish_roundtrip(
            topic in "[a-z0-9/]{1,32}",
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            qos in 0u8..3,
            retain in any::<bool>(),
        ) {
            let qos = QoS::from_u8(qos).unwrap();
            let packet = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic,
                packet_id: if qos == QoS::AtMostOnce { None } else { Some(1) },
                payload: Bytes::from(payload),
            });
            let encoded = encode_packet(&packet);
            let decoded = decode_packet(&encoded).unwrap();
            prop_assert_eq!(packet, decoded);
        }

        #[test]
        fn decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let mut decoder = Decoder::new();
            let _ = decoder.decode(&data);
        }
    }
}

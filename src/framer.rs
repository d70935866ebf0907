use std::io::Cursor;
use std::io::Read;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use crate::models::packet::DisconnectingBody;
use crate::models::packet::HelloBody;
use crate::models::packet::NodeConnectInfo;
use crate::models::packet::OrderInvalidationPortion;
use crate::models::packet::OrderPortion;
use crate::models::packet::Packet;
use crate::models::packet::PacketBody;
use crate::models::packet::PacketHeader;
use crate::models::packet::PacketType;
use crate::models::packet::SanitySwapInitBody;
use crate::models::packet::SwapAcceptedBody;
use crate::models::packet::SwapFailedBody;
use crate::models::packet::SwapRequestBody;
use crate::MAX_FRAME_LENGTH_IN_BYTES;

const LENGTH_PREFIX_BYTES: usize = 4;

/// An error at the framing layer. Any of these closes the peer with reason
/// `WireProtocolErr` and costs the remote node reputation.
#[derive(Debug, Error)]
pub enum FramerError {
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("stream ended mid-frame")]
    UnexpectedEof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed packet codec: a 4-byte big-endian payload length, then the
/// payload. The payload is one type byte, a bincode-encoded header, and the
/// bincode-encoded body for types that carry one.
#[derive(Debug, Default)]
pub struct Framer {}

fn malformed(err: impl std::fmt::Display) -> FramerError {
    FramerError::MalformedPacket(err.to_string())
}

fn decode_packet(payload: &[u8]) -> Result<Packet, FramerError> {
    let Some((&type_byte, rest)) = payload.split_first() else {
        return Err(FramerError::MalformedPacket("empty payload".to_string()));
    };
    let packet_type = PacketType::from_u8(type_byte)
        .ok_or_else(|| FramerError::MalformedPacket(format!("unknown packet type {type_byte}")))?;

    let mut cursor = Cursor::new(rest);
    let header: PacketHeader = bincode::deserialize_from(&mut cursor).map_err(malformed)?;

    let body = match packet_type {
        PacketType::Hello => {
            PacketBody::Hello(bincode::deserialize_from::<_, HelloBody>(&mut cursor).map_err(malformed)?)
        }
        PacketType::SessionInitAck => PacketBody::SessionInitAck,
        PacketType::Ping => PacketBody::Ping,
        PacketType::Pong => PacketBody::Pong,
        PacketType::Disconnecting => PacketBody::Disconnecting(
            bincode::deserialize_from::<_, DisconnectingBody>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::Order => {
            PacketBody::Order(bincode::deserialize_from::<_, OrderPortion>(&mut cursor).map_err(malformed)?)
        }
        PacketType::OrderInvalidation => PacketBody::OrderInvalidation(
            bincode::deserialize_from::<_, OrderInvalidationPortion>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::GetOrders => PacketBody::GetOrders,
        PacketType::Orders => PacketBody::Orders(
            bincode::deserialize_from::<_, Vec<OrderPortion>>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::GetNodes => PacketBody::GetNodes,
        PacketType::Nodes => PacketBody::Nodes(
            bincode::deserialize_from::<_, Vec<NodeConnectInfo>>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::NodeStateUpdate => PacketBody::NodeStateUpdate(
            bincode::deserialize_from(&mut cursor).map_err(malformed)?,
        ),
        PacketType::SanitySwapInit => PacketBody::SanitySwapInit(
            bincode::deserialize_from::<_, SanitySwapInitBody>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::SwapRequest => PacketBody::SwapRequest(
            bincode::deserialize_from::<_, SwapRequestBody>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::SwapAccepted => PacketBody::SwapAccepted(
            bincode::deserialize_from::<_, SwapAcceptedBody>(&mut cursor).map_err(malformed)?,
        ),
        PacketType::SwapFailed => PacketBody::SwapFailed(
            bincode::deserialize_from::<_, SwapFailedBody>(&mut cursor).map_err(malformed)?,
        ),
    };

    let mut trailing = [0u8; 1];
    if cursor.read(&mut trailing).map_err(FramerError::Io)? != 0 {
        return Err(FramerError::MalformedPacket(
            "trailing bytes after packet body".to_string(),
        ));
    }

    Ok(Packet { header, body })
}

fn encode_body(body: &PacketBody, out: &mut Vec<u8>) -> Result<(), FramerError> {
    match body {
        PacketBody::Hello(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::Disconnecting(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::Order(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::OrderInvalidation(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::Orders(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::Nodes(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::NodeStateUpdate(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::SanitySwapInit(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::SwapRequest(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::SwapAccepted(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::SwapFailed(b) => bincode::serialize_into(out, b).map_err(malformed),
        PacketBody::SessionInitAck
        | PacketBody::Ping
        | PacketBody::Pong
        | PacketBody::GetOrders
        | PacketBody::GetNodes => Ok(()),
    }
}

impl Encoder<Packet> for Framer {
    type Error = FramerError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = Vec::with_capacity(64);
        payload.push(packet.packet_type() as u8);
        bincode::serialize_into(&mut payload, &packet.header).map_err(malformed)?;
        encode_body(&packet.body, &mut payload)?;

        if payload.len() > MAX_FRAME_LENGTH_IN_BYTES {
            return Err(FramerError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_BYTES + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for Framer {
    type Item = Packet;
    type Error = FramerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // Reject oversized frames before buffering them.
        if length > MAX_FRAME_LENGTH_IN_BYTES {
            return Err(FramerError::FrameTooLarge(length));
        }

        if src.len() < LENGTH_PREFIX_BYTES + length {
            src.reserve(LENGTH_PREFIX_BYTES + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        let payload = src.split_to(length);
        decode_packet(&payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(FramerError::UnexpectedEof),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use uuid::Uuid;

    use super::*;
    use crate::models::node::Address;
    use crate::models::node::NodePubKey;
    use crate::models::node_state::NodeState;
    use crate::models::packet::DisconnectionReason;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        Framer::default().encode(packet, &mut buf).unwrap();
        buf
    }

    fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, FramerError> {
        Framer::default().decode(buf)
    }

    fn sample_hello() -> Packet {
        let node_state = NodeState {
            addresses: vec![Address::new("192.0.2.7", 9735)],
            pairs: vec!["LTC/BTC".to_string()],
            aux_identifiers: BTreeMap::from([("BTC".to_string(), "regtest".to_string())]),
            aux_pub_keys: BTreeMap::new(),
            aux_uris: BTreeMap::new(),
            token_identifiers: BTreeMap::new(),
        };
        Packet::new(PacketBody::Hello(HelloBody {
            version: "1.0.0".to_string(),
            node_pub_key: NodePubKey::new([0xaa; 32]),
            session_nonce: [7; 32],
            signature: vec![1; 64],
            node_state,
        }))
    }

    #[test]
    fn round_trip_every_packet_type() {
        let packets = vec![
            sample_hello(),
            Packet::new(PacketBody::SessionInitAck),
            Packet::ping(),
            Packet::pong(Uuid::new_v4()),
            Packet::disconnecting(DisconnectionReason::Shutdown, Some("bye".to_string())),
            Packet::new(PacketBody::Order(OrderPortion {
                id: Uuid::new_v4(),
                pair_id: "LTC/BTC".to_string(),
                price: 0.0123,
                quantity: 1_000_000,
                is_buy: true,
            })),
            Packet::new(PacketBody::OrderInvalidation(OrderInvalidationPortion {
                order_id: Uuid::new_v4(),
                pair_id: "LTC/BTC".to_string(),
                quantity: 500,
            })),
            Packet::new(PacketBody::GetOrders),
            Packet::new(PacketBody::Orders(vec![])),
            Packet::new(PacketBody::GetNodes),
            Packet::new(PacketBody::Nodes(vec![NodeConnectInfo {
                pub_key: NodePubKey::new([0xbb; 32]),
                addresses: vec![Address::new("192.0.2.7", 9735)],
            }])),
            Packet::new(PacketBody::NodeStateUpdate(NodeState::default())),
            Packet::new(PacketBody::SanitySwapInit(SanitySwapInitBody {
                currency: "BTC".to_string(),
                r_hash: "ab".repeat(32),
            })),
            Packet::new(PacketBody::SwapRequest(SwapRequestBody {
                order_id: Uuid::new_v4(),
                pair_id: "LTC/BTC".to_string(),
                proposed_quantity: 42,
                r_hash: "cd".repeat(32),
                takers_cltv_delta: 144,
            })),
            Packet::new(PacketBody::SwapAccepted(SwapAcceptedBody {
                r_hash: "cd".repeat(32),
                quantity: 42,
                makers_cltv_delta: 576,
            })),
            Packet::new(PacketBody::SwapFailed(SwapFailedBody {
                r_hash: "cd".repeat(32),
                error_message: Some("no route".to_string()),
            })),
        ];

        for packet in packets {
            let mut buf = encode(packet.clone());
            let decoded = decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, packet, "{} must round-trip", packet.get_type());
            assert!(buf.is_empty());
        }
    }

    // Reference vector: a Ping with a pinned id. The payload layout is one
    // type byte, a bincode header (length-prefixed 16-byte uuid, option tag),
    // and no body.
    #[test]
    fn ping_reference_vector() {
        let id = Uuid::from_bytes([
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
            0xff, 0x00,
        ]);
        let packet = Packet {
            header: PacketHeader { id, req_id: None },
            body: PacketBody::Ping,
        };

        let mut expected = Vec::new();
        expected.extend_from_slice(&26u32.to_be_bytes());
        expected.push(PacketType::Ping as u8);
        expected.extend_from_slice(&16u64.to_le_bytes());
        expected.extend_from_slice(id.as_bytes());
        expected.push(0x00);

        let buf = encode(packet.clone());
        assert_eq!(&buf[..], &expected[..]);

        let mut buf = BytesMut::from(&expected[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn hello_layout_is_stable() {
        let buf = encode(sample_hello());
        let length = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(length, buf.len() - 4);
        assert_eq!(buf[4], PacketType::Hello as u8);
        // uuid header begins with its bincode length prefix
        assert_eq!(&buf[5..13], &16u64.to_le_bytes()[..]);
    }

    #[tokio::test]
    async fn decodes_frames_split_across_reads() {
        use futures::TryStreamExt;
        use tokio_util::codec::FramedRead;

        let packet = Packet::ping();
        let bytes = encode(packet.clone());
        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..10])
            .read(&bytes[10..])
            .build();

        let mut framed = FramedRead::new(mock, Framer::default());
        let decoded = framed.try_next().await.unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(framed.try_next().await.unwrap().is_none());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let full = encode(Packet::ping());
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let full = encode(Packet::ping());
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        let err = Framer::default().decode_eof(&mut partial).unwrap_err();
        assert!(matches!(err, FramerError::UnexpectedEof));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LENGTH_IN_BYTES + 1) as u32);
        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, FramerError::FrameTooLarge(_)));
    }

    #[test]
    fn unknown_packet_type_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xf0);
        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, FramerError::MalformedPacket(_)));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let full = encode(Packet::ping());
        let mut tampered = BytesMut::new();
        let payload_len = (full.len() - 4 + 1) as u32;
        tampered.put_u32(payload_len);
        tampered.extend_from_slice(&full[4..]);
        tampered.put_u8(0xff);
        let err = decode(&mut tampered).unwrap_err();
        assert!(matches!(err, FramerError::MalformedPacket(_)));
    }
}
